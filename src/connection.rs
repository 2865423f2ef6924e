//! Connection Manager
//!
//! Each backend gets one long-lived, shared IMAP session used by fetches
//! and the IDLE Listener, plus on-demand ephemeral sessions for
//! mutating operations like delete. Reconnection uses exponential
//! backoff with jitter, giving up into a cooldown window after repeated
//! failures (spec.md §4.4).

use crate::account::{Account, Provider};
use crate::error::{Error, Result};
use async_imap::Session;
use rand::Rng;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session, connected via implicit TLS (port 993).
pub type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// Deadline for establishing a connection and completing login.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(15);
/// Deadline for a SELECT/SEARCH/FETCH round-trip against an established
/// session.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(20);

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 60.0;

/// Build a TLS connector that accepts all certificates.
///
/// Backends are trusted on first use rather than validated against a
/// CA chain (spec.md §4.4, §9 "trust model").
fn tls_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_secs_f64(capped * jitter)
}

pub(crate) struct SharedState {
    session: Option<ImapSession>,
    reconnect_attempts: u32,
    cooldown_until: Option<Instant>,
}

/// Owns one backend's shared read session and knows how to mint
/// ephemeral ones for mutations.
pub struct ConnectionManager {
    account: Account,
    shared: Mutex<SharedState>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(account: Account) -> Self {
        Self {
            account,
            shared: Mutex::new(SharedState {
                session: None,
                reconnect_attempts: 0,
                cooldown_until: None,
            }),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.account.address
    }

    #[must_use]
    pub const fn provider(&self) -> Provider {
        self.account.provider
    }

    /// Dial a brand new session over implicit TLS and log in.
    ///
    /// # Errors
    ///
    /// `Error::Io`/`Error::Tls` on transport failure, `Error::Imap` if
    /// login is rejected, or `Error::Transient` if the connect/auth
    /// deadline elapses.
    pub async fn dial(&self) -> Result<ImapSession> {
        let addr = format!("{}:{}", self.account.imap_host, self.account.imap_port);
        let address = self.account.address.clone();
        debug!(%addr, %address, "dialing IMAP backend");

        tokio::time::timeout(CONNECT_DEADLINE, async {
            let tcp = TcpStream::connect(&addr).await?;
            let connector = tls_connector();
            let server_name = ServerName::try_from(self.account.imap_host.clone())
                .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;

            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;

            let client = async_imap::Client::new(tls_stream.compat());
            let session = client
                .login(&self.account.address, self.account.credentials.reveal())
                .await
                .map_err(|(e, _)| Error::Imap(format!("login failed: {e}")))?;

            info!(%address, "connected to IMAP backend");
            Ok(session)
        })
        .await
        .map_err(|_| Error::Transient("connect/auth deadline exceeded".to_string()))?
    }

    /// A freshly-dialed session for a single mutating operation, never
    /// stored or reused (spec.md §4.4: "mutations use an ephemeral
    /// session").
    pub async fn ephemeral_session(&self) -> Result<ImapSession> {
        self.dial().await
    }

    /// Borrow the shared long-lived session, reconnecting it first if
    /// necessary.
    ///
    /// # Errors
    ///
    /// `Error::Transient` while the backend is inside a reconnect
    /// cooldown window, or whatever `dial` returned on the latest
    /// attempt.
    pub async fn shared_session(&self) -> Result<MappedMutexGuard<'_, SharedState, ImapSession>> {
        let mut guard = self.shared.lock().await;
        if guard.session.is_none() {
            self.reconnect(&mut guard).await?;
        }
        Ok(MutexGuard::map(guard, |s| {
            s.session.as_mut().expect("just ensured Some above")
        }))
    }

    /// Drop the shared session so the next call to `shared_session`
    /// reconnects from scratch. Called after an IMAP error suggests the
    /// connection is no longer usable.
    pub async fn invalidate_shared_session(&self) {
        self.shared.lock().await.session = None;
    }

    async fn reconnect(&self, state: &mut SharedState) -> Result<()> {
        if let Some(until) = state.cooldown_until {
            if Instant::now() < until {
                return Err(Error::Transient(format!(
                    "{} is cooling down after repeated reconnect failures",
                    self.account.address
                )));
            }
            state.cooldown_until = None;
            state.reconnect_attempts = 0;
        }

        if state.reconnect_attempts > 0 {
            let delay = backoff_delay(state.reconnect_attempts);
            tokio::time::sleep(delay).await;
        }

        match self.dial().await {
            Ok(session) => {
                state.reconnect_attempts = 0;
                state.session = Some(session);
                Ok(())
            }
            Err(e) => {
                state.reconnect_attempts += 1;
                if state.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                    warn!(
                        address = %self.account.address,
                        "giving up reconnecting after {} attempts, cooling down for {:?}",
                        state.reconnect_attempts,
                        RECONNECT_COOLDOWN
                    );
                    state.cooldown_until = Some(Instant::now() + RECONNECT_COOLDOWN);
                    state.reconnect_attempts = 0;
                }
                Err(e)
            }
        }
    }
}

/// Certificate verifier that accepts all certificates. Backends are
/// trusted on first use rather than validated against a CA chain.
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
