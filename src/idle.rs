//! IDLE Listener
//!
//! One dedicated connection per backend sits in IMAP IDLE and notifies
//! subscribers when new mail arrives. Notifications are debounced so a
//! burst of deliveries collapses into a single change event, and the
//! IDLE command is cycled periodically since servers drop long-idle
//! connections (spec.md §4.5).

use crate::account::Account;
use crate::connection::ConnectionManager;
use async_imap::extensions::idle::IdleResponse;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A backend's INBOX changed. Consumers re-fetch from that backend and
/// invalidate their cached view of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub backend: String,
}

pub type ChangeSender = broadcast::Sender<ChangeEvent>;
pub type ChangeReceiver = broadcast::Receiver<ChangeEvent>;

/// Spawn the IDLE loop for one backend. Runs until the process exits;
/// there is no explicit per-backend shutdown handle, only dropping the
/// last `ChangeReceiver` stops consumers from caring about it.
pub fn spawn(account: Account, debounce: Duration, cycle_interval: Duration, tx: ChangeSender) -> JoinHandle<()> {
    tokio::spawn(async move { run(account, debounce, cycle_interval, tx).await })
}

async fn run(account: Account, debounce: Duration, cycle_interval: Duration, tx: ChangeSender) {
    let manager = ConnectionManager::new(account.clone());
    let mut consecutive_errors: u32 = 0;

    loop {
        let session = match manager.dial().await {
            Ok(session) => session,
            Err(e) => {
                consecutive_errors += 1;
                let delay = Duration::from_secs(u64::from(consecutive_errors.min(6)) * 5).min(Duration::from_secs(60));
                warn!(address = %account.address, error = %e, "IDLE connect failed, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        consecutive_errors = 0;

        if let Err(e) = idle_cycle(session, &account, debounce, cycle_interval, &tx).await {
            warn!(address = %account.address, error = %e, "IDLE session ended, reconnecting");
        }
    }
}

async fn idle_cycle(
    mut session: crate::connection::ImapSession,
    account: &Account,
    debounce: Duration,
    cycle_interval: Duration,
    tx: &ChangeSender,
) -> crate::error::Result<()> {
    use crate::error::Error;

    session
        .select("INBOX")
        .await
        .map_err(|e| Error::Imap(format!("IDLE select failed: {e}")))?;

    loop {
        let idle = session.idle();
        let mut idle = idle;
        idle.init()
            .await
            .map_err(|e| Error::Imap(format!("IDLE init failed: {e}")))?;

        let (idle_wait, _interrupt) = idle.wait_with_timeout(cycle_interval);
        let outcome = idle_wait.await;

        session = idle
            .done()
            .await
            .map_err(|e| Error::Imap(format!("IDLE done failed: {e}")))?;

        match outcome {
            Ok(IdleResponse::NewData(_)) => {
                debug!(address = %account.address, "IDLE saw new data, debouncing");
                tokio::time::sleep(debounce).await;
                let _ = tx.send(ChangeEvent {
                    backend: account.address.clone(),
                });
            }
            Ok(IdleResponse::Timeout | IdleResponse::ManualInterrupt) => {
                // 25-minute cycle elapsed (or someone interrupted us);
                // loop back around and re-issue IDLE on the same session.
            }
            Err(e) => return Err(Error::Imap(format!("IDLE wait failed: {e}"))),
        }
    }
}
