//! Startup configuration loading
//!
//! Follows the same shape as a minimal IMAP client's config loader: read
//! a `.env` file if present, then pull required/optional values out of
//! the environment (spec.md §6).

use crate::account::{Account, AccountRegistry, Credentials, Provider};
use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

/// Tunables that shape the Message Pipeline and Admission Queue. Every
/// field has the default the spec documents; all are overridable via
/// environment variables so a deployment can run in the "ultra-fast
/// profile" described in spec.md §4.8.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Recent-message window size per backend (`N` in spec.md §4.8.5).
    pub window_size: usize,
    /// Truncated result size for aggregated (multi-backend) reads.
    pub aggregate_truncate: usize,
    pub max_concurrent: usize,
    pub max_per_second: usize,
    pub idle_debounce: Duration,
    pub idle_cycle_interval: Duration,
}

impl AggregatorSettings {
    /// Defaults for single-account mode (spec.md §4.8, §4.6).
    #[must_use]
    pub fn single_account() -> Self {
        Self {
            window_size: 50,
            aggregate_truncate: 30,
            max_concurrent: 3,
            max_per_second: 5,
            idle_debounce: Duration::from_millis(3_000),
            idle_cycle_interval: Duration::from_secs(25 * 60),
        }
    }

    /// Defaults for aggregated (multi-backend) mode.
    #[must_use]
    pub fn aggregated() -> Self {
        Self {
            window_size: 100,
            max_concurrent: 5,
            max_per_second: 8,
            ..Self::single_account()
        }
    }

    /// Override defaults from environment variables, if present.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize("AGGREGATOR_WINDOW_SIZE") {
            self.window_size = v;
        }
        if let Some(v) = env_usize("AGGREGATOR_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_usize("AGGREGATOR_MAX_PER_SECOND") {
            self.max_per_second = v;
        }
        if let Some(v) = env_usize("AGGREGATOR_IDLE_DEBOUNCE_MS") {
            self.idle_debounce = Duration::from_millis(v as u64);
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Load the Account Registry from configuration.
///
/// Reads `.env` if present (via `dotenvy`), then:
/// - `GMAIL_ACCOUNTS` / `OUTLOOK_ACCOUNTS`: `addr1:pw1:addr2:pw2:…`
/// - legacy single-account fallback: `EMAIL_USER` + `EMAIL_PASSWORD`
///   (classified as Gmail).
///
/// # Errors
///
/// Returns `Error::Config` if any account string has an odd number of
/// colon-delimited elements.
pub fn load_registry_from_env() -> Result<AccountRegistry> {
    dotenvy::dotenv().ok();

    let mut accounts = Vec::new();
    accounts.extend(parse_accounts_var("GMAIL_ACCOUNTS", Provider::Gmail)?);
    accounts.extend(parse_accounts_var("OUTLOOK_ACCOUNTS", Provider::Outlook)?);

    if accounts.is_empty() {
        if let (Ok(user), Ok(password)) = (env::var("EMAIL_USER"), env::var("EMAIL_PASSWORD")) {
            accounts.push(Account::new(user, Provider::Gmail, Credentials::new(password)));
        }
    }

    Ok(AccountRegistry::new(accounts))
}

/// Parse one `addr1:pw1:addr2:pw2:…` environment variable into accounts.
fn parse_accounts_var(key: &str, provider: Provider) -> Result<Vec<Account>> {
    let Ok(raw) = env::var(key) else {
        return Ok(Vec::new());
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() % 2 != 0 {
        return Err(Error::Config(format!(
            "{key} must be an even number of colon-delimited address:password pairs"
        )));
    }

    let mut accounts = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks_exact(2) {
        let [addr, pw] = pair else { unreachable!() };
        accounts.push(Account::new(*addr, provider, Credentials::new(*pw)));
    }
    Ok(accounts)
}
