//! Account Registry
//!
//! Parses backend mailbox credentials at startup and answers routing
//! questions about them. Accounts are immutable once loaded; there is no
//! API to add or remove one at runtime (spec.md §4.1).

use std::fmt;

/// The mail provider a backend account belongs to.
///
/// Only `Gmail` and `Outlook` accounts are registered from configuration.
/// `Domain` is not an account provider — it's a per-message classification
/// applied by the catch-all routing path (spec.md §4.3) and never appears
/// on an `Account`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Domain,
}

impl Provider {
    #[must_use]
    pub const fn imap_host(self) -> &'static str {
        match self {
            Self::Gmail | Self::Domain => "imap.gmail.com",
            Self::Outlook => "outlook.office365.com",
        }
    }

    /// Registrable account providers (excludes `Domain`).
    #[must_use]
    pub const fn is_account_provider(self) -> bool {
        matches!(self, Self::Gmail | Self::Outlook)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Domain => "domain",
        })
    }
}

/// The identity of whoever is asking for a view, supplied by the calling
/// layer per request (spec.md §4.9, §9 glossary). The core never
/// authenticates anyone itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Viewer {
    Anonymous,
    Authenticated,
}

/// An IMAP password, held behind a type that never prints its contents
/// and is never serialized outside the process (spec.md §4.1).
#[derive(Clone)]
pub struct Credentials {
    password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// The raw password. Only `connection.rs` should call this.
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("password", &"***").finish()
    }
}

/// A backend mailbox the core authenticates into via IMAP.
///
/// Created at startup from configuration and immutable thereafter
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct Account {
    pub address: String,
    pub provider: Provider,
    pub imap_host: String,
    pub imap_port: u16,
    pub credentials: Credentials,
}

impl Account {
    #[must_use]
    pub fn new(address: impl Into<String>, provider: Provider, credentials: Credentials) -> Self {
        let address = address.into();
        Self {
            imap_host: provider.imap_host().to_string(),
            imap_port: 993,
            address,
            provider,
            credentials,
        }
    }
}

/// The set of backend accounts known at startup.
///
/// Address comparisons are case-insensitive throughout (spec.md §4.1).
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    #[must_use]
    pub const fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    #[must_use]
    pub fn list_accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Find the account whose address matches `addr` case-insensitively.
    #[must_use]
    pub fn lookup_by_address(&self, addr: &str) -> Option<&Account> {
        self.accounts
            .iter()
            .find(|a| a.address.eq_ignore_ascii_case(addr))
    }

    /// Credentials for a known address, or `None` if unregistered.
    #[must_use]
    pub fn credentials_for(&self, addr: &str) -> Option<&Credentials> {
        self.lookup_by_address(addr).map(|a| &a.credentials)
    }

    /// All accounts for a given provider, in registration order.
    pub fn accounts_for_provider(&self, provider: Provider) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(move |a| a.provider == provider)
    }
}
