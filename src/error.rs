//! Error types for the inbox aggregator core.
//!
//! Internal plumbing returns `Result<T, Error>` so retry logic can match
//! on variants instead of inspecting message strings (spec.md §9,
//! "Exceptions vs results"). Public `Service` methods never leak `Error`
//! to callers — they degrade to stale/empty results instead (see
//! `service.rs`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("transient IMAP failure: {0}")]
    Transient(String),

    #[error("rate limited for {0}s")]
    RateLimited(u64),

    #[error("not found")]
    NotFound,

    #[error("address is not routable to any known backend")]
    NotRoutable,

    #[error("shutting down")]
    Shutdown,

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, Error>;
