#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Multi-tenant IMAP inbox aggregation and control layer
//!
//! Wraps a handful of Gmail/Outlook mailboxes (plus optional catch-all
//! domains) behind one address-routed API: fetch recent mail for an
//! arbitrary recipient address — including generated aliases — without
//! the caller needing to know which physical backend owns it, delete
//! messages, pull attachments, and get notified when new mail lands via
//! IMAP IDLE.

mod account;
mod alias;
mod cache;
mod config;
mod connection;
mod error;
mod flag;
mod idle;
mod message;
mod pipeline;
mod queue;
mod ratelimit;
mod service;

pub use account::{Account, AccountRegistry, Credentials, Provider, Viewer};
pub use alias::{Alias, Route};
pub use config::{AggregatorSettings, load_registry_from_env};
pub use error::{Error, Result};
pub use flag::Flag;
pub use idle::{ChangeEvent, ChangeReceiver};
pub use message::{Attachment, AttachmentMeta, Message};
pub use ratelimit::{ApiRateLimiters, TokenBucket};
pub use service::{BackendStats, Service, ServiceStats};
