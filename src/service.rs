//! Public API Surface
//!
//! `Service` wires together the Account Registry, Connection Manager,
//! Admission Queue, IDLE Listener, Cache Layer, and Message Pipeline
//! into the handful of operations an embedding application calls
//! (spec.md §4.9). Every method here is total: backend outages degrade
//! to stale or empty results and get logged, they never panic or bubble
//! an IMAP error up to the caller (spec.md §7).

use crate::account::{Account, AccountRegistry, Provider, Viewer};
use crate::alias::{self, Alias};
use crate::cache::{self, MessageKey, PayloadKey, TtlLru, ViewKey};
use crate::config::AggregatorSettings;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::idle::{self, ChangeEvent, ChangeReceiver};
use crate::message::{Attachment, Message};
use crate::pipeline::{self, Backend, Coalescer};
use crate::queue::AdmissionQueue;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::warn;

struct Route {
    backend: String,
    is_alias: bool,
}

/// Apply the anonymous-viewer visibility filter (spec.md §4.9, §8
/// invariant 1): an authenticated viewer sees everything; an anonymous
/// one sees only messages where `is_alias` is true.
fn visible_to(messages: &[Message], viewer: Viewer) -> Vec<Message> {
    match viewer {
        Viewer::Authenticated => messages.to_vec(),
        Viewer::Anonymous => messages.iter().filter(|m| m.is_alias).cloned().collect(),
    }
}

/// Per-backend health, exposed read-only for an operator surface.
#[derive(Debug, Clone)]
pub struct BackendStats {
    pub address: String,
    pub cooling_down: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub backends: Vec<BackendStats>,
    pub view_cache_len: usize,
    pub message_store_len: usize,
    pub payload_cache_len: usize,
}

/// The aggregator core. One instance per process; holds one
/// `ConnectionManager`/`AdmissionQueue` pair and one IDLE task per
/// registered account.
pub struct Service {
    registry: AccountRegistry,
    settings: AggregatorSettings,
    connections: HashMap<String, Arc<ConnectionManager>>,
    queues: HashMap<String, AdmissionQueue>,
    catch_all_domains: RwLock<HashMap<String, String>>,
    view_cache: Mutex<TtlLru<ViewKey, Arc<Vec<Message>>>>,
    message_store: Mutex<TtlLru<MessageKey, Message>>,
    payload_cache: Mutex<TtlLru<PayloadKey, Arc<Attachment>>>,
    coalescers: Mutex<HashMap<String, Arc<Coalescer<std::result::Result<Arc<Vec<Message>>, String>>>>>,
    /// Per-backend bookkeeping for spec.md §4.7's "all-messages
    /// timestamp": zeroed (removed) whenever a mutation invalidates that
    /// backend's caches.
    all_messages_fetched_at: Mutex<HashMap<String, Instant>>,
    change_tx: broadcast::Sender<ChangeEvent>,
    idle_handles: Vec<JoinHandle<()>>,
}

impl Service {
    /// Build a `Service` from a loaded registry: one connection/queue
    /// per account, and one IDLE task per account running immediately.
    #[must_use]
    pub fn new(registry: AccountRegistry, settings: AggregatorSettings) -> Self {
        let mut connections = HashMap::new();
        let mut queues = HashMap::new();
        let mut idle_handles = Vec::new();
        let (change_tx, _rx) = broadcast::channel(128);

        for account in registry.list_accounts() {
            let key = account.address.to_lowercase();
            connections.insert(key.clone(), Arc::new(ConnectionManager::new(account.clone())));
            queues.insert(key, AdmissionQueue::new(settings.max_concurrent, settings.max_per_second));
            idle_handles.push(idle::spawn(
                account.clone(),
                settings.idle_debounce,
                settings.idle_cycle_interval,
                change_tx.clone(),
            ));
        }

        Self {
            registry,
            settings,
            connections,
            queues,
            catch_all_domains: RwLock::new(HashMap::new()),
            view_cache: Mutex::new(cache::new_view_cache()),
            message_store: Mutex::new(cache::new_message_store()),
            payload_cache: Mutex::new(cache::new_payload_cache()),
            coalescers: Mutex::new(HashMap::new()),
            all_messages_fetched_at: Mutex::new(HashMap::new()),
            change_tx,
            idle_handles,
        }
    }

    #[must_use]
    pub fn accounts(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Register a domain whose unmatched mail should all land on one
    /// backend's mailbox (spec.md §4.3). The domain is collaborator
    /// supplied, not read from the environment.
    ///
    /// # Errors
    ///
    /// `Error::NotRoutable` if `backend_address` isn't a known account.
    pub fn register_catch_all_domain(&self, domain: &str, backend_address: &str) -> Result<()> {
        let lower = backend_address.to_lowercase();
        if !self.connections.contains_key(&lower) {
            return Err(Error::NotRoutable);
        }
        self.catch_all_domains
            .write()
            .unwrap()
            .insert(domain.to_lowercase(), lower);
        Ok(())
    }

    fn resolve_route(&self, address: &str) -> Option<Route> {
        let lower = address.to_lowercase();
        if let Some(account) = self.registry.lookup_by_address(&lower) {
            return Some(Route {
                backend: account.address.clone(),
                is_alias: false,
            });
        }
        if let Some((_, domain)) = lower.rsplit_once('@') {
            if let Some(backend) = self.catch_all_domains.read().unwrap().get(domain) {
                return Some(Route {
                    backend: backend.clone(),
                    is_alias: true,
                });
            }
        }
        alias::route(&self.registry, &lower).ok().map(|r| Route {
            backend: r.backend,
            is_alias: r.is_alias,
        })
    }

    async fn coalescer_for(
        &self,
        key: &str,
    ) -> Arc<Coalescer<std::result::Result<Arc<Vec<Message>>, String>>> {
        let mut guard = self.coalescers.lock().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Coalescer::new()))
            .clone()
    }

    /// Fetch the recent-window inbox view for an arbitrary recipient
    /// address, routing it to whichever backend should answer for it.
    ///
    /// Returns a cached view when fresh, coalesces concurrent duplicate
    /// requests, and degrades to an empty list (logging the cause)
    /// rather than propagating a backend failure (spec.md §4.8, §7).
    ///
    /// An anonymous `viewer` only ever sees messages where
    /// `Message::is_alias` is true: for a provider account this means
    /// nothing unless the address is itself an alias route, while a
    /// catch-all domain address is shown to everyone since every message
    /// landing there is, by construction, addressed to something other
    /// than the backend's own address (spec.md §4.9 "Visibility rule",
    /// §8 invariant 1).
    pub async fn fetch_for_address(&self, address: &str, viewer: Viewer) -> Vec<Message> {
        let Some(route) = self.resolve_route(address) else {
            warn!(%address, "fetch requested for an address with no known route");
            return Vec::new();
        };

        let scope = address.to_lowercase();
        let key = ViewKey::new(scope.clone(), viewer);
        if let Some(cached) = self.view_cache.lock().await.get(&key) {
            return (**cached).clone();
        }

        let Some(connection) = self.connections.get(&route.backend.to_lowercase()).cloned() else {
            return Vec::new();
        };
        let Some(queue) = self.queues.get(&route.backend.to_lowercase()).cloned() else {
            return Vec::new();
        };

        let window = self.settings.window_size;
        let to_filter = address.to_string();
        let coalescer = self.coalescer_for(&scope).await;
        let result = coalescer
            .run(move || async move {
                pipeline::fetch_recent(connection, queue, window, to_filter)
                    .await
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(messages) => {
                self.remember_messages(&route.backend, &messages).await;
                let visible = Arc::new(visible_to(&messages, viewer));
                self.view_cache.lock().await.set(key, visible.clone());
                (*visible).clone()
            }
            Err(e) => {
                warn!(%address, error = %e, "fetch failed, returning an empty view");
                Vec::new()
            }
        }
    }

    async fn remember_messages(&self, backend: &str, messages: &[Message]) {
        let mut store = self.message_store.lock().await;
        for msg in messages {
            store.set(MessageKey::new(backend.to_lowercase(), msg.uid), msg.clone());
        }
    }

    /// Invalidate every cache entry that holds data sourced from
    /// `backend`, and zero its all-messages timestamp (spec.md §4.7).
    ///
    /// The view cache is keyed by recipient address, not backend — a
    /// single backend can answer for its own address, any number of
    /// aliases, and any catch-all domains routed to it — so there is no
    /// cheap scoped key to retain by; it is cleared wholesale, matching
    /// `refreshAddress`'s "invalidates all caches" (spec.md §4.9).
    async fn invalidate_backend(&self, backend: &str) {
        let backend = backend.to_lowercase();
        self.view_cache.lock().await.clear();
        self.message_store
            .lock()
            .await
            .retain(|k| k.backend != backend);
        self.payload_cache
            .lock()
            .await
            .retain(|k| k.backend != backend);
        self.all_messages_fetched_at.lock().await.remove(&backend);
    }

    /// Force a fresh fetch for `address`, invalidating all of the
    /// affected backend's caches first rather than just the one view
    /// cache entry (spec.md §4.9 `refreshAddress`: "invalidates all
    /// caches then calls fetchForAddress").
    pub async fn refresh_address(&self, address: &str, viewer: Viewer) -> Vec<Message> {
        if let Some(route) = self.resolve_route(address) {
            self.invalidate_backend(&route.backend).await;
        }
        self.fetch_for_address(address, viewer).await
    }

    /// Pull the recent window from every registered account and merge
    /// into one newest-first, truncated list — an operator-facing view
    /// across the whole fleet rather than one recipient (spec.md
    /// §4.8 "aggregated reads").
    pub async fn fetch_all_aggregated(&self) -> Vec<Message> {
        let backends: Vec<Backend> = self
            .registry
            .list_accounts()
            .iter()
            .filter_map(|a| {
                let key = a.address.to_lowercase();
                Some(Backend {
                    connection: self.connections.get(&key)?.clone(),
                    queue: self.queues.get(&key)?.clone(),
                })
            })
            .collect();

        // An aggregated read has no single recipient to filter by; each
        // backend's own address stands in for "anything addressed to
        // this mailbox" in the defensive `To` filter.
        let window = self.settings.window_size;
        let futures = backends.into_iter().map(|b| {
            let to_filter = b.connection.address().to_string();
            pipeline::fetch_recent(b.connection, b.queue, window, to_filter)
        });
        let mut all: Vec<Message> = futures::future::join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| {
                r.inspect_err(|e| warn!(error = %e, "backend fetch failed during aggregate, omitting"))
                    .ok()
            })
            .flatten()
            .collect();
        all.sort_by(|a, b| b.date.cmp(&a.date));
        all.truncate(self.settings.aggregate_truncate);
        all
    }

    /// Delete one message by backend address and UID: flags it
    /// `\Deleted` and expunges it. Invalidates affected caches on
    /// success.
    ///
    /// Returns `false` (logging the cause) instead of propagating an
    /// error if the backend is unknown or the operation fails.
    pub async fn delete_message(&self, backend_address: &str, uid: u32) -> bool {
        let key = backend_address.to_lowercase();
        let (Some(connection), Some(queue)) = (
            self.connections.get(&key).cloned(),
            self.queues.get(&key).cloned(),
        ) else {
            warn!(%backend_address, "delete requested for unknown backend");
            return false;
        };

        let result = queue
            .submit(move || {
                let connection = connection.clone();
                async move {
                    let mut session = connection.ephemeral_session().await?;
                    session
                        .select("INBOX")
                        .await
                        .map_err(|e| Error::Imap(format!("SELECT INBOX failed: {e}")))?;
                    let set = uid.to_string();
                    let mut stream = session
                        .uid_store(&set, "+FLAGS (\\Deleted)")
                        .await
                        .map_err(|e| Error::Imap(format!("STORE failed: {e}")))?;
                    while stream.next().await.is_some() {}
                    drop(stream);
                    session
                        .expunge()
                        .map(|r| r.map_err(|e| Error::Imap(format!("EXPUNGE failed: {e}"))))
                        .collect::<Vec<_>>()
                        .await
                        .into_iter()
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    session.logout().await.ok();
                    Ok::<(), Error>(())
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.message_store
                    .lock()
                    .await
                    .remove(&MessageKey::new(key.clone(), uid));
                self.view_cache.lock().await.clear();
                self.all_messages_fetched_at.lock().await.remove(&key);
                true
            }
            Err(e) => {
                warn!(%backend_address, uid, error = %e, "delete failed");
                false
            }
        }
    }

    /// Fetch and decode one attachment, caching the decoded bytes.
    pub async fn get_attachment(
        &self,
        backend_address: &str,
        uid: u32,
        attachment_index: usize,
    ) -> Option<Attachment> {
        let backend = backend_address.to_lowercase();
        let key = PayloadKey {
            backend: backend.clone(),
            uid,
            attachment_index,
        };
        if let Some(cached) = self.payload_cache.lock().await.get(&key) {
            return Some((**cached).clone());
        }

        let connection = self.connections.get(&backend)?.clone();
        let queue = self.queues.get(&backend)?.clone();

        let result = queue
            .submit(move || {
                let connection = connection.clone();
                async move {
                    let mut session = connection.shared_session().await?;
                    session
                        .select("INBOX")
                        .await
                        .map_err(|e| Error::Imap(format!("SELECT INBOX failed: {e}")))?;
                    let set = uid.to_string();
                    let mut stream = session
                        .uid_fetch(&set, "(BODY.PEEK[])")
                        .await
                        .map_err(|e| Error::Imap(format!("FETCH failed: {e}")))?;
                    let item = stream.next().await.ok_or(Error::NotFound)?;
                    let fetch = item.map_err(|e| Error::Imap(e.to_string()))?;
                    let body = fetch.body().ok_or(Error::NotFound)?.to_vec();
                    drop(stream);
                    crate::message::extract_attachment(&body, attachment_index)
                }
            })
            .await;

        match result {
            Ok(attachment) => {
                self.payload_cache
                    .lock()
                    .await
                    .set(key, Arc::new(attachment.clone()));
                Some(attachment)
            }
            Err(e) => {
                warn!(%backend_address, uid, attachment_index, error = %e, "attachment fetch failed");
                None
            }
        }
    }

    /// Generate a new alias address for a registered account.
    ///
    /// # Errors
    ///
    /// See [`alias::generate_alias`] — these are caller input errors,
    /// not backend outages, so they're surfaced rather than swallowed.
    pub fn generate_alias(
        &self,
        provider: Provider,
        base: &str,
        custom_suffix: Option<&str>,
        use_dot_method: bool,
    ) -> Result<Alias> {
        alias::generate_alias(&self.registry, provider, base, custom_suffix, use_dot_method)
    }

    /// Every registered account's address. There is no per-viewer ACL
    /// modeled — any caller with a `Service` handle sees the whole
    /// registry (see DESIGN.md for the reasoning).
    #[must_use]
    pub fn list_accounts_for_viewer(&self) -> Vec<Account> {
        self.registry.list_accounts().to_vec()
    }

    #[must_use]
    pub async fn stats(&self) -> ServiceStats {
        let backends = self
            .queues
            .iter()
            .map(|(address, queue)| BackendStats {
                address: address.clone(),
                cooling_down: queue.is_cooling_down(),
            })
            .collect();
        ServiceStats {
            backends,
            view_cache_len: self.view_cache.lock().await.len(),
            message_store_len: self.message_store.lock().await.len(),
            payload_cache_len: self.payload_cache.lock().await.len(),
        }
    }

    /// Subscribe to backend-changed notifications from the IDLE
    /// Listener (spec.md §4.5, §4.9 `onChange`).
    #[must_use]
    pub fn on_change(&self) -> ChangeReceiver {
        self.change_tx.subscribe()
    }

    /// Stop accepting new admission-queue work and tear down every
    /// IDLE task. Does not wait for in-flight operations to finish.
    pub fn shutdown(&self) {
        for queue in self.queues.values() {
            queue.shutdown();
        }
        for handle in &self.idle_handles {
            handle.abort();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
