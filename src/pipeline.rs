//! Message Pipeline
//!
//! Turns a backend's raw IMAP state into the `Vec<Message>` a caller
//! asked for: admission-gated fetch, RFC 5322 parsing, defensive `To`
//! filtering, newest-first ordering, and — for catch-all/aggregated
//! reads — a union across backends (spec.md §4.8).

use crate::connection::{ConnectionManager, FETCH_DEADLINE};
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::message::{self, Message};
use crate::queue::AdmissionQueue;
use futures::StreamExt;
use futures::future::{BoxFuture, Shared, join_all};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

const AGGREGATION_BATCH_SIZE: usize = 3;
const AGGREGATION_BATCH_DELAY: Duration = Duration::from_millis(200);

fn map_flag(flag: &async_imap::types::Flag<'_>) -> Flag {
    match flag {
        async_imap::types::Flag::Seen => Flag::Seen,
        async_imap::types::Flag::Answered => Flag::Answered,
        async_imap::types::Flag::Flagged => Flag::Flagged,
        async_imap::types::Flag::Deleted => Flag::Deleted,
        async_imap::types::Flag::Draft => Flag::Draft,
        async_imap::types::Flag::Custom(name) => Flag::Keyword(name.to_string()),
        other => Flag::Keyword(format!("{other:?}")),
    }
}

/// Fetch the recent-window message list for one backend.
///
/// Goes through the Admission Queue, selects INBOX on the shared
/// session, takes the newest `window` UIDs, fetches and parses them,
/// filters defensively by `to_filter`, and sorts newest-first
/// (spec.md §4.8 steps 1-8).
///
/// # Errors
///
/// Propagates `Error::Shutdown`/`Error::Transient` from the queue or
/// connection, or `Error::Imap` from a failed IMAP command.
pub async fn fetch_recent(
    connection: Arc<ConnectionManager>,
    queue: AdmissionQueue,
    window: usize,
    to_filter: String,
) -> Result<Vec<Message>> {
    queue
        .submit(move || {
            let connection = connection.clone();
            let to_filter = to_filter.clone();
            async move { fetch_recent_inner(&connection, window, &to_filter).await }
        })
        .await
}

async fn fetch_recent_inner(
    connection: &ConnectionManager,
    window: usize,
    to_filter: &str,
) -> Result<Vec<Message>> {
    tokio::time::timeout(FETCH_DEADLINE, async move {
        let mut session = connection.shared_session().await?;

        session
            .select("INBOX")
            .await
            .map_err(|e| Error::Imap(format!("SELECT INBOX failed: {e}")))?;

        let uids = session
            .uid_search("ALL")
            .await
            .map_err(|e| Error::Imap(format!("SEARCH failed: {e}")))?;
        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();

        let start = uid_list.len().saturating_sub(window);
        let recent = &uid_list[start..];
        if recent.is_empty() {
            return Ok(Vec::new());
        }

        let set = recent
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut stream = session
            .uid_fetch(&set, "(BODY.PEEK[] FLAGS)")
            .await
            .map_err(|e| Error::Imap(format!("FETCH failed: {e}")))?;

        let mut messages = Vec::new();
        while let Some(item) = stream.next().await {
            let fetch = match item {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "fetch item error, skipping");
                    continue;
                }
            };
            let Some(body) = fetch.body() else { continue };
            let uid = fetch.uid.unwrap_or_default();
            let flags: Vec<Flag> = fetch.flags().map(|f| map_flag(&f)).collect();
            match message::parse_message(uid, connection.address(), connection.provider(), body, flags) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(%uid, error = %e, "failed to parse message, skipping"),
            }
        }
        drop(stream);

        // Defensive filtering: a server's SEARCH/FETCH can't be fully
        // trusted to have applied recipient scoping correctly.
        messages.retain(|m| m.to.iter().any(|t| t.eq_ignore_ascii_case(to_filter)));
        messages.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(messages)
    })
    .await
    .map_err(|_| Error::Transient("fetch deadline exceeded".to_string()))?
}

/// One backend to pull from during an aggregated (catch-all or
/// multi-account) read.
#[derive(Clone)]
pub struct Backend {
    pub connection: Arc<ConnectionManager>,
    pub queue: AdmissionQueue,
}

/// Fetch from every backend and merge into one newest-first list,
/// truncated to `truncate` entries.
///
/// Runs all backends in parallel when there are few enough of them;
/// beyond [`AGGREGATION_BATCH_SIZE`] backends, runs in batches with a
/// small delay between them so a large fleet doesn't open a connection
/// storm (spec.md §4.8 "aggregated reads").
pub async fn fetch_aggregated(
    backends: Vec<Backend>,
    window: usize,
    truncate: usize,
    to_filter: String,
) -> Vec<Message> {
    let mut all = Vec::new();

    if backends.len() <= AGGREGATION_BATCH_SIZE {
        let results = join_all(backends.into_iter().map(|b| {
            let to_filter = to_filter.clone();
            async move { fetch_recent(b.connection, b.queue, window, to_filter).await }
        }))
        .await;
        collect_ok(results, &mut all);
    } else {
        for chunk in backends.chunks(AGGREGATION_BATCH_SIZE) {
            let results = join_all(chunk.iter().map(|b| {
                let connection = b.connection.clone();
                let queue = b.queue.clone();
                let to_filter = to_filter.clone();
                async move { fetch_recent(connection, queue, window, to_filter).await }
            }))
            .await;
            collect_ok(results, &mut all);
            tokio::time::sleep(AGGREGATION_BATCH_DELAY).await;
        }
    }

    all.sort_by(|a, b| b.date.cmp(&a.date));
    all.truncate(truncate);
    all
}

fn collect_ok(results: Vec<Result<Vec<Message>>>, out: &mut Vec<Message>) {
    for result in results {
        match result {
            Ok(messages) => out.extend(messages),
            Err(e) => warn!(error = %e, "backend fetch failed, omitting from aggregate"),
        }
    }
}

/// Coalesces concurrent identical in-flight requests into one: while a
/// fetch for a given key is already running, later callers await the
/// same result instead of issuing a duplicate IMAP round-trip
/// (spec.md §4.8 "request coalescing").
pub struct Coalescer<T: Clone + Send + 'static> {
    inflight: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone + Send + 'static> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make` unless an equivalent call is already in flight, in
    /// which case await its result instead.
    pub async fn run<F>(&self, make: impl FnOnce() -> F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut guard = self.inflight.lock().await;
        if let Some(shared) = guard.as_ref() {
            let fut = shared.clone();
            drop(guard);
            return fut.await;
        }

        let shared: Shared<BoxFuture<'static, T>> = make().boxed().shared();
        *guard = Some(shared.clone());
        drop(guard);

        let result = shared.await;

        let mut guard = self.inflight.lock().await;
        *guard = None;
        result
    }
}
