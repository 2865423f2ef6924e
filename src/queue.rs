//! Admission Queue
//!
//! Every IMAP operation against a backend passes through here first. A
//! single driver task enforces the concurrency cap and the per-second
//! rate ceiling, retries a failing job a bounded number of times, and
//! tracks a shared backoff state that opens a cooldown window after an
//! explicit rate-limit signal (spec.md §4.6, §5).

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Max additional attempts after the first, per job (spec.md §4.6).
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_SECS: f64 = 1.0;
const MAX_BACKOFF_SECS: f64 = 30.0;

type JobAttempt = Arc<dyn Fn(bool) -> BoxFuture<'static, bool> + Send + Sync>;

/// One unit of admitted work, identified only by how many times it has
/// already failed. `attempt` is re-invokable: calling it again re-runs
/// the underlying work and, on the final allowed attempt, delivers the
/// result to the original caller.
struct Job {
    retry_count: u32,
    attempt: JobAttempt,
}

#[derive(Debug, Default)]
struct Backoff {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
}

struct QueueState {
    jobs: VecDeque<Job>,
}

/// Gates access to one backend's IMAP connection: bounded concurrency,
/// a per-second submission ceiling, bounded per-job retry, and
/// failure-driven backoff.
#[derive(Clone)]
pub struct AdmissionQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    backoff: Arc<Mutex<Backoff>>,
    shutting_down: Arc<AtomicBool>,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new(max_concurrent: usize, max_per_second: usize) -> Self {
        let state = Arc::new(Mutex::new(QueueState { jobs: VecDeque::new() }));
        let notify = Arc::new(Notify::new());
        let backoff = Arc::new(Mutex::new(Backoff::default()));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        tokio::spawn(Self::drive(
            state.clone(),
            notify.clone(),
            semaphore,
            max_per_second.max(1),
            backoff.clone(),
            shutting_down.clone(),
        ));

        Self {
            state,
            notify,
            backoff,
            shutting_down,
        }
    }

    /// Enqueue a unit of work and await its result.
    ///
    /// `f` may be invoked more than once: a failing job is retried up
    /// to [`MAX_RETRIES`] times, re-running `f` from scratch each time
    /// (spec.md §4.6).
    ///
    /// # Errors
    ///
    /// `Error::Shutdown` if the queue has been shut down, either before
    /// or while this job was still waiting, or whatever the final
    /// attempt's failure was after retries are exhausted.
    pub async fn submit<T, Fut>(&self, f: impl Fn() -> Fut + Send + Sync + 'static) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<T>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let f = Arc::new(f);

        let attempt: JobAttempt = Arc::new(move |is_final: bool| {
            let f = f.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let result = f().await;
                let ok = result.is_ok();
                if ok || is_final {
                    if let Some(sender) = tx.lock().unwrap().take() {
                        let _ = sender.send(result);
                    }
                }
                ok
            }) as BoxFuture<'static, bool>
        });

        self.enqueue(Job { retry_count: 0, attempt })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.state.lock().unwrap().jobs.push_back(job);
        self.notify.notify_one();
        Ok(())
    }

    /// Open a cooldown window immediately, as if the backend had just
    /// signalled rate-limiting (spec.md §4.6 `setRateLimited`).
    pub fn set_rate_limited(&self, cooldown: Duration) {
        warn!(?cooldown, "admission queue entering externally-triggered cooldown");
        self.backoff.lock().unwrap().cooldown_until = Some(Instant::now() + cooldown);
    }

    /// Whether the queue is currently inside an explicit rate-limit
    /// cooldown window. Independent of the consecutive-failure backoff,
    /// which decays continuously rather than expiring at a fixed time.
    #[must_use]
    pub fn is_cooling_down(&self) -> bool {
        self.backoff
            .lock()
            .unwrap()
            .cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Current consecutive-failure count, for tests and operator stats.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().unwrap().consecutive_failures
    }

    /// Stop accepting new work. Jobs already waiting in the queue when
    /// this takes effect are dropped, which resolves their `submit`
    /// callers with `Error::Shutdown`.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    async fn drive(
        state: Arc<Mutex<QueueState>>,
        notify: Arc<Notify>,
        semaphore: Arc<Semaphore>,
        max_per_second: usize,
        backoff: Arc<Mutex<Backoff>>,
        shutting_down: Arc<AtomicBool>,
    ) {
        let mut window_start = Instant::now();
        let mut window_count = 0usize;

        loop {
            if shutting_down.load(Ordering::Acquire) {
                debug!("admission queue draining on shutdown");
                break;
            }

            let job = state.lock().unwrap().jobs.pop_front();
            let Some(mut job) = job else {
                notify.notified().await;
                continue;
            };

            if window_start.elapsed() >= Duration::from_secs(1) {
                window_start = Instant::now();
                window_count = 0;
            }
            if window_count >= max_per_second {
                let remaining = Duration::from_secs(1).saturating_sub(window_start.elapsed());
                tokio::time::sleep(remaining).await;
                window_start = Instant::now();
                window_count = 0;
            }
            window_count += 1;

            let failures = backoff.lock().unwrap().consecutive_failures;
            if failures > 0 {
                tokio::time::sleep(backoff_delay(failures)).await;
                backoff.lock().unwrap().consecutive_failures = failures - 1;
            }

            let wait_until = backoff.lock().unwrap().cooldown_until;
            if let Some(until) = wait_until {
                let now = Instant::now();
                if now < until {
                    tokio::time::sleep(until - now).await;
                }
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let backoff = backoff.clone();
            let state = state.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                let is_final = job.retry_count >= MAX_RETRIES;
                let ok = (job.attempt)(is_final).await;
                drop(permit);
                record_outcome(&backoff, ok);

                if !ok && !is_final {
                    job.retry_count += 1;
                    state.lock().unwrap().jobs.push_front(job);
                    notify.notify_one();
                }
            });
        }
    }
}

fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exp = BASE_BACKOFF_SECS
        * 2f64.powi(i32::try_from(consecutive_failures.saturating_sub(1)).unwrap_or(i32::MAX));
    let capped = exp.min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_secs_f64(capped * jitter)
}

fn record_outcome(backoff: &Arc<Mutex<Backoff>>, ok: bool) {
    let mut state = backoff.lock().unwrap();
    if ok {
        state.consecutive_failures = 0;
    } else {
        state.consecutive_failures += 1;
    }
}
