//! Porch reconcile runtime.
//!
//! A [`Controller`] owns one [`WorkQueue`] of object keys and a pool of
//! workers that feed keys to a [`Reconciler`]. Each attempt runs under a
//! deadline; retryable failures and timeouts are requeued with per-key
//! exponential backoff. Watch streams are turned into queue entries by
//! [`spawn_forward`], and [`spawn_resync`] re-enqueues everything
//! periodically.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use porch_core::{ObjectKey, PorchError, PorchResult};
use porch_store::WorkQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Converge one object. Must be safe to re-run at any point.
    async fn reconcile(&self, key: &ObjectKey) -> PorchResult<Action>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub workers: usize,
    pub reconcile_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub queue_cap: usize,
    /// 0 disables the periodic resync.
    pub resync_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 4, reconcile_timeout_secs: 30, backoff_base_ms: 50, backoff_max_secs: 60, queue_cap: 4096, resync_secs: 300 }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("PORCH_WORKERS", d.workers).max(1),
            reconcile_timeout_secs: env_or("PORCH_RECONCILE_TIMEOUT_SECS", d.reconcile_timeout_secs),
            backoff_base_ms: env_or("PORCH_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_max_secs: env_or("PORCH_BACKOFF_MAX_SECS", d.backoff_max_secs),
            queue_cap: env_or("PORCH_QUEUE_CAP", d.queue_cap),
            resync_secs: env_or("PORCH_RESYNC_SECS", d.resync_secs),
        }
    }

    pub fn reconcile_timeout(&self) -> Duration { Duration::from_secs(self.reconcile_timeout_secs.max(1)) }
    pub fn resync(&self) -> Option<Duration> { (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)) }
}

pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    cfg: ControllerConfig,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self { reconciler: Arc::clone(&self.reconciler), queue: Arc::clone(&self.queue), cfg: self.cfg.clone() }
    }
}

/// Result of one attempt, as counted in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Done,
    Requeued,
    Retried,
    Failed,
}

impl Attempt {
    fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Requeued => "requeued",
            Self::Retried => "retried",
            Self::Failed => "failed",
        }
    }
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, cfg: &ControllerConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(
            reconciler.name(),
            cfg.queue_cap,
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_secs(cfg.backoff_max_secs),
        ));
        Self { reconciler, queue, cfg: cfg.clone() }
    }

    pub fn name(&self) -> &'static str { self.reconciler.name() }

    pub fn reconciler(&self) -> &Arc<R> { &self.reconciler }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> { Arc::clone(&self.queue) }

    pub fn enqueue(&self, key: ObjectKey) { self.queue.add(key) }

    /// Reconcile `key` once under the deadline and schedule any follow-up.
    pub async fn process(&self, key: &ObjectKey) -> Attempt {
        let name = self.reconciler.name();
        let started = Instant::now();
        let res = match tokio::time::timeout(self.cfg.reconcile_timeout(), self.reconciler.reconcile(key)).await {
            Ok(r) => r,
            Err(_) => Err(PorchError::backend(format!("reconcile exceeded {}s deadline", self.cfg.reconcile_timeout_secs))),
        };
        let took_ms = started.elapsed().as_millis() as u64;
        let attempt = match res {
            Ok(Action::Done) => {
                self.queue.forget(key);
                debug!(controller = name, key = %key, took_ms, "reconciled");
                Attempt::Done
            }
            Ok(Action::RequeueAfter(after)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), after);
                debug!(controller = name, key = %key, after_ms = after.as_millis() as u64, "reconciled; requeue scheduled");
                Attempt::Requeued
            }
            Err(e) if e.is_retryable() => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(controller = name, key = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed; retrying");
                Attempt::Retried
            }
            Err(e) => {
                self.queue.forget(key);
                warn!(controller = name, key = %key, error = %e, kind = e.kind(), "reconcile failed");
                Attempt::Failed
            }
        };
        counter!("porch_reconcile_total", 1u64, "controller" => name, "result" => attempt.as_str());
        histogram!("porch_reconcile_ms", took_ms as f64, "controller" => name);
        attempt
    }

    /// Start the worker pool. Workers exit when `cancel` fires, abandoning
    /// any attempt in flight.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let n = self.cfg.workers.max(1);
        info!(controller = self.name(), workers = n, "controller started");
        (0..n)
            .map(|id| {
                let me = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { me.worker(id, cancel).await })
            })
            .collect()
    }

    async fn worker(&self, id: usize, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.get() => {
                    let Some(key) = next else { break };
                    // shutdown abandons the attempt at its next suspension point
                    let aborted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = self.process(&key) => false,
                    };
                    self.queue.done(&key);
                    if aborted {
                        debug!(controller = self.name(), worker = id, key = %key, "attempt aborted by shutdown");
                        break;
                    }
                }
            }
        }
        debug!(controller = self.name(), worker = id, "worker stopped");
    }

    /// Process whatever is queued right now on the calling task; returns the
    /// number of attempts. Delayed requeues are left to the workers.
    pub async fn drain(&self) -> usize {
        let mut n = 0;
        while let Some(key) = self.queue.try_get() {
            self.process(&key).await;
            self.queue.done(&key);
            n += 1;
        }
        n
    }
}

/// Turn a broadcast stream into queue entries. A lagging receiver loses
/// events; the periodic resync recovers them.
pub fn spawn_forward<E, F>(
    mut rx: broadcast::Receiver<E>,
    queue: Arc<WorkQueue<ObjectKey>>,
    map: F,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: Fn(&E) -> Vec<ObjectKey> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Ok(ev) => {
                        for key in map(&ev) {
                            queue.add(key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event stream lagged; waiting for resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Every `period`, enqueue every key `list` returns.
pub fn spawn_resync<F>(queue: Arc<WorkQueue<ObjectKey>>, period: Duration, list: F, cancel: CancellationToken) -> JoinHandle<()>
where
    F: Fn() -> Vec<ObjectKey> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let keys = list();
                    debug!(keys = keys.len(), "resync");
                    for key in keys {
                        queue.add(key);
                    }
                }
            }
        }
    })
}
