#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use porch_controller::{spawn_forward, Action, Attempt, Controller, ControllerConfig, Reconciler};
use porch_core::{ObjectKey, PorchError, PorchResult};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Fails with a conflict on the first `fail_first` attempts.
struct Flaky {
    calls: AtomicUsize,
    fail_first: usize,
    sleep: Duration,
}

#[async_trait]
impl Reconciler for Flaky {
    fn name(&self) -> &'static str { "flaky" }

    async fn reconcile(&self, _key: &ObjectKey) -> PorchResult<Action> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.sleep).await;
        if n < self.fail_first {
            return Err(PorchError::conflict("stale"));
        }
        Ok(Action::Done)
    }
}

fn cfg() -> ControllerConfig {
    ControllerConfig { workers: 2, reconcile_timeout_secs: 1, backoff_base_ms: 5, backoff_max_secs: 1, queue_cap: 16, resync_secs: 0 }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_are_retried_until_success() {
    let r = Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first: 2, sleep: Duration::ZERO });
    let c = Controller::new(Arc::clone(&r), &cfg());
    let cancel = CancellationToken::new();
    let workers = c.spawn_workers(cancel.clone());
    c.enqueue(ObjectKey::new("default", "a"));
    for _ in 0..100 {
        if r.calls.load(Ordering::SeqCst) >= 3 && c.queue().is_idle() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(r.calls.load(Ordering::SeqCst), 3);
    assert_eq!(c.queue().failures(&ObjectKey::new("default", "a")), 0);
    cancel.cancel();
    for w in workers {
        w.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attempts_past_the_deadline_are_retried() {
    let r = Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first: 0, sleep: Duration::from_secs(3) });
    let c = Controller::new(r, &cfg());
    assert_eq!(c.process(&ObjectKey::new("default", "slow")).await, Attempt::Retried);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarded_events_coalesce_into_one_reconcile() {
    let r = Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first: 0, sleep: Duration::ZERO });
    let c = Controller::new(Arc::clone(&r), &cfg());
    let (tx, rx) = broadcast::channel::<String>(16);
    let cancel = CancellationToken::new();
    let fwd = spawn_forward(rx, c.queue(), |name: &String| vec![ObjectKey::new("default", name.clone())], cancel.clone());
    for _ in 0..5 {
        tx.send("a".to_string()).unwrap();
    }
    // let the forwarder consume all five events
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c.queue().len(), 1);
    assert_eq!(c.drain().await, 1);
    assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    cancel.cancel();
    fwd.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_aborts_the_attempt_in_flight() {
    let r = Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first: 0, sleep: Duration::from_secs(3) });
    let c = Controller::new(Arc::clone(&r), &ControllerConfig { workers: 1, reconcile_timeout_secs: 30, ..cfg() });
    let cancel = CancellationToken::new();
    let workers = c.spawn_workers(cancel.clone());
    c.enqueue(ObjectKey::new("default", "slow"));
    for _ in 0..100 {
        if r.calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(r.calls.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    cancel.cancel();
    for w in workers {
        w.await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1), "worker ran on for {:?}", started.elapsed());
    assert!(c.queue().is_idle());
}
