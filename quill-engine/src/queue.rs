//! Per-key mutation queue.
//!
//! Serializes mutations for the same draft inside one process: each key
//! gets a dedicated worker task draining an FIFO queue, so local callers
//! stop racing each other into the optimistic-update path, while
//! different keys proceed fully concurrently. This is purely an
//! intra-process optimization; across processes the version fencing at
//! the store remains the only coordination.
//!
//! Worker lifecycle: a worker is created on first enqueue for its key
//! (creation is guarded by the registry mutex, so there is never more
//! than one per key), processes jobs under a per-operation timeout, and
//! removes itself from the registry after its queue has been idle past
//! the idle threshold. A periodic sweep clears out workers that finished
//! for any other reason. Shutdown drains every queue, answering pending
//! waiters with a cancellation error instead of leaving them hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use quill_core::{DraftKey, EngineConfig, QueueError, QuillResult};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::coordinator::UpdateOutcome;

/// Configuration for the mutation queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-operation timeout; the waiter gets a Timeout error and the
    /// worker moves on (default: 30 seconds)
    pub op_timeout: Duration,

    /// A worker exits after its queue has been empty this long
    /// (default: 300 seconds)
    pub idle_timeout: Duration,

    /// How often the sweep removes finished workers (default: 300 seconds)
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    /// Derive the queue configuration from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            op_timeout: config.op_timeout,
            idle_timeout: config.queue_idle_timeout,
            sweep_interval: config.queue_sweep_interval,
        }
    }
}

/// Statistics about queue activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Live per-key workers.
    pub workers: usize,
    /// Jobs accepted but not yet started.
    pub pending: u64,
}

/// A queued operation and the channel its waiter listens on.
struct Job {
    fut: BoxFuture<'static, QuillResult<UpdateOutcome>>,
    reply: oneshot::Sender<QuillResult<UpdateOutcome>>,
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
    last_used: Instant,
}

struct QueueInner {
    workers: Mutex<HashMap<DraftKey, WorkerHandle>>,
    config: QueueConfig,
    shutdown_tx: watch::Sender<bool>,
    shut: AtomicBool,
    pending: AtomicU64,
}

/// Per-key FIFO mutation queue.
///
/// Must be constructed inside a Tokio runtime (it spawns its sweep task
/// immediately and worker tasks on demand).
pub struct MutationQueue {
    inner: Arc<QueueInner>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl MutationQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(QueueInner {
            workers: Mutex::new(HashMap::new()),
            config,
            shutdown_tx,
            shut: AtomicBool::new(false),
            pending: AtomicU64::new(0),
        });
        let sweep = tokio::spawn(sweep_loop(Arc::clone(&inner), shutdown_rx));
        Self {
            inner,
            sweep: Mutex::new(Some(sweep)),
        }
    }

    /// Enqueue an operation for a key and await its result.
    ///
    /// Operations for the same key run strictly in submission order;
    /// operations for different keys run concurrently.
    pub async fn enqueue(
        &self,
        key: &DraftKey,
        op: BoxFuture<'static, QuillResult<UpdateOutcome>>,
    ) -> QuillResult<UpdateOutcome> {
        if self.inner.shut.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown.into());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let mut job = Job {
            fut: op,
            reply: reply_tx,
        };

        {
            let mut workers = self.inner.workers.lock().await;
            self.inner.pending.fetch_add(1, Ordering::Relaxed);

            // A worker that exited (idle reap, panic) leaves a dead entry
            // until someone notices; respawn at most a couple of times.
            let mut respawns = 0;
            loop {
                let alive = match workers.get(key) {
                    Some(worker) => !worker.handle.is_finished(),
                    None => false,
                };
                if !alive {
                    workers.remove(key);
                    workers.insert(key.clone(), spawn_worker(Arc::clone(&self.inner), key.clone()));
                    tracing::debug!(key = %key, "mutation worker created");
                }

                let worker = match workers.get_mut(key) {
                    Some(worker) => worker,
                    None => continue,
                };
                worker.last_used = Instant::now();
                match worker.tx.send(job) {
                    Ok(()) => break,
                    Err(send_err) => {
                        job = send_err.0;
                        workers.remove(key);
                        respawns += 1;
                        if respawns > 2 {
                            self.inner.pending.fetch_sub(1, Ordering::Relaxed);
                            return Err(QueueError::Shutdown.into());
                        }
                    }
                }
            }
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Cancelled { key: key.clone() }.into()),
        }
    }

    /// Queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let workers = self.inner.workers.lock().await;
        QueueStats {
            workers: workers.len(),
            pending: self.inner.pending.load(Ordering::Relaxed),
        }
    }

    /// Shut the queue down: cancel pending operations, stop every worker
    /// and the sweep, and reject further enqueues.
    pub async fn shutdown(&self) {
        if self.inner.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        if let Some(handle) = self.sweep.lock().await.take() {
            let _ = handle.await;
        }

        let drained: Vec<(DraftKey, WorkerHandle)> = {
            let mut workers = self.inner.workers.lock().await;
            workers.drain().collect()
        };
        for (key, worker) in drained {
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(key = %key, error = %e, "mutation worker ended abnormally");
                }
            }
        }
        tracing::info!("Mutation queue shut down");
    }
}

fn spawn_worker(inner: Arc<QueueInner>, key: DraftKey) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown_rx = inner.shutdown_tx.subscribe();
    let handle = tokio::spawn(worker_loop(inner, key, rx, shutdown_rx));
    WorkerHandle {
        tx,
        handle,
        last_used: Instant::now(),
    }
}

async fn worker_loop(
    inner: Arc<QueueInner>,
    key: DraftKey,
    mut rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    drain_cancelled(&inner, &key, &mut rx);
                    break;
                }
            }

            recv = tokio::time::timeout(inner.config.idle_timeout, rx.recv()) => {
                match recv {
                    Ok(Some(job)) => {
                        inner.pending.fetch_sub(1, Ordering::Relaxed);
                        run_job(&inner, &key, job).await;
                    }
                    Ok(None) => break,
                    Err(_elapsed) => {
                        // Idle past the threshold: deregister under the
                        // same lock enqueue uses, so a late submission
                        // either lands here first or spawns a fresh worker.
                        let mut workers = inner.workers.lock().await;
                        if rx.is_empty() {
                            workers.remove(&key);
                            drop(workers);
                            tracing::debug!(key = %key, "idle mutation worker reaped");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn run_job(inner: &QueueInner, key: &DraftKey, job: Job) {
    let result = match tokio::time::timeout(inner.config.op_timeout, job.fut).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::error!(
                key = %key,
                timeout_secs = inner.config.op_timeout.as_secs_f64(),
                "queued operation timed out"
            );
            Err(QueueError::Timeout {
                key: key.clone(),
                waited: inner.config.op_timeout,
            }
            .into())
        }
    };
    // The waiter may have given up; that is not an error here.
    let _ = job.reply.send(result);
}

fn drain_cancelled(inner: &QueueInner, key: &DraftKey, rx: &mut mpsc::UnboundedReceiver<Job>) {
    rx.close();
    while let Ok(job) = rx.try_recv() {
        inner.pending.fetch_sub(1, Ordering::Relaxed);
        let _ = job
            .reply
            .send(Err(QueueError::Cancelled { key: key.clone() }.into()));
    }
}

async fn sweep_loop(inner: Arc<QueueInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = interval(inner.config.sweep_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = tick.tick() => {
                let mut workers = inner.workers.lock().await;
                let before = workers.len();
                workers.retain(|_, worker| !worker.handle.is_finished());
                let removed = before - workers.len();
                if removed > 0 {
                    tracing::debug!(removed, "swept finished mutation workers");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Mutex as StdMutex;

    fn key(name: &str) -> DraftKey {
        DraftKey::new(name).expect("valid key")
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            op_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
        }
    }

    fn ok_outcome(version: i64) -> QuillResult<UpdateOutcome> {
        Ok(UpdateOutcome {
            new_version: version,
            attempts: 1,
        })
    }

    #[tokio::test]
    async fn test_enqueue_runs_op_and_returns_result() {
        let queue = MutationQueue::new(test_config());
        let outcome = queue
            .enqueue(&key("draft-1"), async { ok_outcome(1) }.boxed())
            .await
            .expect("enqueue");
        assert_eq!(outcome.new_version, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_key_ops_run_in_fifo_order() {
        let queue = MutationQueue::new(test_config());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let k = key("draft-1");

        let mut handles = Vec::new();
        let queue = Arc::new(queue);
        for i in 0..5i64 {
            let order = Arc::clone(&order);
            let queue = Arc::clone(&queue);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        &k,
                        async move {
                            // Earlier submissions finish before later ones
                            // even when they take longer.
                            tokio::time::sleep(Duration::from_millis(10 - i as u64)).await;
                            order.lock().unwrap().push(i);
                            ok_outcome(i)
                        }
                        .boxed(),
                    )
                    .await
            }));
            // Deterministic submission order.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.expect("join").expect("enqueue");
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let queue = Arc::new(MutationQueue::new(test_config()));
        let started = Arc::new(tokio::sync::Barrier::new(2));

        let mut handles = Vec::new();
        for name in ["draft-a", "draft-b"] {
            let queue = Arc::clone(&queue);
            let started = Arc::clone(&started);
            let k = key(name);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        &k,
                        async move {
                            // Deadlocks unless both workers run at once.
                            started.wait().await;
                            ok_outcome(1)
                        }
                        .boxed(),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("enqueue");
        }
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_op_timeout_surfaces_and_worker_continues() {
        let queue = MutationQueue::new(test_config());
        let k = key("draft-1");

        let err = queue
            .enqueue(
                &k,
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    ok_outcome(1)
                }
                .boxed(),
            )
            .await
            .expect_err("must time out");
        assert!(err.is_timeout());

        // The worker is still serving this key.
        let outcome = queue
            .enqueue(&k, async { ok_outcome(2) }.boxed())
            .await
            .expect("next op runs");
        assert_eq!(outcome.new_version, 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_worker_is_reaped() {
        let queue = MutationQueue::new(test_config());
        let k = key("draft-1");

        queue
            .enqueue(&k, async { ok_outcome(1) }.boxed())
            .await
            .expect("enqueue");
        assert_eq!(queue.stats().await.workers, 1);

        // Past the idle threshold the worker deregisters itself.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.stats().await.workers, 0);

        // A fresh enqueue spawns a new worker transparently.
        queue
            .enqueue(&k, async { ok_outcome(2) }.boxed())
            .await
            .expect("enqueue after reap");
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_rejects_new() {
        let queue = Arc::new(MutationQueue::new(test_config()));
        let k = key("draft-1");

        // A long op occupies the worker; a second waits behind it.
        let queue_a = Arc::clone(&queue);
        let k_a = k.clone();
        let blocked = tokio::spawn(async move {
            queue_a
                .enqueue(
                    &k_a,
                    async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        ok_outcome(1)
                    }
                    .boxed(),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queue_b = Arc::clone(&queue);
        let k_b = k.clone();
        let pending = tokio::spawn(async move {
            queue_b.enqueue(&k_b, async { ok_outcome(2) }.boxed()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.shutdown().await;

        // The queued-but-unstarted op was cancelled, not dropped silently.
        let err = pending
            .await
            .expect("join")
            .expect_err("pending op must surface cancellation");
        assert!(matches!(
            err,
            quill_core::QuillError::Queue(
                QueueError::Cancelled { .. } | QueueError::Timeout { .. }
            )
        ));
        let _ = blocked.await.expect("join");

        let err = queue
            .enqueue(&k, async { ok_outcome(3) }.boxed())
            .await
            .expect_err("enqueue after shutdown");
        assert!(matches!(
            err,
            quill_core::QuillError::Queue(QueueError::Shutdown)
        ));
    }
}
