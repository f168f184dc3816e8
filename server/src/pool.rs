//! Bounded worker pools and completion barriers.
//!
//! A [Pool] runs a fixed number of workers fed by a bounded queue.  Enqueueing blocks the producer while the
//! queue is full, which keeps the number of concurrent decode/encode operations independent of request volume.
//! Producers which need to wait for their work attach a [CompletionGuard] to each task and wait on the owning
//! [Completion]; fire-and-forget producers simply don't wait.

use {
    anyhow::{anyhow, Result},
    futures::future::BoxFuture,
    serde_derive::{Deserialize, Serialize},
    std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
    tokio::{
        sync::{mpsc, Mutex as AsyncMutex, Notify},
        task,
    },
    tracing::warn,
};

type Task = BoxFuture<'static, Result<()>>;

/// Sizing for the extraction and thumbnail pools
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct PoolConfig {
    pub extract_workers: usize,
    pub thumb_workers: usize,
    /// Capacity of each pool's queue
    pub queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            extract_workers: 4,
            thumb_workers: 2,
            queue_size: 256,
        }
    }
}

/// Live counters for one pool, shared with whoever reports status
#[derive(Debug, Default)]
pub struct PoolStats {
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time copy of [PoolStats]
#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PoolStatus {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatus {
        PoolStatus {
            queued: self.queued.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-size task pool with a bounded queue
#[derive(Clone, Debug)]
pub struct Pool {
    name: &'static str,
    tx: mpsc::Sender<Task>,
    stats: Arc<PoolStats>,
}

impl Pool {
    /// Spawn `workers` workers sharing a queue of `queue_size` tasks.
    ///
    /// Workers exit once every `Pool` handle has been dropped and the queue has drained.
    pub fn new(name: &'static str, workers: usize, queue_size: usize, stats: Arc<PoolStats>) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(queue_size.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));

        for _ in 0..workers.max(1) {
            task::spawn(work(name, rx.clone(), stats.clone()));
        }

        Self { name, tx, stats }
    }

    /// Add a task to the queue, waiting for room if the queue is full.
    ///
    /// A task which fails or panics is logged and counted; it is never retried.
    pub async fn enqueue(&self, task: impl Future<Output = Result<()>> + Send + 'static) -> Result<()> {
        self.stats.queued.fetch_add(1, Ordering::Relaxed);

        if self.tx.send(Box::pin(task)).await.is_err() {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);

            return Err(anyhow!("{} pool is shut down", self.name));
        }

        Ok(())
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }
}

async fn work(name: &'static str, rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>, stats: Arc<PoolStats>) {
    loop {
        let task = rx.lock().await.recv().await;

        let Some(task) = task else {
            break;
        };

        stats.queued.fetch_sub(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);

        // Run on its own task so a panic takes down only that task, not the worker.
        match task::spawn(task).await {
            Ok(Ok(())) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!("{} task failed: {:?}", name, e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("{} task panicked: {:?}", name, e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    pending: AtomicUsize,
    notify: Notify,
}

/// Counting barrier which lets a producer wait for every task it handed out
#[derive(Clone, Debug, Default)]
pub struct Completion(Arc<CompletionState>);

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more pending task.  The task is complete when the returned guard is dropped, whether the
    /// task succeeded, failed, or never ran.
    pub fn guard(&self) -> CompletionGuard {
        self.0.pending.fetch_add(1, Ordering::SeqCst);

        CompletionGuard(self.clone())
    }

    pub fn pending(&self) -> usize {
        self.0.pending.load(Ordering::SeqCst)
    }

    /// Wait until every guard handed out so far has been dropped.
    pub async fn wait(&self) {
        loop {
            let notified = self.0.notify.notified();

            if self.pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    fn done(&self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// Marks one task of a [Completion] as finished when dropped
#[derive(Debug)]
pub struct CompletionGuard(Completion);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.done()
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::time::Duration, tokio::time};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_concurrency() -> Result<()> {
        let stats = Arc::new(PoolStats::default());
        let pool = Pool::new("test", 2, 1, stats.clone());
        let completion = Completion::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let guard = completion.guard();
            let (active, max) = (active.clone(), max.clone());

            pool.enqueue(async move {
                let _guard = guard;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await?;
        }

        completion.wait().await;

        assert!(max.load(Ordering::SeqCst) <= 2);
        assert_eq!(0, completion.pending());

        // The guard drops just before the worker updates its counters.
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            PoolStatus {
                completed: 10,
                ..PoolStatus::default()
            },
            stats.snapshot()
        );

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_complete_the_barrier() -> Result<()> {
        let stats = Arc::new(PoolStats::default());
        let pool = Pool::new("test", 1, 4, stats.clone());
        let completion = Completion::new();

        let guard = completion.guard();
        pool.enqueue(async move {
            let _guard = guard;
            Err(anyhow!("probe failed"))
        })
        .await?;

        let guard = completion.guard();
        pool.enqueue(async move {
            let _guard = guard;
            None::<()>.expect("decoder exploded");
            Ok(())
        })
        .await?;

        time::timeout(Duration::from_secs(5), completion.wait()).await?;
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(2, stats.snapshot().failed);

        Ok(())
    }

    #[tokio::test]
    async fn empty_barrier_does_not_block() {
        Completion::new().wait().await;
    }
}
