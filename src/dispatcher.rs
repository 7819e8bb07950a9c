//! The Partition Serial Dispatcher: guarantees in-order, one-at-a-time processing of deliveries
//! that share a partition key, while deliveries under different keys run fully concurrently.
//!
//! A [`DashMap`] of per-key channels backs the registry, with a dedicated worker task draining
//! each channel in order, and self-eviction once a key's queue drains or has sat idle long enough
//! that keeping the worker alive isn't worth it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// How long a per-key worker waits for a new task before evicting itself.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on the number of queued tasks per partition key before `dispatch` starts waiting for
/// room, applying natural backpressure to the consume loop feeding it.
const QUEUE_CAPACITY: usize = 64;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Dispatches boxed futures to per-key FIFO workers.
///
/// A key is typically `"{queueName}:{partitionValue}"`, built by
/// [`crate::helpers::resolve_partition_key`]; the dispatcher itself is agnostic to how the key was
/// derived.
#[derive(Clone)]
pub(crate) struct PartitionDispatcher {
    queues: Arc<DashMap<String, mpsc::Sender<BoxedTask>>>,
}

impl PartitionDispatcher {
    /// Creates an empty dispatcher.
    pub(crate) fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Enqueues `task` for serial execution under `key`, spawning a worker for the key if one
    /// isn't already running.
    pub(crate) async fn dispatch<F>(&self, key: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.get_or_spawn_worker(&key);
        let boxed: BoxedTask = Box::pin(task);

        if let Err(mpsc::error::SendError(task)) = sender.send(boxed).await {
            // The worker evicted itself between our lookup and this send. Retry once with a
            // freshly spawned worker; a second failure would mean the dispatcher itself was
            // dropped, which only happens at facade shutdown.
            let sender = self.get_or_spawn_worker(&key);
            let _ = sender.send(task).await;
        }
    }

    /// Number of partition keys with a live worker, i.e. the size of the queue registry.
    #[cfg(test)]
    pub(crate) fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn get_or_spawn_worker(&self, key: &str) -> mpsc::Sender<BoxedTask> {
        if let Some(sender) = self.queues.get(key) {
            return sender.clone();
        }

        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        self.queues.insert(key.to_string(), sender.clone());

        let queues = self.queues.clone();
        let key = key.to_string();
        tokio::spawn(Self::run_worker(key, receiver, queues));

        sender
    }

    async fn run_worker(
        key: String,
        mut receiver: mpsc::Receiver<BoxedTask>,
        queues: Arc<DashMap<String, mpsc::Sender<BoxedTask>>>,
    ) {
        loop {
            match tokio::time::timeout(IDLE_TIMEOUT, receiver.recv()).await {
                // Caught so a single panicking task can't kill the worker and strand every later
                // task queued for this partition key behind a sender nobody is receiving from.
                Ok(Some(task)) => {
                    if std::panic::AssertUnwindSafe(task).catch_unwind().await.is_err() {
                        error!(partition_key = %key, "partition worker task panicked");
                    }
                    // Evict as soon as the queue drains, rather than waiting out the idle
                    // timeout, so the registry reflects only keys with outstanding work.
                    if receiver.is_empty() {
                        queues.remove(&key);
                        debug!(partition_key = %key, "evicting drained partition worker");
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Idle timeout with nothing ever enqueued since the last drain-eviction
                    // check, or the worker was spawned but never sent to. Only evict if nothing
                    // raced in since the timeout fired.
                    if receiver.is_empty() {
                        queues.remove(&key);
                        debug!(partition_key = %key, "evicting idle partition worker");
                        break;
                    }
                }
            }
        }
    }
}

impl Default for PartitionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn same_key_tasks_run_in_order() {
        let dispatcher = PartitionDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            dispatcher
                .dispatch("orders:abc".to_string(), async move {
                    order.lock().await.push(i);
                })
                .await;
        }

        // Give the worker time to drain the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recorded = order.lock().await;
        assert_eq!(*recorded, (0..10).collect::<Vec<_>>());
        assert_eq!(dispatcher.queue_count(), 0);
    }

    #[tokio::test]
    async fn partition_ordering_stress_drains_to_empty_registry() {
        let dispatcher = PartitionDispatcher::new();
        let counters: Vec<_> = (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for partition in 0..5 {
            for i in 0..20 {
                let counter = counters[partition].clone();
                dispatcher
                    .dispatch(format!("orders:{partition}"), async move {
                        let index = counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(index, i);
                    })
                    .await;
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 20);
        }
        assert_eq!(dispatcher.queue_count(), 0);
    }

    #[tokio::test]
    async fn queue_is_evicted_once_drained() {
        let dispatcher = PartitionDispatcher::new();
        dispatcher.dispatch("orders:abc".to_string(), async {}).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.queue_count(), 0);
    }

    #[tokio::test]
    async fn dispatching_again_after_eviction_still_runs_the_task() {
        let dispatcher = PartitionDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = counter.clone();
        dispatcher
            .dispatch("orders:abc".to_string(), async move {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.queue_count(), 0);

        let second = counter.clone();
        dispatcher
            .dispatch("orders:abc".to_string(), async move {
                second.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let dispatcher = PartitionDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for key in ["orders:a", "orders:b", "orders:c"] {
            let counter = counter.clone();
            dispatcher
                .dispatch(key.to_string(), async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
