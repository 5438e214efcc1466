//! Fixed-size worker pool over an up-front queue of work items.
//!
//! The [`WorkerPool`] spawns `workers` scoped tasks that pull items from a
//! shared queue until it is empty. Every item is handed to exactly one
//! worker, and each worker has one item in flight at a time.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::Mutex;

/// A bounded pool of concurrent workers.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(10);
/// let outcomes = pool.run(batches, |batch| async move { upload(batch).await }).await;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Creates a pool with `workers` workers. Minimum is 1.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes every item with `work` and returns the outputs in input order.
    ///
    /// Requires a multi-threaded runtime.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Fut + Sync,
        Fut: Future<Output = R> + Send,
    {
        if items.is_empty() {
            return Vec::new();
        }

        let total = items.len();
        let worker_count = self.workers.min(total);
        let queue: Mutex<VecDeque<(usize, T)>> = Mutex::new(items.into_iter().enumerate().collect());
        let outputs: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(total));

        tokio_scoped::scope(|scope| {
            for _ in 0..worker_count {
                let queue = &queue;
                let outputs = &outputs;
                let work = &work;

                scope.spawn(async move {
                    loop {
                        let next = queue.lock().await.pop_front();
                        let Some((index, item)) = next else {
                            break;
                        };
                        let output = work(item).await;
                        outputs.lock().await.push((index, output));
                    }
                });
            }
        });

        let mut outputs = outputs.into_inner();
        outputs.sort_by_key(|(index, _)| *index);
        outputs.into_iter().map(|(_, output)| output).collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(1)
    }
}
