//! Worker pools shared by the queue-driven stages.
//!
//! A pool of `workers` interchangeable tasks pulls from one input queue.
//! On cancellation each worker finishes the item it holds, then the pool
//! drains at most `drain_limit` further items (shared across workers) before
//! exiting. An item is taken off the queue exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::obs;
use crate::queue::QueueReceiver;

/// Join handles of one stage's tasks.
pub struct StageHandle {
    name: String,
    handles: Vec<JoinHandle<u64>>,
    processed: u64,
}

impl StageHandle {
    pub fn new(name: impl Into<String>, handles: Vec<JoinHandle<u64>>) -> Self {
        Self {
            name: name.into(),
            handles,
            processed: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for every task. Safe to call again after an interrupted wait.
    pub async fn join(&mut self) -> u64 {
        while !self.handles.is_empty() {
            let result = (&mut self.handles[0]).await;
            self.handles.remove(0);
            match result {
                Ok(n) => self.processed += n,
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(stage = %self.name, error = %e, "stage task panicked"),
            }
        }
        obs::emit_stage_stopped(&self.name, self.processed);
        self.processed
    }

    /// Abort whatever has not finished.
    pub fn abort(&self) {
        for h in &self.handles {
            h.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }
}

/// Spawn `workers` tasks that feed items from `input` to `handler`.
pub fn spawn_workers<T, F, Fut>(
    name: &str,
    workers: usize,
    input: QueueReceiver<T>,
    cancel: CancellationToken,
    drain_limit: usize,
    handler: F,
) -> StageHandle
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let input = Arc::new(Mutex::new(input));
    let handler = Arc::new(handler);
    let drain_budget = Arc::new(AtomicUsize::new(drain_limit));
    let workers = workers.max(1);
    obs::emit_stage_started(name, workers);

    let handles = (0..workers)
        .map(|worker| {
            let input = Arc::clone(&input);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            let drain_budget = Arc::clone(&drain_budget);
            let stage = name.to_string();
            tokio::spawn(async move {
                let mut processed = 0u64;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = async { input.lock().await.recv().await } => item,
                    };
                    match next {
                        Some(item) => {
                            handler(item).await;
                            processed += 1;
                        }
                        None => {
                            debug!(stage = %stage, worker, "input closed");
                            return processed;
                        }
                    }
                }
                // Cancelled: drain a bounded number of queued items.
                while take_budget(&drain_budget) {
                    let item = input.lock().await.try_recv();
                    match item {
                        Ok(item) => {
                            handler(item).await;
                            processed += 1;
                        }
                        Err(_) => break,
                    }
                }
                debug!(stage = %stage, worker, processed, "worker exiting");
                processed
            })
        })
        .collect();

    StageHandle::new(name, handles)
}

fn take_budget(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_workers_process_until_input_closes() {
        let (tx, rx) = bounded::<u64>("in", 16);
        let sum = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&sum);
        let mut stage = spawn_workers("sum", 3, rx, CancellationToken::new(), 0, move |n| {
            let s = Arc::clone(&s);
            async move {
                s.fetch_add(n, Ordering::SeqCst);
            }
        });
        for n in 1..=10 {
            tx.publish(n);
        }
        drop(tx);
        assert_eq!(stage.join().await, 10);
        assert_eq!(sum.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn test_cancel_drains_bounded_number() {
        let (tx, rx) = bounded::<u64>("in", 16);
        for n in 0..10 {
            tx.publish(n);
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let mut stage = spawn_workers("drain", 2, rx, cancel, 4, move |_| {
            let s = Arc::clone(&s);
            async move {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(stage.join().await, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        drop(tx);
    }
}
