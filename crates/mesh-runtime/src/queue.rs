use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Notify, Semaphore};

use crate::CancellationToken;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Notification emitted by an [`ExecutionQueue`], mirroring the
/// `{TaskDiscarded, AllTasksCompleted}` events in the concurrency model.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    /// A task was dropped without running, because the queue was cancelled
    /// before it reached the front.
    TaskDiscarded,
    /// The queue has no scheduled, running, or pending tasks.
    AllTasksCompleted,
}

/// A FIFO queue of tasks, scheduled with a concurrency cap.
///
/// Mirrors the execution queue described in the concurrency & resource
/// model: `push`, `flush`, `cancelAll(wait)`, and completion notifications.
/// Queues compose by construction (a server's acceptor queue can hold a
/// child [`ExecutionQueue`] of connection tasks): each queue is independent
/// and only shares the [`CancellationToken`] you choose to pass in.
pub struct ExecutionQueue {
    sender: mpsc::UnboundedSender<BoxedTask>,
    events: broadcast::Sender<QueueEvent>,
    inflight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl ExecutionQueue {
    /// `concurrency` bounds how many pushed tasks may run at once; tasks
    /// beyond the cap wait in FIFO order. `cancel` is observed cooperatively:
    /// tasks already running are not aborted, but tasks still queued when
    /// cancellation fires are discarded without running.
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        assert!(concurrency > 0, "concurrency cap must be non-zero");
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxedTask>();
        let (events, _) = broadcast::channel(64);
        let inflight = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let dispatcher = {
            let inflight = inflight.clone();
            let drained = drained.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        task = receiver.recv() => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };
                    if cancel.is_cancelled() {
                        let _ = events.send(QueueEvent::TaskDiscarded);
                        continue;
                    }
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
                    inflight.fetch_add(1, Ordering::SeqCst);
                    let inflight = inflight.clone();
                    let drained = drained.clone();
                    tokio::spawn(async move {
                        task.await;
                        drop(permit);
                        if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                            drained.notify_waiters();
                        }
                    });
                }
                // Drain whatever remains in the channel once cancelled, so a
                // concurrent `push` doesn't block forever on a full channel.
                while receiver.try_recv().is_ok() {
                    let _ = events.send(QueueEvent::TaskDiscarded);
                }
            })
        };

        Self { sender, events, inflight, drained, cancel, dispatcher }
    }

    /// Enqueues a task. Returns `false` (and drops the task) if the queue has
    /// already been cancelled.
    pub fn push<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            let _ = self.events.send(QueueEvent::TaskDiscarded);
            return false;
        }
        self.sender.send(Box::pin(task)).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Waits until every scheduled and running task has completed.
    pub async fn flush(&self) {
        loop {
            if self.inflight.load(Ordering::SeqCst) == 0 && self.sender.is_closed() {
                return;
            }
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.drained.notified().await;
        }
    }

    /// Cancels the queue. If `wait` is true, awaits until all in-flight
    /// tasks have finished running (queued-but-not-started tasks are
    /// discarded immediately, matching the spec's forceful cancellation).
    pub async fn cancel_all(&self, wait: bool) {
        self.cancel.cancel();
        if wait {
            self.flush().await;
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_pushed_tasks_and_flushes() {
        let queue = ExecutionQueue::new(2, CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            queue.push(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        let queue = ExecutionQueue::new(1, CancellationToken::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let peak = peak.clone();
            let current = current.clone();
            queue.push(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.flush().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_discards_unstarted_tasks() {
        let queue = ExecutionQueue::new(1, CancellationToken::new());
        let ran = Arc::new(AtomicUsize::new(0));
        // Occupy the only slot so the second push stays queued.
        queue.push(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let ran_clone = ran.clone();
        let mut events = queue.subscribe();
        queue.push(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        queue.cancel_all(false).await;
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(event, QueueEvent::TaskDiscarded));
    }
}
