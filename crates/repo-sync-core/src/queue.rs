//! Commit queue: serializes pipeline runs.
//!
//! At most one run is in flight. A batch submitted while a run is active waits
//! in arrival order; whichever caller started the run keeps draining the queue
//! until it is empty. Batches are never merged, and a failed run does not stop
//! the ones queued behind it. If the draining caller goes away mid-run, the
//! drain passes to the oldest caller still waiting.

use crate::commit::{CommitBatch, CommitError, Result};

use futures::channel::oneshot;
use futures::future::{self, Either};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

struct Queued<T> {
    batch: CommitBatch,
    reply: oneshot::Sender<Result<T>>,
    /// Fired to make the submitter take over draining
    handoff: Option<oneshot::Sender<()>>,
}

struct QueueState<T> {
    running: bool,
    pending: VecDeque<Queued<T>>,
}

pub struct CommitQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T> Default for CommitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Passes the drain on if the draining future is dropped mid-run.
struct DrainGuard<'a, T> {
    queue: &'a CommitQueue<T>,
    armed: bool,
}

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.hand_off();
        }
    }
}

/// A submitter parked behind the active run.
///
/// Dropping it after a handoff arrived but before acting on it passes the
/// drain to the next waiter.
struct Waiting<'a, T> {
    queue: &'a CommitQueue<T>,
    takeover: oneshot::Receiver<()>,
}

impl<T> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        if let Ok(Some(())) = self.takeover.try_recv() {
            self.queue.hand_off();
        }
    }
}

impl<T> CommitQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                running: false,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Batches waiting behind the active run.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Queue `batch` and wait for its own result.
    ///
    /// If no run is active, this call becomes the drainer and executes `run`
    /// for its batch and every batch that arrives before the queue empties.
    pub async fn submit<F, Fut>(&self, batch: CommitBatch, run: F) -> Result<T>
    where
        F: Fn(CommitBatch) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (reply, mut result) = oneshot::channel();
        let (handoff, takeover) = oneshot::channel();
        let start = {
            let mut state = self.lock();
            state.pending.push_back(Queued {
                batch,
                reply,
                handoff: Some(handoff),
            });
            if state.running {
                debug!("Commit run in flight; queued batch ({} waiting)", state.pending.len());
                false
            } else {
                state.running = true;
                true
            }
        };

        if start {
            self.drain(&run).await;
        } else {
            let mut waiting = Waiting {
                queue: self,
                takeover,
            };
            let take_over = match future::select(&mut result, &mut waiting.takeover).await {
                Either::Left((outcome, _)) => {
                    return outcome.unwrap_or(Err(CommitError::Cancelled));
                }
                // A closed handoff means our batch was picked up by the drainer
                Either::Right((signal, _)) => signal.is_ok(),
            };
            drop(waiting);
            if take_over {
                debug!("Taking over the commit queue");
                self.drain(&run).await;
            }
        }

        result.await.unwrap_or(Err(CommitError::Cancelled))
    }

    async fn drain<F, Fut>(&self, run: &F)
    where
        F: Fn(CommitBatch) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = DrainGuard {
            queue: self,
            armed: true,
        };

        loop {
            let Queued { batch, reply, .. } = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.running = false;
                        guard.armed = false;
                        return;
                    }
                }
            };

            let outcome = run(batch).await;
            // The submitter may have gone away; its result is simply dropped
            let _ = reply.send(outcome);
        }
    }

    /// Give the drain to the oldest live waiter, or release the queue.
    fn hand_off(&self) {
        let mut state = self.lock();
        for queued in state.pending.iter_mut() {
            if let Some(handoff) = queued.handoff.take() {
                if handoff.send(()).is_ok() {
                    return;
                }
            }
        }
        // Batches of vanished submitters stay queued for the next submit
        state.running = false;
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::tracker::ChangeTracker;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch_of(path: &str) -> CommitBatch {
        let tracker = ChangeTracker::new();
        tracker.record_update(path);
        CommitBatch::from_changes(tracker.drain())
    }

    fn first_path(batch: &CommitBatch) -> String {
        batch.entries()[0].path().to_string()
    }

    #[tokio::test]
    async fn test_single_submit_runs_immediately() {
        let queue = CommitQueue::new();
        let result = queue
            .submit(batch_of("a.md"), |b| async move { Ok(first_path(&b)) })
            .await
            .unwrap();

        assert_eq!(result, "a.md");
        assert!(!queue.is_running());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_runs_never_overlap_and_keep_order() {
        let queue = CommitQueue::new();
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = oneshot::channel::<()>();
        let gate = Mutex::new(Some(gate));

        let run = |b: CommitBatch| {
            let active = Arc::clone(&active);
            let order = Arc::clone(&order);
            let gate = gate.lock().unwrap().take();
            async move {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "runs overlapped");
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                order.lock().unwrap().push(first_path(&b));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(first_path(&b))
            }
        };

        let (first, second, third, ()) = tokio::join!(
            queue.submit(batch_of("1.md"), run),
            queue.submit(batch_of("2.md"), run),
            queue.submit(batch_of("3.md"), run),
            async {
                assert_eq!(queue.pending(), 2);
                release.send(()).unwrap();
            }
        );

        assert_eq!(first.unwrap(), "1.md");
        assert_eq!(second.unwrap(), "2.md");
        assert_eq!(third.unwrap(), "3.md");
        assert_eq!(*order.lock().unwrap(), vec!["1.md", "2.md", "3.md"]);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_failed_run_does_not_poison_queue() {
        let queue = CommitQueue::new();
        let (release, gate) = oneshot::channel::<()>();
        let gate = Mutex::new(Some(gate));

        let run = |b: CommitBatch| {
            let gate = gate.lock().unwrap().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                    return Err(CommitError::Remote(RemoteError::Transport("offline".into())));
                }
                Ok(first_path(&b))
            }
        };

        let (first, second, ()) = tokio::join!(
            queue.submit(batch_of("1.md"), run),
            queue.submit(batch_of("2.md"), run),
            async {
                release.send(()).unwrap();
            }
        );

        assert!(matches!(first, Err(CommitError::Remote(_))));
        assert_eq!(second.unwrap(), "2.md");
    }

    #[tokio::test]
    async fn test_dropped_drainer_releases_queue() {
        let queue: CommitQueue<String> = CommitQueue::new();

        {
            let run = |b: CommitBatch| async move {
                // Stalls forever; only dropping the drainer gets us out
                futures::future::pending::<()>().await;
                Ok(first_path(&b))
            };
            let stalled = queue.submit(batch_of("1.md"), run);
            futures::pin_mut!(stalled);
            assert!(futures::poll!(stalled.as_mut()).is_pending());
            assert!(queue.is_running());
        }

        assert!(!queue.is_running());
        let result = queue
            .submit(batch_of("2.md"), |b| async move { Ok(first_path(&b)) })
            .await
            .unwrap();
        assert_eq!(result, "2.md");
    }

    #[tokio::test]
    async fn test_dropped_drainer_hands_off_to_waiter() {
        let queue: CommitQueue<String> = CommitQueue::new();
        let stall = |b: CommitBatch| async move {
            futures::future::pending::<()>().await;
            Ok(first_path(&b))
        };
        let run = |b: CommitBatch| async move { Ok(first_path(&b)) };

        let waiter = queue.submit(batch_of("2.md"), run);
        futures::pin_mut!(waiter);
        {
            let stalled = queue.submit(batch_of("1.md"), stall);
            futures::pin_mut!(stalled);
            assert!(futures::poll!(stalled.as_mut()).is_pending());
            assert!(futures::poll!(waiter.as_mut()).is_pending());
            assert_eq!(queue.pending(), 1);
        }

        // The waiter's batch runs without any further submit
        assert!(queue.is_running());
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("queued batch never ran")
            .unwrap();
        assert_eq!(result, "2.md");
        assert!(!queue.is_running());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_handoff_skips_waiter_that_went_away() {
        let queue: CommitQueue<String> = CommitQueue::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let stall = |b: CommitBatch| async move {
            futures::future::pending::<()>().await;
            Ok(first_path(&b))
        };
        let run = |b: CommitBatch| {
            let ran = Arc::clone(&ran);
            async move {
                ran.lock().unwrap().push(first_path(&b));
                Ok(first_path(&b))
            }
        };

        let last = queue.submit(batch_of("3.md"), run);
        futures::pin_mut!(last);
        {
            let stalled = queue.submit(batch_of("1.md"), stall);
            futures::pin_mut!(stalled);
            assert!(futures::poll!(stalled.as_mut()).is_pending());

            let gone = queue.submit(batch_of("2.md"), run);
            futures::pin_mut!(gone);
            assert!(futures::poll!(gone.as_mut()).is_pending());
            assert!(futures::poll!(last.as_mut()).is_pending());
            // Drop order: `gone` first, then the drainer
        }

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), last)
            .await
            .expect("queue stalled")
            .unwrap();
        assert_eq!(result, "3.md");
        // The abandoned batch still ran, in order
        assert_eq!(*ran.lock().unwrap(), vec!["2.md", "3.md"]);
    }
}
