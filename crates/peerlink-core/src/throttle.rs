//! Serialization of hardware-facing requests
//!
//! Radio stacks misbehave when a new request is issued before the previous
//! request's callback has fired. Every request therefore runs on one worker
//! task, which stays occupied until the request's ticket is completed or the
//! configured timeout elapses.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

type Operation = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    id: u64,
    operation: Operation,
    done: oneshot::Receiver<()>,
    cancelled: Arc<AtomicBool>,
}

// ----------------------------------------------------------------------------
// Ticket
// ----------------------------------------------------------------------------

/// Handle for one submitted operation
///
/// Completing the ticket releases the worker. Dropping every clone without
/// completing also releases it, so an abandoned request never stalls the queue
/// for the full timeout. Cancelling releases the worker and, if the operation
/// is still queued, keeps it from running at all.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    id: u64,
    done: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    cancelled: Arc<AtomicBool>,
}

impl TaskTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the hardware callback for this operation as received
    pub fn complete(&self) {
        let sender = match self.done.lock() {
            Ok(mut done) => done.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Skip the operation if it has not started, and release the worker
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.complete();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        match self.done.lock() {
            Ok(done) => done.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

// ----------------------------------------------------------------------------
// Throttle
// ----------------------------------------------------------------------------

/// Single-worker queue for hardware requests
#[derive(Debug, Clone)]
pub struct TaskThrottle {
    jobs: mpsc::UnboundedSender<Job>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl TaskThrottle {
    /// Spawn the worker on the current tokio runtime
    pub fn new(timeout: Duration) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, timeout));
        Self {
            jobs,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue `operation`; the worker waits on the returned ticket after running it
    pub fn submit<F>(&self, operation: F) -> TaskTicket
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let ticket = TaskTicket {
            id,
            done: Arc::new(Mutex::new(Some(tx))),
            cancelled: cancelled.clone(),
        };

        let job = Job {
            id,
            operation: Box::new(operation),
            done: rx,
            cancelled,
        };
        if self.jobs.send(job).is_err() {
            debug!("Task throttle worker gone, dropping task {}", id);
        }

        ticket
    }

    /// Complete a ticket returned by [`TaskThrottle::submit`]
    pub fn complete(&self, ticket: &TaskTicket) {
        ticket.complete();
    }
}

async fn run_worker(mut jobs: mpsc::UnboundedReceiver<Job>, timeout: Duration) {
    while let Some(job) = jobs.recv().await {
        if job.cancelled.load(Ordering::Acquire) {
            trace!("Task {} cancelled before it ran", job.id);
            continue;
        }
        trace!("Running task {}", job.id);
        (job.operation)();

        match tokio::time::timeout(timeout, job.done).await {
            Ok(_) => trace!("Task {} released", job.id),
            Err(_) => warn!(
                "Task {} got no callback within {:?}, continuing",
                job.id, timeout
            ),
        }
    }
    trace!("Task throttle worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn next_task_waits_for_completion() {
        let throttle = TaskThrottle::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let first = throttle.submit(move || {
            let _ = tx1.send(1);
        });
        let tx2 = tx.clone();
        let _second = throttle.submit(move || {
            let _ = tx2.send(2);
        });

        assert_eq!(rx.recv().await, Some(1));
        let early = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err(), "second task ran before first completed");

        throttle.complete(&first);
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn timeout_releases_the_queue() {
        let throttle = TaskThrottle::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let _never_completed = throttle.submit(move || {
            let _ = tx1.send(Instant::now());
        });
        let tx2 = tx.clone();
        let _second = throttle.submit(move || {
            let _ = tx2.send(Instant::now());
        });

        let started = rx.recv().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("queue stalled past the timeout")
            .unwrap();
        assert!(next.duration_since(started) >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn dropped_ticket_releases_immediately() {
        let throttle = TaskThrottle::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        drop(throttle.submit(move || {
            let _ = tx1.send(1);
        }));
        let tx2 = tx.clone();
        let _second = throttle.submit(move || {
            let _ = tx2.send(2);
        });

        assert_eq!(rx.recv().await, Some(1));
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(second.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let throttle = TaskThrottle::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let first = throttle.submit(move || {
            let _ = tx1.send(1);
        });
        let tx2 = tx.clone();
        let second = throttle.submit(move || {
            let _ = tx2.send(2);
        });
        let tx3 = tx.clone();
        let _third = throttle.submit(move || {
            let _ = tx3.send(3);
        });

        assert_eq!(rx.recv().await, Some(1));
        second.cancel();
        assert!(second.is_cancelled());
        first.complete();

        assert_eq!(rx.recv().await, Some(3));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let throttle = TaskThrottle::new(Duration::from_secs(5));
        let ticket = throttle.submit(|| {});
        assert!(!ticket.is_complete());

        ticket.complete();
        ticket.clone().complete();
        assert!(ticket.is_complete());
    }
}
