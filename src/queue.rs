//! Bounded FIFO between acceptance and execution.
//!
//! `reserve`/`enqueue` never wait: a full queue fails fast with
//! [`GateError::QueueFull`]. Only workers block, in [`JobQueue::dequeue`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::builder::CommandLine;
use crate::error::GateError;
use crate::job::JobId;
use crate::template::CommandTemplate;

/// Everything a worker needs to run a job, fixed at acceptance time.
#[derive(Debug)]
pub struct QueuedJob {
    pub id: JobId,
    pub template: Arc<CommandTemplate>,
    pub command: CommandLine,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedJob>,
    reserved: usize,
    closed: bool,
}

pub struct JobQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// A held queue slot. Dropping it unused gives the slot back.
#[must_use = "a reservation holds a queue slot until pushed or dropped"]
pub struct Reservation<'a> {
    queue: &'a JobQueue,
    used: bool,
}

impl Reservation<'_> {
    pub fn push(mut self, job: QueuedJob) {
        {
            let mut state = self.queue.lock();
            state.reserved -= 1;
            state.items.push_back(job);
        }
        self.used = true;
        self.queue.available.notify_one();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.queue.lock().reserved -= 1;
        }
    }
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting to be dequeued (reservations excluded).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a slot without blocking.
    pub fn reserve(&self) -> Result<Reservation<'_>, GateError> {
        let mut state = self.lock();
        if state.closed {
            return Err(GateError::Internal("job queue is shut down".to_owned()));
        }
        if state.items.len() + state.reserved >= self.capacity {
            return Err(GateError::QueueFull {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(Reservation {
            queue: self,
            used: false,
        })
    }

    pub fn enqueue(&self, job: QueuedJob) -> Result<(), GateError> {
        self.reserve()?.push(job);
        Ok(())
    }

    /// Wait for the oldest job. Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        loop {
            // Created before checking state so a push or close in between is not missed.
            let notified = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(job) = state.items.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Remove a waiting job. True if it was still in the queue.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut state = self.lock();
        match state.items.iter().position(|j| j.id == id) {
            Some(index) => {
                state.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Stop accepting work, wake idle workers, and hand back whatever was still waiting.
    pub fn close(&self) -> Vec<QueuedJob> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.available.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;
    use crate::auth::{AuthorizationContext, check_scopes};
    use crate::builder::build;
    use crate::template::Registry;
    use crate::validate::ResolvedParams;

    fn queued_job() -> QueuedJob {
        let registry = Registry::from_str("[templates.uptime]\ncommand = \"uptime\"\n").unwrap();
        let template = registry.lookup("uptime").unwrap();
        let grant = check_scopes(&template, &AuthorizationContext::new("q", ["x"])).unwrap();
        let command = build(&template, &ResolvedParams::default(), grant).unwrap();
        QueuedJob {
            id: uuid::Uuid::now_v7(),
            template,
            command,
        }
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = JobQueue::new(4);
        let jobs: Vec<_> = (0..3).map(|_| queued_job()).collect();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        for job in jobs {
            queue.enqueue(job).unwrap();
        }
        for id in ids {
            assert_eq!(queue.dequeue().await.unwrap().id, id);
        }
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = JobQueue::new(2);
        queue.enqueue(queued_job()).unwrap();
        queue.enqueue(queued_job()).unwrap();
        let err = queue.enqueue(queued_job()).unwrap_err();
        assert!(matches!(err, GateError::QueueFull { capacity: 2 }));
    }

    #[test]
    fn reservations_count_against_capacity() {
        let queue = JobQueue::new(1);
        let held = queue.reserve().unwrap();
        assert!(matches!(queue.reserve(), Err(GateError::QueueFull { .. })));
        drop(held);
        assert!(queue.reserve().is_ok());
    }

    #[test]
    fn cancel_removes_waiting_job() {
        let queue = JobQueue::new(4);
        let job = queued_job();
        let id = job.id;
        queue.enqueue(job).unwrap();
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_waits_for_push() {
        let queue = Arc::new(JobQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await.map(|j| j.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let job = queued_job();
        let id = job.id;
        queue.enqueue(job).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn close_wakes_idle_workers() {
        let queue = Arc::new(JobQueue::new(4));
        let idle = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.close().is_empty());
        assert!(idle.await.unwrap());
        assert!(queue.reserve().is_err());
    }

    #[test]
    fn close_returns_waiting_jobs() {
        let queue = JobQueue::new(4);
        queue.enqueue(queued_job()).unwrap();
        queue.enqueue(queued_job()).unwrap();
        assert_eq!(queue.close().len(), 2);
    }
}
