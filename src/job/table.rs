use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::{Job, JobCompletion, JobId, JobStatus};
use crate::error::GateError;
use crate::sandbox::CancelHandle;

/// How long finished jobs stay queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Finished jobs older than this are forgotten.
    pub ttl: Duration,
    /// At most this many finished jobs are kept; the oldest go first.
    pub max_finished: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_finished: 1000,
        }
    }
}

struct Entry {
    job: Job,
    /// Present only while the job is running.
    cancel: Option<CancelHandle>,
    /// A cancellation is being audited; workers must not start the job yet.
    held: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    /// Terminal jobs in the order they finished.
    finished: VecDeque<(JobId, Instant)>,
}

impl Inner {
    fn entry(&mut self, id: JobId) -> Result<&mut Entry, GateError> {
        self.entries.get_mut(&id).ok_or(GateError::JobNotFound(id))
    }

    fn mark_finished(&mut self, id: JobId, retention: Retention) {
        let now = Instant::now();
        self.finished.push_back((id, now));
        self.evict(retention, now);
    }

    fn evict(&mut self, retention: Retention, now: Instant) {
        while let Some(&(id, at)) = self.finished.front() {
            let expired = now.saturating_duration_since(at) >= retention.ttl;
            if !expired && self.finished.len() <= retention.max_finished {
                break;
            }
            self.finished.pop_front();
            self.entries.remove(&id);
        }
    }
}

/// Outcome of a cancellation request.
pub(crate) enum CancelRequest {
    /// Was pending or queued and is now held; finish with
    /// [`JobTable::finish_withdraw`] or undo with [`JobTable::release`].
    Held(Job),
    /// Another caller is already withdrawing it.
    InProgress,
    /// Running; the sandbox has been told to stop.
    Signalled,
    /// Already terminal; nothing changed.
    Finished(JobStatus),
}

/// Every job the pipeline knows about. All status changes go through here,
/// under one lock, so readers never observe a torn job.
#[derive(Default)]
pub(crate) struct JobTable {
    inner: Mutex<Inner>,
    retention: Retention,
    released: Notify,
}

impl JobTable {
    pub(crate) fn new(retention: Retention) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, job: Job) {
        self.lock().entries.insert(
            job.id,
            Entry {
                job,
                cancel: None,
                held: false,
            },
        );
    }

    pub(crate) fn remove(&self, id: JobId) -> Option<Job> {
        self.lock().entries.remove(&id).map(|e| e.job)
    }

    pub(crate) fn get(&self, id: JobId) -> Option<Job> {
        let mut inner = self.lock();
        inner.evict(self.retention, Instant::now());
        inner.entries.get(&id).map(|e| e.job.clone())
    }

    pub(crate) fn transition(&self, id: JobId, next: JobStatus) -> Result<(), GateError> {
        self.lock().entry(id)?.job.transition(next)
    }

    /// Mark `id` running and register its cancel handle in one step. Waits
    /// while a cancellation of the job is still being audited.
    pub(crate) async fn start(&self, id: JobId, cancel: CancelHandle) -> Result<Job, GateError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut inner = self.lock();
                let entry = inner.entry(id)?;
                if !entry.held {
                    entry.job.transition(JobStatus::Running)?;
                    entry.cancel = Some(cancel);
                    return Ok(entry.job.clone());
                }
            }
            released.await;
        }
    }

    /// Record the terminal result and drop the cancel handle.
    pub(crate) fn complete(&self, id: JobId, completion: JobCompletion) -> Result<Job, GateError> {
        let mut inner = self.lock();
        let entry = inner.entry(id)?;
        entry.cancel = None;
        entry.job.complete(completion)?;
        let job = entry.job.clone();
        inner.mark_finished(id, self.retention);
        Ok(job)
    }

    pub(crate) fn request_cancel(&self, id: JobId) -> Result<CancelRequest, GateError> {
        let mut inner = self.lock();
        let entry = inner.entry(id)?;
        match entry.job.status {
            JobStatus::Pending | JobStatus::Queued if entry.held => Ok(CancelRequest::InProgress),
            JobStatus::Pending | JobStatus::Queued => {
                entry.held = true;
                Ok(CancelRequest::Held(entry.job.clone()))
            }
            JobStatus::Running => {
                if let Some(handle) = &entry.cancel {
                    handle.cancel();
                }
                Ok(CancelRequest::Signalled)
            }
            terminal => Ok(CancelRequest::Finished(terminal)),
        }
    }

    /// Commit a held cancellation. Returns `None` if the job reached a
    /// terminal state some other way in the meantime.
    pub(crate) fn finish_withdraw(&self, id: JobId) -> Result<Option<Job>, GateError> {
        let result = self.commit_withdraw(&mut self.lock(), id);
        self.released.notify_waiters();
        result
    }

    fn commit_withdraw(&self, inner: &mut Inner, id: JobId) -> Result<Option<Job>, GateError> {
        let entry = inner.entry(id)?;
        entry.held = false;
        if entry.job.status.is_terminal() {
            return Ok(None);
        }
        entry.job.complete(JobCompletion::cancelled())?;
        let job = entry.job.clone();
        inner.mark_finished(id, self.retention);
        Ok(Some(job))
    }

    /// Drop a held cancellation; the job carries on as if it was never asked.
    pub(crate) fn release(&self, id: JobId) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.held = false;
        }
        self.released.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        let mut inner = self.lock();
        inner.evict(self.retention, Instant::now());
        inner.entries.len()
    }

    #[cfg(test)]
    fn evict_at(&self, now: Instant) {
        self.lock().evict(self.retention, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthorizationContext;
    use crate::sandbox::cancel_pair;
    use crate::validate::ResolvedParams;

    fn pending_job(table: &JobTable) -> JobId {
        let job = Job::new(
            "check_port",
            1,
            ResolvedParams::default(),
            AuthorizationContext::new("alice", ["network:read"]),
        );
        let id = job.id;
        table.insert(job);
        id
    }

    fn finish(table: &JobTable) -> JobId {
        let id = pending_job(table);
        table.transition(id, JobStatus::Queued).unwrap();
        table.finish_withdraw(id).unwrap();
        id
    }

    #[tokio::test]
    async fn cancel_queued_job_withdraws_it() {
        let table = JobTable::default();
        let id = pending_job(&table);
        table.transition(id, JobStatus::Queued).unwrap();

        let CancelRequest::Held(job) = table.request_cancel(id).unwrap() else {
            panic!("expected Held");
        };
        assert_eq!(job.status, JobStatus::Queued);
        assert!(matches!(
            table.request_cancel(id).unwrap(),
            CancelRequest::InProgress
        ));

        let job = table.finish_withdraw(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // A worker picking it up afterwards cannot start it.
        let (handle, _signal) = cancel_pair();
        assert!(table.start(id, handle).await.is_err());
    }

    #[tokio::test]
    async fn released_job_can_still_start() {
        let table = JobTable::default();
        let id = pending_job(&table);
        table.transition(id, JobStatus::Queued).unwrap();
        assert!(matches!(
            table.request_cancel(id).unwrap(),
            CancelRequest::Held(_)
        ));
        table.release(id);

        let (handle, _signal) = cancel_pair();
        let job = table.start(id, handle).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn start_waits_for_held_cancellation() {
        let table = std::sync::Arc::new(JobTable::default());
        let id = pending_job(&table);
        table.transition(id, JobStatus::Queued).unwrap();
        assert!(matches!(
            table.request_cancel(id).unwrap(),
            CancelRequest::Held(_)
        ));

        let worker = {
            let table = std::sync::Arc::clone(&table);
            tokio::spawn(async move {
                let (handle, _signal) = cancel_pair();
                table.start(id, handle).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished());

        table.finish_withdraw(id).unwrap();
        let started = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(started, Err(GateError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn cancel_running_job_signals_sandbox() {
        let table = JobTable::default();
        let id = pending_job(&table);
        table.transition(id, JobStatus::Queued).unwrap();
        let (handle, signal) = cancel_pair();
        table.start(id, handle).await.unwrap();

        assert!(matches!(
            table.request_cancel(id).unwrap(),
            CancelRequest::Signalled
        ));
        assert!(signal.is_cancelled());
        assert_eq!(table.get(id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancel_finished_job_is_noop() {
        let table = JobTable::default();
        let id = pending_job(&table);
        table.transition(id, JobStatus::Queued).unwrap();
        let (handle, _signal) = cancel_pair();
        table.start(id, handle).await.unwrap();
        table
            .complete(id, JobCompletion::internal("spawn failed"))
            .unwrap();

        assert!(matches!(
            table.request_cancel(id).unwrap(),
            CancelRequest::Finished(JobStatus::Failed)
        ));
    }

    #[test]
    fn unknown_job_reported() {
        let table = JobTable::default();
        let id = uuid::Uuid::now_v7();
        assert!(table.get(id).is_none());
        assert!(matches!(
            table.request_cancel(id),
            Err(GateError::JobNotFound(_))
        ));
    }

    #[test]
    fn oldest_finished_jobs_evicted_past_the_cap() {
        let table = JobTable::new(Retention {
            ttl: Duration::from_secs(3600),
            max_finished: 2,
        });
        let first = finish(&table);
        let second = finish(&table);
        let live = pending_job(&table);
        let third = finish(&table);

        assert!(table.get(first).is_none());
        assert!(table.get(second).is_some());
        assert!(table.get(third).is_some());
        // Unfinished jobs never count against the cap.
        assert!(table.get(live).is_some());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn finished_jobs_expire_after_ttl() {
        let ttl = Duration::from_secs(60);
        let table = JobTable::new(Retention {
            ttl,
            max_finished: 100,
        });
        let done = finish(&table);
        let live = pending_job(&table);

        table.evict_at(Instant::now() + ttl / 2);
        assert!(table.get(done).is_some());

        table.evict_at(Instant::now() + ttl);
        assert!(table.get(done).is_none());
        assert!(table.get(live).is_some());
        assert!(matches!(
            table.request_cancel(done),
            Err(GateError::JobNotFound(_))
        ));
    }
}
