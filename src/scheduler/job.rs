//! # Job handle.
//!
//! A [`Job`] is returned by [`Scheduler::spawn`](crate::Scheduler::spawn) and tracks one
//! unit of background work through its status transitions:
//!
//! ```text
//! Pending ──(slot free)──► Active ──(body returns / fails / panics / cancelled)──► Done
//!    │                                                                            ▲
//!    └──────────────(cancel() while queued, or close())──────────────────────────┘
//! ```
//!
//! The handle is cheap to clone; all clones observe the same job.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::scheduler::core::Shared;

/// Position of a job in the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting in the pending queue.
    Pending,
    /// Running.
    Active,
    /// Finished; an outcome is available.
    Done,
}

/// How a job finished.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    /// The body returned `Ok(())` without being cancelled.
    Completed,
    /// The job was cancelled (before or during execution).
    Cancelled,
    /// The body failed or panicked.
    Failed(Arc<TaskError>),
}

impl JobOutcome {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed(_) => "failed",
        }
    }

    /// True for [`JobOutcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

struct JobInner {
    id: u64,
    name: Arc<str>,
    job_type: Arc<str>,
    token: CancellationToken,
    status: watch::Sender<JobStatus>,
    outcome: OnceLock<JobOutcome>,
    scheduler: Weak<Shared>,
}

/// Handle to a scheduled job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub(crate) fn new(
        id: u64,
        name: Arc<str>,
        job_type: Arc<str>,
        scheduler: Weak<Shared>,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Pending);
        Self {
            inner: Arc::new(JobInner {
                id,
                name,
                job_type,
                token: CancellationToken::new(),
                status,
                outcome: OnceLock::new(),
                scheduler,
            }),
        }
    }

    /// Scheduler-unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Type given at spawn time; used in the `job/<type>/done` topic.
    pub fn job_type(&self) -> &str {
        &self.inner.job_type
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        *self.inner.status.borrow()
    }

    /// True once the job has an outcome.
    pub fn is_done(&self) -> bool {
        self.status() == JobStatus::Done
    }

    /// Outcome, once the job is done.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.inner.outcome.get().cloned()
    }

    /// Requests cancellation.
    ///
    /// - pending: removed from the queue, finishes as `Cancelled`, never starts;
    /// - active: its token is cancelled; the body observes it at its next await;
    /// - done: no-op.
    pub fn cancel(&self) {
        match self.status() {
            JobStatus::Done => return,
            JobStatus::Pending => {
                if let Some(shared) = self.inner.scheduler.upgrade() {
                    shared.cancel_pending(self.inner.id);
                }
            }
            JobStatus::Active => {}
        }
        self.inner.token.cancel();
    }

    /// Waits until the job is done and returns its outcome.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.inner.status.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s == JobStatus::Done).await;
        self.outcome().unwrap_or(JobOutcome::Cancelled)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub(crate) fn activate(&self) {
        self.inner.status.send_replace(JobStatus::Active);
    }

    /// Records the outcome. Only the first call has an effect.
    pub(crate) fn finish(&self, outcome: JobOutcome) {
        if self.inner.outcome.set(outcome).is_ok() {
            self.inner.status.send_replace(JobStatus::Done);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("type", &self.inner.job_type)
            .field("status", &self.status())
            .finish()
    }
}
