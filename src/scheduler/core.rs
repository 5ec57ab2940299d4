//! # Scheduler: admission-controlled background execution.
//!
//! The [`Scheduler`] is the single authority for running background work. It enforces an
//! optional concurrency ceiling and a bounded FIFO pending queue.
//!
//! ## Architecture
//! ```text
//! spawn(name, type, f)
//!   ├─ closed?                       → Err(SchedulerError::Closed)
//!   ├─ active < limit                → launch now            (Active)
//!   ├─ pending < pending_limit       → push_back             (Pending)
//!   └─ queue full                    → wait for space, retry (backpressure)
//!
//! job task: catch_unwind(body) ──► outcome ──► on_done
//!   on_done:
//!     1. Failed → drain channel (observed exactly once)
//!     2. fire_and_forget("job/<type>/done", { type, key })
//!     3. remove from active; promote FIFO up to free capacity
//!        (queued jobs whose token was cancelled are skipped)
//!     4. wake blocked spawners
//!     5. job.finish(outcome)
//!
//! close(timeout)
//!   ├─ closed = true, wake blocked spawners (they get Err(Closed))
//!   ├─ discard pending (finish as Cancelled, never started)
//!   ├─ cancel active tokens, join until the deadline
//!   ├─ abort stragglers → CloseReport.stuck, job/<type>/done
//!   └─ stop the drain loop
//! ```
//!
//! ## Rules
//! - A job is in the active set or the pending queue, never both.
//! - The state lock is never held across an await.
//! - `close()` always completes; nothing it encounters is raised.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::scheduler::drain::{self, DrainMsg, ExceptionHandler, JobFailure, LogExceptionHandler};
use crate::scheduler::job::{Job, JobOutcome};

type Work = BoxFuture<'static, Result<(), TaskError>>;

/// Summary returned by [`Scheduler::close`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Active jobs that unwound within the timeout.
    pub cancelled: usize,
    /// Queued jobs discarded without starting.
    pub discarded: usize,
    /// Names of jobs still running at the deadline (aborted).
    pub stuck: Vec<String>,
}

struct Active {
    job: Job,
    handle: Option<JoinHandle<()>>,
}

struct Pending {
    job: Job,
    work: Work,
}

#[derive(Default)]
struct State {
    active: HashMap<u64, Active>,
    pending: VecDeque<Pending>,
    closed: bool,
}

pub(crate) struct Shared {
    limit: Option<usize>,
    pending_limit: Option<usize>,
    close_timeout: Duration,
    bus: EventBus,
    state: Mutex<State>,
    space: Notify,
    next_id: AtomicU64,
    failures: mpsc::UnboundedSender<DrainMsg>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_capacity(&self, state: &State) -> bool {
        self.limit.is_none_or(|l| state.active.len() < l)
    }

    fn has_queue_space(&self, state: &State) -> bool {
        self.pending_limit.is_none_or(|l| state.pending.len() < l)
    }

    /// Moves `job` into the active set and starts its task.
    fn launch(self: &Arc<Self>, state: &mut State, job: Job, work: Work) {
        debug!(job = job.name(), job_type = job.job_type(), "job start");
        job.activate();
        let handle = tokio::spawn(run_job(Arc::clone(self), job.clone(), work));
        state.active.insert(
            job.id(),
            Active {
                job,
                handle: Some(handle),
            },
        );
    }

    /// Promotes queued jobs FIFO while capacity is free.
    fn promote(self: &Arc<Self>, state: &mut State) {
        while !state.closed && self.has_capacity(state) {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            if next.job.token().is_cancelled() {
                next.job.finish(JobOutcome::Cancelled);
                continue;
            }
            debug!(job = next.job.name(), "job promoted");
            self.launch(state, next.job, next.work);
        }
    }

    fn on_done(self: &Arc<Self>, job: Job, outcome: JobOutcome) {
        if let JobOutcome::Failed(error) = &outcome {
            let _ = self.failures.send(DrainMsg::Failed(JobFailure {
                id: job.id(),
                name: Arc::from(job.name()),
                job_type: Arc::from(job.job_type()),
                error: Arc::clone(error),
            }));
        }

        self.announce_done(&job);

        {
            let mut state = self.state();
            state.active.remove(&job.id());
            self.promote(&mut state);
        }
        self.space.notify_waiters();

        debug!(job = job.name(), outcome = outcome.as_label(), "job done");
        job.finish(outcome);
    }

    fn announce_done(&self, job: &Job) {
        self.bus.fire_and_forget(
            &format!("job/{}/done", job.job_type()),
            json!({ "type": job.job_type(), "key": job.name() }),
        );
    }

    /// Removes a queued job. Returns `false` if it is no longer queued.
    pub(crate) fn cancel_pending(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state();
            let pos = state.pending.iter().position(|p| p.job.id() == id);
            pos.and_then(|i| state.pending.remove(i))
        };
        match removed {
            Some(p) => {
                debug!(job = p.job.name(), "queued job cancelled");
                p.job.finish(JobOutcome::Cancelled);
                self.space.notify_waiters();
                true
            }
            None => false,
        }
    }
}

/// Runs one job body and reports its outcome.
async fn run_job(shared: Arc<Shared>, job: Job, work: Work) {
    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) if job.token().is_cancelled() => JobOutcome::Cancelled,
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) if e.is_canceled() => JobOutcome::Cancelled,
        Ok(Err(e)) => JobOutcome::Failed(Arc::new(e)),
        Err(panic) => JobOutcome::Failed(Arc::new(TaskError::panicked(panic))),
    };
    shared.on_done(job, outcome);
}

/// Bounded job scheduler.
///
/// Cheap to clone; all clones share the same state. Must be created inside a tokio
/// runtime (the failure drain loop is spawned at construction).
///
/// ## Example
/// ```rust
/// use brewvisor::{EventBus, Scheduler, TaskError};
/// use brewvisor::config::{BusConfig, SchedulerConfig};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bus = EventBus::new(BusConfig::default());
///     let sched = Scheduler::new(SchedulerConfig::default(), bus);
///
///     let job = sched
///         .spawn("hello", "background", |_ctx| async move { Ok::<_, TaskError>(()) })
///         .await?;
///     job.wait().await;
///
///     sched.close().await;
///     assert!(sched.spawn("late", "background", |_| async { Ok(()) }).await.is_err());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler that logs job failures through [`LogExceptionHandler`].
    pub fn new(cfg: SchedulerConfig, bus: EventBus) -> Self {
        Self::with_handler(cfg, bus, Arc::new(LogExceptionHandler))
    }

    /// Creates a scheduler with a custom failure handler.
    pub fn with_handler(
        cfg: SchedulerConfig,
        bus: EventBus,
        handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        let (failures, drain) = drain::spawn(handler);
        Self {
            shared: Arc::new(Shared {
                limit: cfg.concurrency_limit(),
                pending_limit: cfg.pending_capacity(),
                close_timeout: cfg.close_timeout,
                bus,
                state: Mutex::new(State::default()),
                space: Notify::new(),
                next_id: AtomicU64::new(1),
                failures,
                drain: Mutex::new(Some(drain)),
            }),
        }
    }

    /// Schedules `f(token)` as a job.
    ///
    /// Starts immediately if a slot is free, otherwise queues it. When the queue is
    /// full the caller waits until space frees up. Fails with
    /// [`SchedulerError::Closed`] once `close()` has begun, including while waiting.
    ///
    /// The body receives the job's cancellation token and should return at its next
    /// await point once it is cancelled.
    pub async fn spawn<F, Fut>(
        &self,
        name: impl Into<Arc<str>>,
        job_type: impl Into<Arc<str>>,
        f: F,
    ) -> Result<Job, SchedulerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(id, name.into(), job_type.into(), Arc::downgrade(shared));
        let work: Work = Box::pin(f(job.token().clone()));

        loop {
            let notified = shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state();
                if state.closed {
                    return Err(SchedulerError::Closed);
                }
                if shared.has_capacity(&state) {
                    shared.launch(&mut state, job.clone(), work);
                    return Ok(job);
                }
                if shared.has_queue_space(&state) {
                    debug!(job = job.name(), queued = state.pending.len() + 1, "job queued");
                    state.pending.push_back(Pending {
                        job: job.clone(),
                        work,
                    });
                    return Ok(job);
                }
            }

            debug!(job = job.name(), "pending queue full, waiting");
            notified.await;
        }
    }

    /// Closes with the configured `close_timeout`.
    pub async fn close(&self) -> CloseReport {
        self.close_with(self.shared.close_timeout).await
    }

    /// Stops accepting jobs, discards queued ones and cancels active ones, waiting up to
    /// `timeout` for them to unwind. Idempotent: later calls return an empty report.
    pub async fn close_with(&self, timeout: Duration) -> CloseReport {
        let shared = &self.shared;
        let (discarded, active) = {
            let mut state = shared.state();
            if state.closed {
                return CloseReport::default();
            }
            state.closed = true;
            let discarded: Vec<Job> = state.pending.drain(..).map(|p| p.job).collect();
            let active: Vec<(Job, JoinHandle<()>)> = state
                .active
                .values_mut()
                .filter_map(|a| a.handle.take().map(|h| (a.job.clone(), h)))
                .collect();
            (discarded, active)
        };
        shared.space.notify_waiters();

        for job in &discarded {
            job.finish(JobOutcome::Cancelled);
        }
        for (job, _) in &active {
            job.token().cancel();
        }

        let deadline = Instant::now() + timeout;
        let total = active.len();
        let mut stuck = Vec::new();
        for (job, mut handle) in active {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                warn!(job = job.name(), ?timeout, "job did not stop before close timeout");
                shared.state().active.remove(&job.id());
                shared.announce_done(&job);
                job.finish(JobOutcome::Cancelled);
                stuck.push(job.name().to_string());
            }
        }

        let _ = shared.failures.send(DrainMsg::Close);
        let drain = shared
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }

        CloseReport {
            cancelled: total - stuck.len(),
            discarded: discarded.len(),
            stuck,
        }
    }

    /// Number of running jobs.
    pub fn active_count(&self) -> usize {
        self.shared.state().active.len()
    }

    /// Number of queued jobs.
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Active plus pending jobs.
    pub fn len(&self) -> usize {
        let state = self.shared.state();
        state.active.len() + state.pending.len()
    }

    /// True if no job is active or pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if an active or pending job has this name.
    pub fn is_running(&self, name: &str) -> bool {
        let state = self.shared.state();
        state.active.values().any(|a| a.job.name() == name)
            || state.pending.iter().any(|p| p.job.name() == name)
    }

    /// Snapshot of active and pending jobs (active first, then queue order).
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.shared.state();
        let mut active: Vec<Job> = state.active.values().map(|a| a.job.clone()).collect();
        active.sort_by_key(Job::id);
        active.extend(state.pending.iter().map(|p| p.job.clone()));
        active
    }

    /// True once `close()` has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Concurrency ceiling (`None` = unlimited).
    pub fn limit(&self) -> Option<usize> {
        self.shared.limit
    }

    /// Pending queue capacity (`None` = unbounded).
    pub fn pending_limit(&self) -> Option<usize> {
        self.shared.pending_limit
    }

    /// Event bus used for completion notifications.
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Scheduler")
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use crate::bus::HandlerFn;
    use crate::config::BusConfig;
    use crate::scheduler::job::JobStatus;

    fn sched(limit: usize, pending_limit: usize) -> Scheduler {
        let cfg = SchedulerConfig {
            limit,
            pending_limit,
            close_timeout: Duration::from_millis(100),
        };
        Scheduler::new(cfg, EventBus::new(BusConfig::default()))
    }

    /// Spawns a job that runs until its gate is released or it is cancelled.
    async fn gated(s: &Scheduler, name: &str) -> (Job, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let job = s
            .spawn(name.to_string(), "test", move |ctx| async move {
                tokio::select! {
                    _ = rx => Ok(()),
                    _ = ctx.cancelled() => Err(TaskError::Canceled),
                }
            })
            .await
            .unwrap();
        (job, tx)
    }

    #[tokio::test]
    async fn admission_queues_beyond_limit_and_promotes_fifo() {
        let s = sched(2, 0);
        let (j1, g1) = gated(&s, "j1").await;
        let (_j2, _g2) = gated(&s, "j2").await;
        let (j3, _g3) = gated(&s, "j3").await;
        let (j4, _g4) = gated(&s, "j4").await;

        assert_eq!(s.active_count(), 2);
        assert_eq!(s.pending_count(), 2);
        assert_eq!(j3.status(), JobStatus::Pending);

        g1.send(()).unwrap();
        assert!(matches!(j1.wait().await, JobOutcome::Completed));
        assert_eq!(j3.status(), JobStatus::Active);
        assert_eq!(j4.status(), JobStatus::Pending);
        assert_eq!(s.pending_count(), 1);
        assert!(s.is_running("j4"));

        s.close().await;
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_starts() {
        let s = sched(1, 0);
        let (j1, g1) = gated(&s, "j1").await;
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        let j2 = s
            .spawn("j2", "test", move |_| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        j2.cancel();
        assert!(matches!(j2.wait().await, JobOutcome::Cancelled));
        assert_eq!(s.pending_count(), 0);

        g1.send(()).unwrap();
        j1.wait().await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let s = sched(1, 1);
        let (j1, g1) = gated(&s, "j1").await;
        let (_j2, _g2) = gated(&s, "j2").await;

        let s2 = s.clone();
        let blocked = tokio::spawn(async move {
            s2.spawn("j3", "test", |_| async { Ok(()) }).await
        });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        assert_eq!(s.len(), 2);

        g1.send(()).unwrap();
        j1.wait().await;
        let j3 = blocked.await.unwrap().unwrap();
        assert_eq!(j3.status(), JobStatus::Pending);

        s.close().await;
    }

    #[tokio::test]
    async fn close_discards_queue_and_rejects_spawn() {
        let s = sched(1, 0);
        let (j1, _g1) = gated(&s, "j1").await;
        let (j2, _g2) = gated(&s, "j2").await;

        let report = s.close().await;
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.discarded, 1);
        assert!(report.stuck.is_empty());

        assert!(matches!(j1.wait().await, JobOutcome::Cancelled));
        assert!(matches!(j2.wait().await, JobOutcome::Cancelled));
        assert!(s.is_closed());
        assert_eq!(s.close().await, CloseReport::default());

        let err = s.spawn("late", "test", |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, SchedulerError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_jobs_ignoring_cancellation() {
        let s = sched(0, 0);
        let stubborn = s
            .spawn("stubborn", "test", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap();

        let report = s.close_with(Duration::from_millis(50)).await;
        assert_eq!(report.stuck, vec!["stubborn".to_string()]);
        assert_eq!(report.cancelled, 0);
        assert!(matches!(stubborn.outcome(), Some(JobOutcome::Cancelled)));
        assert_eq!(s.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_job_still_fires_job_done() {
        let s = sched(0, 0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.bus()
            .register(
                "job/stubborn/done",
                HandlerFn::arc("test", "aborted", move |ev, _| {
                    let _ = tx.send(ev.field("key").cloned());
                    async { Ok(()) }
                }),
                false,
            )
            .unwrap();
        s.spawn("kettle1", "stubborn", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap();

        let report = s.close_with(Duration::from_millis(50)).await;
        assert_eq!(report.stuck, vec!["kettle1".to_string()]);
        assert_eq!(rx.recv().await.unwrap(), Some(json!("kettle1")));
    }

    #[tokio::test]
    async fn failures_reach_the_exception_handler_once() {
        struct Count(AtomicUsize);
        impl ExceptionHandler for Count {
            fn handle(&self, _: &JobFailure) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(Count(AtomicUsize::new(0)));
        let s = Scheduler::with_handler(
            SchedulerConfig::default(),
            EventBus::new(BusConfig::default()),
            count.clone(),
        );

        let failing = s
            .spawn("bad", "test", |_| async { Err(TaskError::fail("boom")) })
            .await
            .unwrap();
        let panicking = s
            .spawn("worse", "test", |_| async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert!(failing.wait().await.is_failed());
        assert!(panicking.wait().await.is_failed());

        s.close().await;
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completion_fires_job_done_on_the_bus() {
        let s = sched(0, 0);
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        s.bus()
            .register(
                "job/+/done",
                HandlerFn::arc("test", "done", move |ev, _| {
                    let key = ev.field("key").cloned();
                    let tx = tx.lock().unwrap().take();
                    async move {
                        if let (Some(tx), Some(key)) = (tx, key) {
                            let _ = tx.send(key);
                        }
                        Ok(())
                    }
                }),
                false,
            )
            .unwrap();

        s.spawn("brew", "background", |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), json!("brew"));
        s.close().await;
    }
}
