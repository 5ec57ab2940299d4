//! # Unit: drives one [`Lifecycle`] behaviour through the scheduler.
//!
//! ## States
//! ```text
//! Created ─init()─► Ready ─start()─► Running ─stop()/next()─► Stopping ─► Stopped
//!                                       │                                  ▲
//!                                       └──── natural end / failure ───────┘
//! Stopped ─start()─► Running            (a fresh start re-enters the cycle)
//! ```
//!
//! ## Rules
//! - At most one job per unit; `start()` on a running unit is a no-op.
//! - `stop()` waits for the unwind, so `on_stop()` side effects are visible when it
//!   returns. `stop()` on a unit that is not running is a no-op.
//! - Cancellation is swallowed; any other failure goes to the job observer exactly
//!   once: the done hook when one is set, the scheduler's exception handler otherwise.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::Props;
use crate::error::{TaskError, UnitError};
use crate::scheduler::{Job, Scheduler};
use crate::unit::lifecycle::Lifecycle;
use crate::unit::step::StepResult;

/// Lifecycle state of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Built, `init()` not called yet.
    Created,
    /// Initialized, never started.
    Ready,
    /// Job scheduled or running.
    Running,
    /// Stop requested, waiting for the unwind.
    Stopping,
    /// Finished.
    Stopped,
}

/// Serializable view returned by [`Unit::get_state`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnitSnapshot {
    /// Unit id.
    pub id: String,
    /// Descriptor type name.
    #[serde(rename = "type")]
    pub unit_type: String,
    /// Lifecycle state.
    pub state: UnitState,
    /// True while the unit's job is scheduled or running.
    pub running: bool,
    /// Behaviour-specific state.
    pub data: Value,
}

/// Observer invoked with the unit id and the result of each run.
pub type DoneHook = Arc<dyn Fn(&str, Result<StepResult, TaskError>) + Send + Sync>;

#[derive(Debug)]
struct Status {
    state: UnitState,
    cancel_reason: Option<StepResult>,
    // Set once the current job body is entered.
    entered: bool,
}

/// A controllable long-running component.
pub struct Unit<L: ?Sized + Lifecycle> {
    id: Arc<str>,
    unit_type: Arc<str>,
    kind: Arc<str>,
    props: Props,
    behaviour: Arc<L>,
    scheduler: Scheduler,
    status: Mutex<Status>,
    job: tokio::sync::Mutex<Option<Job>>,
    on_done: Option<DoneHook>,
}

impl<L: ?Sized + Lifecycle> Unit<L> {
    /// Creates a unit in [`UnitState::Created`].
    ///
    /// `kind` is used as the scheduler job type, so completions are fired on
    /// `job/<kind>/done`.
    pub fn new(
        id: impl Into<Arc<str>>,
        unit_type: impl Into<Arc<str>>,
        kind: impl Into<Arc<str>>,
        props: Props,
        behaviour: Arc<L>,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Self::build(id, unit_type, kind, props, behaviour, scheduler, None)
    }

    /// Creates a unit whose run results are handed to `hook` instead of the scheduler.
    pub fn with_done_hook(
        id: impl Into<Arc<str>>,
        unit_type: impl Into<Arc<str>>,
        kind: impl Into<Arc<str>>,
        props: Props,
        behaviour: Arc<L>,
        scheduler: Scheduler,
        hook: DoneHook,
    ) -> Arc<Self> {
        Self::build(id, unit_type, kind, props, behaviour, scheduler, Some(hook))
    }

    fn build(
        id: impl Into<Arc<str>>,
        unit_type: impl Into<Arc<str>>,
        kind: impl Into<Arc<str>>,
        props: Props,
        behaviour: Arc<L>,
        scheduler: Scheduler,
        on_done: Option<DoneHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            unit_type: unit_type.into(),
            kind: kind.into(),
            props,
            behaviour,
            scheduler,
            status: Mutex::new(Status {
                state: UnitState::Created,
                cancel_reason: None,
                entered: false,
            }),
            job: tokio::sync::Mutex::new(None),
            on_done,
        })
    }

    /// Unit id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Descriptor type name.
    pub fn unit_type(&self) -> &str {
        &self.unit_type
    }

    /// Construction properties.
    pub fn props(&self) -> &Props {
        &self.props
    }

    /// The driven behaviour.
    pub fn behaviour(&self) -> &Arc<L> {
        &self.behaviour
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: UnitState) {
        self.status().state = state;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UnitState {
        self.status().state
    }

    /// True while a job is scheduled or running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), UnitState::Running | UnitState::Stopping)
    }

    /// Reason recorded by the last `stop()`/`next()` or natural end.
    pub fn cancel_reason(&self) -> Option<StepResult> {
        self.status().cancel_reason
    }

    /// Calls the behaviour's `init()` once. Later calls are no-ops.
    pub fn init(&self) -> Result<(), UnitError> {
        let mut status = self.status();
        if status.state != UnitState::Created {
            return Ok(());
        }
        self.behaviour.init().map_err(UnitError::Init)?;
        status.state = UnitState::Ready;
        Ok(())
    }

    /// Schedules the unit's run loop.
    ///
    /// Initializes the behaviour first if needed. A no-op while already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), UnitError> {
        let mut slot = self.job.lock().await;
        if slot.as_ref().is_some_and(|j| !j.is_done()) {
            warn!(unit = %self.id, "unit already running");
            return Ok(());
        }
        self.init()?;

        {
            let mut status = self.status();
            status.state = UnitState::Running;
            status.cancel_reason = None;
            status.entered = false;
        }

        let me = Arc::clone(self);
        let spawned = self
            .scheduler
            .spawn(Arc::clone(&self.id), Arc::clone(&self.kind), move |ctx| {
                me.execute(ctx)
            })
            .await;

        match spawned {
            Ok(job) => {
                *slot = Some(job);
                info!(unit = %self.id, kind = %self.kind, "unit started");
                Ok(())
            }
            Err(e) => {
                self.set_state(UnitState::Ready);
                Err(e.into())
            }
        }
    }

    /// Requests cancellation and waits until `on_stop()` has completed.
    ///
    /// A job still queued in the scheduler is dropped without running; the done hook
    /// then receives the stop reason directly.
    pub async fn stop(&self) {
        self.stop_with(StepResult::Stop).await;
    }

    /// Like [`stop`](Self::stop), but records [`StepResult::Next`].
    pub async fn next(&self) {
        self.stop_with(StepResult::Next).await;
    }

    async fn stop_with(&self, reason: StepResult) {
        let mut slot = self.job.lock().await;
        let Some(job) = slot.take() else {
            return;
        };
        if job.is_done() {
            return;
        }

        {
            let mut status = self.status();
            status.state = UnitState::Stopping;
            status.cancel_reason = Some(reason);
        }
        job.cancel();
        job.wait().await;
        let entered = {
            let mut status = self.status();
            status.state = UnitState::Stopped;
            status.entered
        };
        if !entered {
            if let Some(hook) = &self.on_done {
                hook(&self.id, Ok(reason));
            }
        }
        info!(unit = %self.id, reason = reason.as_label(), "unit stopped");
    }

    /// Snapshot of the unit.
    pub fn get_state(&self) -> UnitSnapshot {
        UnitSnapshot {
            id: self.id.to_string(),
            unit_type: self.unit_type.to_string(),
            state: self.state(),
            running: self.is_running(),
            data: self.behaviour.state(),
        }
    }

    /// Forwards a custom action to the behaviour.
    pub async fn call_action(&self, action: &str, params: Value) -> Result<(), UnitError> {
        self.behaviour.call_action(action, params).await
    }

    /// Job body: drives the behaviour and reports to the observer.
    async fn execute(self: Arc<Self>, ctx: CancellationToken) -> Result<(), TaskError> {
        self.status().entered = true;
        let result = self.drive(ctx).await;
        match &self.on_done {
            Some(hook) => {
                hook(&self.id, result);
                Ok(())
            }
            None => result.map(|_| ()),
        }
    }

    async fn drive(&self, ctx: CancellationToken) -> Result<StepResult, TaskError> {
        let behaviour = &self.behaviour;
        let body = async {
            behaviour.on_start().await?;
            behaviour.run(ctx.clone()).await
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(TaskError::Canceled),
            r = AssertUnwindSafe(body).catch_unwind() => {
                r.unwrap_or_else(|panic| Err(TaskError::panicked(panic)))
            }
        };

        if AssertUnwindSafe(behaviour.on_stop())
            .catch_unwind()
            .await
            .is_err()
        {
            error!(unit = %self.id, "on_stop panicked");
        }

        let mut status = self.status();
        if status.state == UnitState::Running {
            status.state = UnitState::Stopped;
        }
        match result {
            Ok(()) => {
                status.cancel_reason = Some(StepResult::Done);
                Ok(StepResult::Done)
            }
            Err(e) if e.is_canceled() => Ok(status.cancel_reason.unwrap_or(StepResult::Stop)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::bus::EventBus;
    use crate::config::{BusConfig, SchedulerConfig};

    #[derive(Default)]
    struct Probe {
        started: Notify,
        runs: AtomicUsize,
        stopped: AtomicBool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Lifecycle for Probe {
        async fn run(&self, _ctx: CancellationToken) -> Result<(), TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if self.fail.load(Ordering::SeqCst) {
                return Err(TaskError::fail("probe"));
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn state(&self) -> Value {
            json!({ "runs": self.runs.load(Ordering::SeqCst) })
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default(), EventBus::new(BusConfig::default()))
    }

    #[tokio::test]
    async fn stop_waits_for_on_stop() {
        let probe = Arc::new(Probe::default());
        let unit = Unit::new("p1", "Probe", "test", Props::default(), probe.clone(), scheduler());

        unit.start().await.unwrap();
        probe.started.notified().await;
        assert_eq!(unit.state(), UnitState::Running);

        unit.stop().await;
        assert!(probe.stopped.load(Ordering::SeqCst));
        assert_eq!(unit.state(), UnitState::Stopped);
        assert_eq!(unit.cancel_reason(), Some(StepResult::Stop));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let probe = Arc::new(Probe::default());
        let unit = Unit::new("p2", "Probe", "test", Props::default(), probe.clone(), scheduler());

        unit.stop().await;
        assert_eq!(unit.state(), UnitState::Created);
        assert!(!probe.stopped.load(Ordering::SeqCst));

        unit.start().await.unwrap();
        unit.stop().await;
        unit.stop().await;
        assert_eq!(unit.state(), UnitState::Stopped);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_job_and_restart_works() {
        let probe = Arc::new(Probe::default());
        let unit = Unit::new("p3", "Probe", "test", Props::default(), probe.clone(), scheduler());

        unit.start().await.unwrap();
        unit.start().await.unwrap();
        probe.started.notified().await;
        unit.stop().await;
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);

        unit.start().await.unwrap();
        probe.started.notified().await;
        assert_eq!(unit.get_state().data, json!({ "runs": 2 }));
        unit.stop().await;
    }

    #[tokio::test]
    async fn failure_reaches_the_done_hook_once() {
        let probe = Arc::new(Probe::default());
        probe.fail.store(true, Ordering::SeqCst);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: DoneHook = Arc::new(move |id: &str, r: Result<StepResult, TaskError>| {
            sink.lock().unwrap().push((id.to_string(), r.is_err()));
        });
        let unit = Unit::with_done_hook(
            "p4",
            "Probe",
            "step",
            Props::default(),
            probe.clone(),
            scheduler(),
            hook,
        );

        unit.start().await.unwrap();
        let job = unit.job.lock().await.clone().unwrap();
        job.wait().await;

        assert_eq!(*seen.lock().unwrap(), vec![("p4".to_string(), true)]);
        assert!(probe.stopped.load(Ordering::SeqCst));
        assert_eq!(unit.state(), UnitState::Stopped);
        assert!(!unit.is_running());
    }

    #[tokio::test]
    async fn stop_while_queued_reports_the_reason_without_running() {
        let sched = Scheduler::new(
            SchedulerConfig {
                limit: 1,
                ..SchedulerConfig::default()
            },
            EventBus::new(BusConfig::default()),
        );
        let blocker = sched
            .spawn("blocker", "test", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: DoneHook = Arc::new(move |_id: &str, r: Result<StepResult, TaskError>| {
            sink.lock().unwrap().push(r.ok());
        });
        let probe = Arc::new(Probe::default());
        let unit = Unit::with_done_hook(
            "p6",
            "Probe",
            "step",
            Props::default(),
            probe.clone(),
            sched.clone(),
            hook,
        );

        unit.start().await.unwrap();
        assert_eq!(sched.pending_count(), 1);

        unit.next().await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(StepResult::Next)]);
        assert_eq!(unit.state(), UnitState::Stopped);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
        assert!(!probe.stopped.load(Ordering::SeqCst));

        blocker.cancel();
        sched.close().await;
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let probe = Arc::new(Probe::default());
        let unit = Unit::new("p5", "Probe", "test", Props::default(), probe, scheduler());
        let err = unit.call_action("reset", Value::Null).await.unwrap_err();
        assert_eq!(err.as_label(), "unit_unknown_action");
    }
}
