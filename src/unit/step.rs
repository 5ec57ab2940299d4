//! # Process steps and their sequencer.
//!
//! A step is a bounded unit: its run body ends on its own (or is stopped) and the
//! result is reported through a done hook to the owning [`Sequencer`]:
//!
//! ```text
//! step run ends ──► hook(id, result)
//!                    ├─ Ok(Next | Done) → step Done,  advance to the next step
//!                    ├─ Ok(Stop)        → step Stop,  sequence halts
//!                    └─ Err(_)          → step Error, fire step/error/<id>, halts
//! no step left ───► fire step/finished
//! ```
//!
//! Advancing happens on a dedicated loop, so a hook never starts a unit itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::core::Props;
use crate::error::{ControllerError, TaskError};
use crate::scheduler::Scheduler;
use crate::unit::core::{DoneHook, Unit};
use crate::unit::lifecycle::Lifecycle;

/// Disposition of a finished step run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResult {
    /// Stopped on request; the sequence halts.
    Stop,
    /// Skipped forward on request.
    Next,
    /// Ran to completion.
    Done,
    /// Failed.
    Error,
}

impl StepResult {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            StepResult::Stop => "stop",
            StepResult::Next => "next",
            StepResult::Done => "done",
            StepResult::Error => "error",
        }
    }
}

/// Position of a step within its sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Not started yet.
    #[serde(rename = "I")]
    Initial,
    /// Running.
    #[serde(rename = "A")]
    Active,
    /// Finished (completed or skipped).
    #[serde(rename = "D")]
    Done,
    /// Failed.
    #[serde(rename = "E")]
    Error,
    /// Stopped on request.
    #[serde(rename = "S")]
    Stop,
}

/// Serializable view of one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepStatus {
    /// Step id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current state.
    pub state: StepState,
}

/// Unit type of a step: any lifecycle behaviour.
pub type StepUnit = Unit<dyn Lifecycle>;

struct Entry {
    name: String,
    state: StepState,
    unit: Arc<StepUnit>,
}

struct SeqInner {
    bus: EventBus,
    scheduler: Scheduler,
    steps: Mutex<Vec<Entry>>,
    running: AtomicBool,
    op: tokio::sync::Mutex<()>,
    advance: mpsc::UnboundedSender<()>,
}

impl SeqInner {
    fn steps(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> Option<Arc<StepUnit>> {
        self.steps()
            .iter()
            .find(|e| e.state == StepState::Active)
            .map(|e| Arc::clone(&e.unit))
    }

    /// Called synchronously from the step's job when its run ends.
    fn on_step_done(&self, id: &str, result: Result<StepResult, TaskError>) {
        let mut steps = self.steps();
        let Some(entry) = steps.iter_mut().find(|e| e.unit.id() == id) else {
            return;
        };
        match result {
            Ok(StepResult::Next | StepResult::Done) => {
                entry.state = StepState::Done;
                info!(step = id, "step done");
                let _ = self.advance.send(());
            }
            Ok(StepResult::Stop) => {
                entry.state = StepState::Stop;
            }
            Ok(StepResult::Error) => {
                entry.state = StepState::Error;
                self.fail(id, "step reported an error");
            }
            Err(e) => {
                entry.state = StepState::Error;
                self.fail(id, &e.to_string());
            }
        }
    }

    fn fail(&self, id: &str, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        error!(step = id, error = reason, "step failed");
        self.bus.fire_and_forget(
            &format!("step/error/{id}"),
            json!({ "id": id, "error": reason }),
        );
    }

    /// Starts the first step that is not done, or reports the sequence finished.
    async fn start_next(&self) {
        let _op = self.op.lock().await;
        if !self.running.load(Ordering::SeqCst) || self.active().is_some() {
            return;
        }

        let next = {
            let mut steps = self.steps();
            steps
                .iter_mut()
                .find(|e| e.state != StepState::Done)
                .map(|e| {
                    e.state = StepState::Active;
                    Arc::clone(&e.unit)
                })
        };

        let Some(unit) = next else {
            self.running.store(false, Ordering::SeqCst);
            info!("sequence finished");
            self.bus.fire_and_forget("step/finished", json!({}));
            return;
        };

        if let Err(e) = unit.start().await {
            if let Some(entry) = self.steps().iter_mut().find(|s| s.unit.id() == unit.id()) {
                entry.state = StepState::Error;
            }
            self.fail(unit.id(), &e.to_string());
        }
    }
}

/// Runs an ordered list of steps one after another.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<SeqInner>,
}

impl Sequencer {
    /// Creates an empty sequencer.
    pub fn new(bus: EventBus, scheduler: Scheduler) -> Self {
        let (advance, mut rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SeqInner {
            bus,
            scheduler,
            steps: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            op: tokio::sync::Mutex::new(()),
            advance,
        });

        let weak: Weak<SeqInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.start_next().await;
            }
        });
        Self { inner }
    }

    /// Appends a step. Ids must be unique within the sequence.
    pub fn add(
        &self,
        id: impl Into<Arc<str>>,
        name: impl Into<String>,
        behaviour: Arc<dyn Lifecycle>,
        props: Props,
    ) -> Result<(), ControllerError> {
        let id: Arc<str> = id.into();
        let mut steps = self.inner.steps();
        if steps.iter().any(|e| e.unit.id() == &*id) {
            return Err(ControllerError::DuplicateId { id: id.to_string() });
        }

        let weak = Arc::downgrade(&self.inner);
        let hook: DoneHook = Arc::new(move |id: &str, result: Result<StepResult, TaskError>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_step_done(id, result);
            }
        });
        let unit = Unit::with_done_hook(
            id,
            "step",
            "step",
            props,
            behaviour,
            self.inner.scheduler.clone(),
            hook,
        );
        steps.push(Entry {
            name: name.into(),
            state: StepState::Initial,
            unit,
        });
        Ok(())
    }

    /// Starts (or resumes) the sequence at the first step that is not done.
    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.start_next().await;
    }

    /// Ends the active step with [`StepResult::Next`], which advances the sequence.
    pub async fn next(&self) {
        let _op = self.inner.op.lock().await;
        if let Some(unit) = self.inner.active() {
            unit.next().await;
        }
    }

    /// Stops the active step and halts the sequence.
    pub async fn stop(&self) {
        let _op = self.inner.op.lock().await;
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(unit) = self.inner.active() {
            unit.stop().await;
        }
    }

    /// Stops the sequence and marks every step as not started.
    pub async fn reset(&self) {
        self.stop().await;
        for entry in self.inner.steps().iter_mut() {
            entry.state = StepState::Initial;
        }
    }

    /// True while the sequence is advancing.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of every step in order.
    pub fn status(&self) -> Vec<StepStatus> {
        self.inner
            .steps()
            .iter()
            .map(|e| StepStatus {
                id: e.unit.id().to_string(),
                name: e.name.clone(),
                state: e.state,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::bus::HandlerFn;
    use crate::config::{BusConfig, SchedulerConfig};

    enum Mode {
        Quick,
        Long,
        Fail,
    }

    struct TestStep(Mode);

    #[async_trait]
    impl Lifecycle for TestStep {
        async fn run(&self, _ctx: CancellationToken) -> Result<(), TaskError> {
            match self.0 {
                Mode::Quick => Ok(()),
                Mode::Long => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Mode::Fail => Err(TaskError::fail("sensor missing")),
            }
        }
    }

    fn sequencer() -> Sequencer {
        let bus = EventBus::new(BusConfig::default());
        let scheduler = Scheduler::new(SchedulerConfig::default(), bus.clone());
        Sequencer::new(bus, scheduler)
    }

    fn once(seq: &Sequencer, topic: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        seq.inner
            .bus
            .register(
                topic,
                HandlerFn::arc("test", topic.to_string(), move |_, _| {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    async { Ok(()) }
                }),
                true,
            )
            .unwrap();
        rx
    }

    fn step(mode: Mode) -> Arc<dyn Lifecycle> {
        Arc::new(TestStep(mode))
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_reports_finished() {
        let seq = sequencer();
        seq.add("mash", "Mash in", step(Mode::Quick), Props::default()).unwrap();
        seq.add("boil", "Boil", step(Mode::Quick), Props::default()).unwrap();
        let finished = once(&seq, "step/finished");

        seq.start().await;
        finished.await.unwrap();

        let states: Vec<StepState> = seq.status().into_iter().map(|s| s.state).collect();
        assert_eq!(states, vec![StepState::Done, StepState::Done]);
        assert!(!seq.is_running());
    }

    #[tokio::test]
    async fn failure_maps_to_error_and_halts() {
        let seq = sequencer();
        seq.add("s1", "Heat", step(Mode::Fail), Props::default()).unwrap();
        seq.add("s2", "Rest", step(Mode::Quick), Props::default()).unwrap();
        let errored = once(&seq, "step/error/s1");

        seq.start().await;
        errored.await.unwrap();

        let status = seq.status();
        assert_eq!(status[0].state, StepState::Error);
        assert_eq!(status[1].state, StepState::Initial);
    }

    #[tokio::test]
    async fn next_skips_and_stop_halts() {
        let seq = sequencer();
        seq.add("a", "A", step(Mode::Long), Props::default()).unwrap();
        seq.add("b", "B", step(Mode::Long), Props::default()).unwrap();

        seq.start().await;
        assert_eq!(seq.status()[0].state, StepState::Active);

        seq.next().await;
        assert_eq!(seq.status()[0].state, StepState::Done);
        while seq.status()[1].state != StepState::Active {
            tokio::task::yield_now().await;
        }

        seq.stop().await;
        assert_eq!(seq.status()[1].state, StepState::Stop);
        assert!(!seq.is_running());

        seq.reset().await;
        assert!(seq.status().iter().all(|s| s.state == StepState::Initial));
    }

    #[tokio::test]
    async fn stop_while_queued_releases_the_step() {
        let bus = EventBus::new(BusConfig::default());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                limit: 1,
                ..SchedulerConfig::default()
            },
            bus.clone(),
        );
        let (release, gate) = oneshot::channel::<()>();
        let blocker = scheduler
            .spawn("blocker", "test", |_ctx| async move {
                let _ = gate.await;
                Ok(())
            })
            .await
            .unwrap();

        let seq = Sequencer::new(bus, scheduler.clone());
        seq.add("s1", "Mash in", step(Mode::Quick), Props::default()).unwrap();
        seq.start().await;
        assert_eq!(seq.status()[0].state, StepState::Active);
        assert_eq!(scheduler.pending_count(), 1);

        seq.stop().await;
        assert_eq!(seq.status()[0].state, StepState::Stop);

        release.send(()).unwrap();
        blocker.wait().await;

        let finished = once(&seq, "step/finished");
        seq.start().await;
        finished.await.unwrap();
        assert_eq!(seq.status()[0].state, StepState::Done);
    }

    #[tokio::test]
    async fn next_while_queued_advances() {
        let bus = EventBus::new(BusConfig::default());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                limit: 1,
                ..SchedulerConfig::default()
            },
            bus.clone(),
        );
        let (release, gate) = oneshot::channel::<()>();
        scheduler
            .spawn("blocker", "test", |_ctx| async move {
                let _ = gate.await;
                Ok(())
            })
            .await
            .unwrap();

        let seq = Sequencer::new(bus, scheduler);
        seq.add("a", "A", step(Mode::Quick), Props::default()).unwrap();
        seq.add("b", "B", step(Mode::Quick), Props::default()).unwrap();
        let finished = once(&seq, "step/finished");

        seq.start().await;
        seq.next().await;
        assert_eq!(seq.status()[0].state, StepState::Done);

        release.send(()).unwrap();
        finished.await.unwrap();
        assert!(seq.status().iter().all(|s| s.state == StepState::Done));
    }

    #[tokio::test]
    async fn duplicate_step_id_is_rejected() {
        let seq = sequencer();
        seq.add("x", "X", step(Mode::Quick), Props::default()).unwrap();
        let err = seq.add("x", "X again", step(Mode::Quick), Props::default()).unwrap_err();
        assert_eq!(err.as_label(), "controller_duplicate_id");
    }
}
