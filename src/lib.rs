//! # brewvisor
//!
//! **Brewvisor** is the control core of a brewery automation runtime.
//!
//! It drives controllable long-running components (actuators, sensors, kettle and
//! fermenter logics, process steps) through one lifecycle contract, runs all their
//! background work on a bounded job scheduler, and lets them coordinate through a
//! hierarchical publish/subscribe bus instead of direct references.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │    actors    │   │   sensors    │   │kettles/ferm. │   │    steps     │
//!     │ Controller<  │   │ Controller<  │   │ Controller<  │   │  Sequencer   │
//!     │dyn Actuator> │   │ dyn Sensor>  │   │ControlLogic> │   │              │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            └──────────────────┴────────┬─────────┴──────────────────┘
//!                                        ▼
//!                          ┌───────────────────────────┐
//!                          │  Unit<L: Lifecycle>       │  init → on_start → run → on_stop
//!                          └─────────────┬─────────────┘
//!                                        │ spawn(name, type, f(token))
//!                                        ▼
//! ┌───────────────────────────────────────────────────────────────────────────────┐
//! │  Scheduler                                                                    │
//! │  - active set (≤ limit)          - pending FIFO (≤ pending_limit)             │
//! │  - ExceptionHandler (failures)   - close() → CloseReport                      │
//! └──────────────────────────────────────┬────────────────────────────────────────┘
//!                                        │ job/<type>/done
//!                                        ▼
//! ┌───────────────────────────────────────────────────────────────────────────────┐
//! │  EventBus (topic trie: exact, `+` one segment, `#` rest)                      │
//! │  fire(topic, timeout) → ResultContainer    fire_and_forget(topic)             │
//! └───────────────┬────────────────────────┬──────────────────────┬───────────────┘
//!                 ▼                        ▼                      ▼
//!            handler A                handler B               LogWriter (#)
//! ```
//!
//! ### Unit lifecycle
//! ```text
//! Controller::create(Descriptor) ──► factory(UnitContext) ──► Unit (Created)
//!
//! start():
//!   ├─► init() once                     (Created → Ready)
//!   ├─► Scheduler::spawn(id, kind, ..)  (Running; may queue)
//!   └─► job body:
//!         ├─ on_start()
//!         ├─ run(token)      until natural end, failure, or cancellation
//!         └─ on_stop()       always
//!
//! stop():
//!   ├─► cancel the job                  (Stopping)
//!   └─► wait until on_stop() returned   (Stopped)
//! ```
//!
//! ## Features
//! | Area              | Description                                                       | Key types / traits                         |
//! |-------------------|-------------------------------------------------------------------|--------------------------------------------|
//! | **Units**         | One lifecycle contract for every controllable component.          | [`Lifecycle`], [`Unit`]                    |
//! | **Devices**       | Actuators, sensors and control logics with shared helpers.        | [`Actuator`], [`Sensor`], [`ControlLogic`] |
//! | **Steps**         | Ordered process steps advancing on completion.                    | [`Sequencer`], [`StepResult`]              |
//! | **Scheduling**    | Bounded concurrency with a FIFO pending queue.                    | [`Scheduler`], [`Job`]                     |
//! | **Bus**           | Wildcard pub/sub with bounded request/reply.                      | [`EventBus`], [`Handler`], [`HandlerFn`]   |
//! | **Controllers**   | Descriptor-driven creation through explicit type tables.          | [`Controller`], [`Registry`]               |
//! | **Errors**        | Typed errors with stable labels.                                  | [`TaskError`], [`ControllerError`]         |
//! | **Configuration** | Centralized runtime settings.                                     | [`Config`]                                 |
//!
//! ## Optional features
//! - `logging` (default): exports [`LogWriter`], a bus handler mirroring every event to `tracing`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use tokio_util::sync::CancellationToken;
//! use brewvisor::{
//!     Actuator, Config, Descriptor, Lifecycle, Power, Runtime, Switch, TaskError,
//! };
//!
//! #[derive(Default)]
//! struct Pump(Switch);
//!
//! #[async_trait]
//! impl Lifecycle for Pump {
//!     async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
//!         ctx.cancelled().await;
//!         Ok(())
//!     }
//!
//!     fn state(&self) -> Value {
//!         self.0.snapshot()
//!     }
//! }
//!
//! #[async_trait]
//! impl Actuator for Pump {
//!     async fn on(&self, power: Power) -> Result<(), TaskError> {
//!         self.0.set_on(power);
//!         Ok(())
//!     }
//!     async fn off(&self) -> Result<(), TaskError> {
//!         self.0.set_off();
//!         Ok(())
//!     }
//!     fn is_on(&self) -> bool { self.0.is_on() }
//!     fn power(&self) -> Power { self.0.power() }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rt = Runtime::builder(Config::default()).build()?;
//!     let actors = &rt.registry().actors;
//!
//!     actors.register_type("Pump", |_ctx| Ok(Arc::new(Pump::default()) as Arc<dyn Actuator>));
//!     actors.create(Descriptor::new("pump1", "Pump")).await?;
//!
//!     actors.on("pump1", Some(Power::new(40))).await;
//!     assert_eq!(actors.get_state("pump1")?.data, json!({ "state": true, "power": 40 }));
//!
//!     rt.shutdown().await;
//!     Ok(())
//! }
//! ```
pub mod config;

mod bus;
mod core;
mod error;
mod scheduler;
mod unit;

// ---- Public re-exports ----

pub use bus::{
    Event, EventBus, Handler, HandlerFn, HandlerRef, HandlerResult, Reply, ResultContainer,
    SubscriptionInfo,
};
pub use config::Config;
pub use self::core::{
    Controller, Descriptor, Factory, Props, Registry, Runtime, RuntimeBuilder, SHUTDOWN_TOPIC,
    Services, UnitContext,
};
pub use error::{
    BusError, ControllerError, HandlerError, RuntimeError, SchedulerError, TaskError, UnitError,
};
pub use scheduler::{
    CloseReport, ExceptionHandler, Job, JobFailure, JobOutcome, JobStatus, LogExceptionHandler,
    Scheduler,
};
pub use unit::{
    Actuator, ControlLogic, DoneHook, Hysteresis, Lifecycle, PollingSensor, Power, Sensor,
    Sequencer, StepResult, StepState, StepStatus, StepUnit, Switch, Target, Unit, UnitSnapshot,
    UnitState,
};

// Optional: a built-in handler mirroring every event to `tracing` (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use bus::LogWriter;
