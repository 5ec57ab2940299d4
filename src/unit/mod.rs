//! Controllable long-running components.
//!
//! - [`lifecycle`]: the [`Lifecycle`] hooks every behaviour implements;
//! - [`core`]: [`Unit`], which drives a behaviour through the scheduler;
//! - [`actuator`], [`sensor`], [`logic`]: the device variants and their helpers;
//! - [`step`]: process steps and the [`Sequencer`] that chains them.

mod actuator;
mod core;
mod lifecycle;
mod logic;
mod sensor;
mod step;

pub use self::core::{DoneHook, Unit, UnitSnapshot, UnitState};
pub use actuator::{Actuator, Power, Switch};
pub use lifecycle::Lifecycle;
pub use logic::{ControlLogic, Hysteresis, Target};
pub use sensor::{PollingSensor, Sensor};
pub use step::{Sequencer, StepResult, StepState, StepStatus, StepUnit};
