//! # Actuators.
//!
//! An actuator is a unit that drives a physical output (heater, pump, valve). Power is
//! a percentage in `0..=100`; out-of-range input is **clamped**, never rejected.
//!
//! [`Switch`] holds the on/power state most actuators need and renders it for
//! snapshots.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::TaskError;
use crate::unit::lifecycle::Lifecycle;

/// Output power in percent, always within `0..=100`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Power(u8);

impl Power {
    /// Full power.
    pub const FULL: Power = Power(100);
    /// No power.
    pub const ZERO: Power = Power(0);

    /// Clamps `value` into `0..=100`.
    ///
    /// ```
    /// use brewvisor::Power;
    ///
    /// assert_eq!(Power::new(80).percent(), 80);
    /// assert_eq!(Power::new(150), Power::FULL);
    /// assert_eq!(Power::new(-5), Power::ZERO);
    /// ```
    pub fn new(value: i64) -> Self {
        Power(value.clamp(0, 100) as u8)
    }

    /// Value in percent.
    pub fn percent(self) -> u8 {
        self.0
    }
}

impl Default for Power {
    fn default() -> Self {
        Power::FULL
    }
}

impl From<i64> for Power {
    fn from(value: i64) -> Self {
        Power::new(value)
    }
}

impl From<Power> for u8 {
    fn from(p: Power) -> Self {
        p.0
    }
}

/// A unit driving a physical output.
#[async_trait]
pub trait Actuator: Lifecycle {
    /// Switches the output on at `power`.
    async fn on(&self, power: Power) -> Result<(), TaskError>;

    /// Switches the output off.
    async fn off(&self) -> Result<(), TaskError>;

    /// Changes the power. By default only the stored power is updated while off,
    /// and the output is re-driven while on.
    async fn set_power(&self, power: Power) -> Result<(), TaskError> {
        if self.is_on() {
            self.on(power).await
        } else {
            Ok(())
        }
    }

    /// True while the output is on.
    fn is_on(&self) -> bool;

    /// Current (or last requested) power.
    fn power(&self) -> Power;
}

/// Shared on/power state for actuator implementations.
#[derive(Debug)]
pub struct Switch {
    on: AtomicBool,
    power: AtomicU8,
}

impl Default for Switch {
    fn default() -> Self {
        Self {
            on: AtomicBool::new(false),
            power: AtomicU8::new(Power::FULL.percent()),
        }
    }
}

impl Switch {
    /// Records the output as on at `power`.
    pub fn set_on(&self, power: Power) {
        self.power.store(power.percent(), Ordering::SeqCst);
        self.on.store(true, Ordering::SeqCst);
    }

    /// Records the output as off; the power is kept for the next `on`.
    pub fn set_off(&self) {
        self.on.store(false, Ordering::SeqCst);
    }

    /// Records a new power without touching the on/off state.
    pub fn set_power(&self, power: Power) {
        self.power.store(power.percent(), Ordering::SeqCst);
    }

    /// True while on.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Current power.
    pub fn power(&self) -> Power {
        Power(self.power.load(Ordering::SeqCst))
    }

    /// `{ "state": bool, "power": u8 }`.
    pub fn snapshot(&self) -> Value {
        json!({ "state": self.is_on(), "power": self.power().percent() })
    }
}
