//! # Kettle and fermenter control logics.
//!
//! A control logic periodically evaluates an algorithm against a target and drives
//! actuators through the injected [`Services`]. [`Hysteresis`] is the reference
//! two-point controller:
//!
//! ```text
//! value <  target - offset_on   → heater on
//! value >= target - offset_off  → heater off
//! otherwise                     → hold
//! ```
//!
//! The heater is always switched off when the logic stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{Services, UnitContext};
use crate::error::{TaskError, UnitError};
use crate::unit::lifecycle::Lifecycle;

/// A unit regulating a process value towards a target.
pub trait ControlLogic: Lifecycle {
    /// Current target.
    fn target(&self) -> f64;

    /// Changes the target; picked up on the next evaluation.
    fn set_target(&self, target: f64);
}

/// Lock-free `f64` cell for targets.
#[derive(Debug, Default)]
pub struct Target(AtomicU64);

impl Target {
    /// Creates a cell holding `value`.
    pub fn new(value: f64) -> Self {
        Target(AtomicU64::new(value.to_bits()))
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    /// Replaces the value.
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Two-point controller switching one heater from one sensor.
///
/// Props: `sensor` and `heater` (ids, required), `offset_on` and `offset_off`
/// (default `0`), `target` (default `0`), `interval` (seconds, default
/// `unit.poll_interval`).
pub struct Hysteresis {
    id: Arc<str>,
    sensor: String,
    heater: String,
    offset_on: f64,
    offset_off: f64,
    interval: Duration,
    target: Target,
    services: Services,
}

impl Hysteresis {
    /// Type name under which the logic is registered.
    pub const TYPE: &'static str = "Hysteresis";

    /// Builds the logic from its props.
    pub fn new(ctx: &UnitContext) -> Result<Self, TaskError> {
        let required = |key: &str| {
            ctx.props
                .str(key)
                .map(str::to_string)
                .ok_or_else(|| TaskError::fail(format!("missing prop `{key}`")))
        };
        Ok(Self {
            id: Arc::clone(&ctx.id),
            sensor: required("sensor")?,
            heater: required("heater")?,
            offset_on: ctx.props.f64("offset_on").unwrap_or(0.0),
            offset_off: ctx.props.f64("offset_off").unwrap_or(0.0),
            interval: ctx
                .props
                .secs("interval")
                .unwrap_or_else(|| ctx.services.config().unit.interval()),
            target: Target::new(ctx.props.f64("target").unwrap_or(0.0)),
            services: ctx.services.clone(),
        })
    }

    /// Factory for [`Controller::register_type`](crate::Controller::register_type).
    pub fn factory(ctx: UnitContext) -> Result<Arc<dyn ControlLogic>, TaskError> {
        Ok(Arc::new(Self::new(&ctx)?))
    }

    /// Heater command for `value`: `Some(true)` on, `Some(false)` off, `None` hold.
    pub fn decide(&self, value: f64) -> Option<bool> {
        let target = self.target.get();
        if value < target - self.offset_on {
            Some(true)
        } else if value >= target - self.offset_off {
            Some(false)
        } else {
            None
        }
    }
}

#[async_trait]
impl Lifecycle for Hysteresis {
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(logic = %self.id, sensor = %self.sensor, heater = %self.heater, "hysteresis started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(TaskError::Canceled),
                _ = tick.tick() => {}
            }
            let Some(value) = self.services.sensor_value(&self.sensor) else {
                debug!(logic = %self.id, sensor = %self.sensor, "no reading yet");
                continue;
            };
            match self.decide(value) {
                Some(true) => self.services.actor_on(&self.heater, None).await,
                Some(false) => self.services.actor_off(&self.heater).await,
                None => {}
            }
        }
    }

    async fn on_stop(&self) {
        self.services.actor_off(&self.heater).await;
    }

    fn state(&self) -> Value {
        json!({
            "target": self.target.get(),
            "sensor": self.sensor,
            "heater": self.heater,
        })
    }

    async fn call_action(&self, action: &str, params: Value) -> Result<(), UnitError> {
        match action {
            "set_target" => {
                let target = params.get("target").and_then(Value::as_f64).ok_or_else(|| {
                    UnitError::Action {
                        action: action.to_string(),
                        source: TaskError::fail("`target` must be a number"),
                    }
                })?;
                self.set_target(target);
                Ok(())
            }
            _ => Err(UnitError::UnknownAction {
                action: action.to_string(),
            }),
        }
    }
}

impl ControlLogic for Hysteresis {
    fn target(&self) -> f64 {
        self.target.get()
    }

    fn set_target(&self, target: f64) {
        self.target.set(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::core::{Descriptor, Props, Registry};
    use crate::unit::{Actuator, PollingSensor, Power, Switch};
    use crate::{EventBus, Scheduler};

    #[derive(Default)]
    struct Heater(Switch);

    #[async_trait]
    impl Lifecycle for Heater {
        async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
            ctx.cancelled().await;
            Ok(())
        }

        fn state(&self) -> Value {
            self.0.snapshot()
        }
    }

    #[async_trait]
    impl Actuator for Heater {
        async fn on(&self, power: Power) -> Result<(), TaskError> {
            self.0.set_on(power);
            Ok(())
        }

        async fn off(&self) -> Result<(), TaskError> {
            self.0.set_off();
            Ok(())
        }

        fn is_on(&self) -> bool {
            self.0.is_on()
        }

        fn power(&self) -> Power {
            self.0.power()
        }
    }

    fn registry() -> Arc<Registry> {
        let cfg = Arc::new(Config::default());
        let bus = EventBus::new(cfg.bus.clone());
        let scheduler = Scheduler::new(cfg.scheduler.clone(), bus.clone());
        Registry::new(cfg, bus, scheduler)
    }

    fn kettle_props() -> Props {
        Props::default()
            .with("sensor", json!("t1"))
            .with("heater", json!("h1"))
            .with("offset_on", json!(1.0))
            .with("offset_off", json!("0.5"))
            .with("target", json!(65))
    }

    #[tokio::test]
    async fn decide_follows_both_thresholds() {
        let reg = registry();
        let ctx = UnitContext {
            id: Arc::from("k1"),
            props: kettle_props(),
            services: reg.services().clone(),
        };
        let logic = Hysteresis::new(&ctx).unwrap();

        assert_eq!(logic.decide(63.9), Some(true));
        assert_eq!(logic.decide(64.2), None);
        assert_eq!(logic.decide(64.5), Some(false));
        assert_eq!(logic.decide(70.0), Some(false));

        logic.set_target(80.0);
        assert_eq!(logic.decide(70.0), Some(true));
    }

    #[tokio::test]
    async fn missing_props_fail_the_build() {
        let reg = registry();
        let err = reg
            .kettles
            .create(Descriptor::new("k0", Hysteresis::TYPE))
            .await
            .err()
            .unwrap();
        assert_eq!(err.as_label(), "controller_build_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn drives_the_heater_and_switches_it_off_on_stop() {
        let reg = registry();
        let reading = Arc::new(Target::new(60.0));

        reg.actors.register_type("Heater", |_ctx| {
            Ok(Arc::new(Heater::default()) as Arc<dyn Actuator>)
        });
        let source = Arc::clone(&reading);
        reg.sensors.register_type(
            "Probe",
            PollingSensor::factory(move || {
                let v = source.get();
                async move { Ok(v) }
            }),
        );
        reg.actors.create(Descriptor::new("h1", "Heater")).await.unwrap();
        reg.sensors.create(Descriptor::new("t1", "Probe")).await.unwrap();
        reg.kettles
            .create(Descriptor::new("k1", Hysteresis::TYPE).with_props(kettle_props()))
            .await
            .unwrap();

        reg.kettles.toggle("k1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reg.actors.is_on("h1"), Some(true));

        reading.set(66.0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reg.actors.is_on("h1"), Some(false));

        reading.set(60.0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reg.actors.is_on("h1"), Some(true));

        reg.kettles.stop("k1").await.unwrap();
        assert_eq!(reg.actors.is_on("h1"), Some(false));
        assert!(!reg.kettles.get_state("k1").unwrap().running);
    }

    #[tokio::test]
    async fn set_target_action() {
        let reg = registry();
        reg.fermenters
            .create(Descriptor::new("f1", Hysteresis::TYPE).with_props(kettle_props()))
            .await
            .unwrap();

        reg.fermenters
            .call_action("f1", "set_target", json!({ "target": 18.5 }))
            .await;
        assert_eq!(reg.fermenters.target("f1"), Some(18.5));

        reg.fermenters.set_target("f1", 20.0).await;
        assert_eq!(reg.fermenters.target("f1"), Some(20.0));
    }
}
