//! # Registry and injected services.
//!
//! The [`Registry`] is the explicit object holding every controller of a runtime. Units
//! never reach into it directly: each behaviour receives a [`UnitContext`] whose
//! [`Services`] wrap the lookups a unit needs (config values, sensor values, actuator
//! switching, event publishing).
//!
//! ```text
//! Registry ─┬─ actors:     Controller<dyn Actuator>      (autostart)
//!           ├─ sensors:    Controller<dyn Sensor>        (autostart)
//!           ├─ kettles:    Controller<dyn ControlLogic>
//!           ├─ fermenters: Controller<dyn ControlLogic>
//!           └─ steps:      Sequencer
//!
//! Services ── Weak<Registry>    (no ownership cycle through the units)
//! ```

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::bus::EventBus;
use crate::config::Config;
use crate::core::controller::{Controller, Props, reading};
use crate::scheduler::Scheduler;
use crate::unit::{Actuator, ControlLogic, Hysteresis, Power, Sensor, Sequencer};

/// Everything a factory gets to build one behaviour.
#[derive(Clone)]
pub struct UnitContext {
    /// Unit id.
    pub id: Arc<str>,
    /// Descriptor props.
    pub props: Props,
    /// Shared services.
    pub services: Services,
}

/// Lookups and side effects available to units.
#[derive(Clone)]
pub struct Services {
    bus: EventBus,
    scheduler: Scheduler,
    config: Arc<Config>,
    registry: Weak<Registry>,
}

impl Services {
    /// Event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Job scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Static configuration value.
    pub fn config_value(&self, name: &str) -> Option<&Value> {
        self.config.value(name)
    }

    /// The registry, unless the runtime is being torn down.
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }

    /// Last value of a sensor.
    pub fn sensor_value(&self, id: &str) -> Option<f64> {
        self.registry()?.sensors.value(id)
    }

    /// On/off state of an actuator.
    pub fn actor_state(&self, id: &str) -> Option<bool> {
        self.registry()?.actors.is_on(id)
    }

    /// Switches an actuator on; failures are logged by the controller.
    pub async fn actor_on(&self, id: &str, power: Option<Power>) {
        if let Some(reg) = self.registry() {
            reg.actors.on(id, power).await;
        }
    }

    /// Switches an actuator off; failures are logged by the controller.
    pub async fn actor_off(&self, id: &str) {
        if let Some(reg) = self.registry() {
            reg.actors.off(id).await;
        }
    }

    /// Changes an actuator's power; failures are logged by the controller.
    pub async fn actor_set_power(&self, id: &str, power: Power) {
        if let Some(reg) = self.registry() {
            reg.actors.set_power(id, power).await;
        }
    }

    /// Publishes a sensor reading on `sensor/reading/<id>`.
    pub fn push_reading(&self, id: &str, value: f64) {
        self.bus
            .fire_and_forget(&format!("sensor/reading/{id}"), reading(id, value));
    }

    /// Publishes an arbitrary update without waiting for handlers.
    pub fn push_update(&self, topic: &str, payload: Value) {
        self.bus.fire_and_forget(topic, payload);
    }
}

/// All controllers of a runtime.
pub struct Registry {
    /// Actuators (heaters, pumps, valves).
    pub actors: Controller<dyn Actuator>,
    /// Sensors.
    pub sensors: Controller<dyn Sensor>,
    /// Kettle control logics.
    pub kettles: Controller<dyn ControlLogic>,
    /// Fermenter control logics.
    pub fermenters: Controller<dyn ControlLogic>,
    /// Brewing process steps.
    pub steps: Sequencer,
    services: Services,
}

impl Registry {
    /// Creates the registry with the built-in control logic types registered.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Arc<Config>, bus: EventBus, scheduler: Scheduler) -> Arc<Self> {
        let registry = Arc::new_cyclic(|weak: &Weak<Registry>| {
            let services = Services {
                bus: bus.clone(),
                scheduler: scheduler.clone(),
                config,
                registry: weak.clone(),
            };
            Registry {
                actors: Controller::new("actor", true, services.clone()),
                sensors: Controller::new("sensor", true, services.clone()),
                kettles: Controller::new("kettle", false, services.clone()),
                fermenters: Controller::new("fermenter", false, services.clone()),
                steps: Sequencer::new(bus, scheduler),
                services,
            }
        });

        registry
            .kettles
            .register_type(Hysteresis::TYPE, Hysteresis::factory);
        registry
            .fermenters
            .register_type(Hysteresis::TYPE, Hysteresis::factory);
        registry
    }

    /// Services shared with every unit.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Stops the sequence, then every logic, sensor and actuator.
    ///
    /// Actuators go last so control logics can switch them off in `on_stop()`.
    pub async fn shutdown(&self) {
        self.steps.stop().await;
        futures::join!(self.kettles.shutdown(), self.fermenters.shutdown());
        self.sensors.shutdown().await;
        self.actors.shutdown().await;
    }
}
