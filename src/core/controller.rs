//! # Controller: owns the units of one kind.
//!
//! A controller builds units from [`Descriptor`]s through an explicit type table and
//! exposes their lifecycle to the outside world.
//!
//! ```text
//! register_type("Heater", factory)            (static table, filled at startup)
//!
//! create(Descriptor { id, type, props })
//!   ├─ duplicate id?     → Err(DuplicateId)
//!   ├─ types[type]?      → Err(UnknownType)
//!   ├─ factory(ctx)      → Err(Build) on failure
//!   ├─ Unit::new(...)    → units[id]
//!   └─ autostart         → unit.start()
//! ```
//!
//! Device-facing operations (`on`, `off`, `set_power`, `toggle`, `set_target`,
//! `call_action`) log failures instead of returning them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info};

use crate::core::registry::{Services, UnitContext};
use crate::error::{ControllerError, TaskError};
use crate::unit::{Actuator, ControlLogic, Lifecycle, Power, Sensor, Unit, UnitSnapshot};

/// Construction properties of a unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(Map<String, Value>);

impl Props {
    /// Wraps a JSON object.
    pub fn new(map: Map<String, Value>) -> Self {
        Props(map)
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numeric value; numeric strings are accepted too.
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Duration given in (possibly fractional) seconds.
    pub fn secs(&self, key: &str) -> Option<Duration> {
        self.f64(key)
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .filter(|d| !d.is_zero())
    }

    /// Sets a value, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }
}

impl From<Map<String, Value>> for Props {
    fn from(map: Map<String, Value>) -> Self {
        Props(map)
    }
}

/// Stored description of a unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique id within the owning controller.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Type name looked up in the controller's type table.
    #[serde(rename = "type")]
    pub unit_type: String,
    /// Construction properties.
    #[serde(default)]
    pub props: Props,
}

impl Descriptor {
    /// Creates a descriptor with empty props.
    pub fn new(id: impl Into<String>, unit_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            unit_type: unit_type.into(),
            props: Props::default(),
        }
    }

    /// Replaces the props.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }
}

/// Builds a behaviour for a unit.
pub type Factory<L> = Arc<dyn Fn(UnitContext) -> Result<Arc<L>, TaskError> + Send + Sync>;

/// Owner of all units of one kind.
pub struct Controller<L: ?Sized + Lifecycle> {
    kind: &'static str,
    autostart: bool,
    services: Services,
    types: RwLock<HashMap<String, Factory<L>>>,
    units: RwLock<HashMap<String, Arc<Unit<L>>>>,
}

impl<L: ?Sized + Lifecycle> Controller<L> {
    /// Creates an empty controller.
    ///
    /// `kind` names the topics (`<kind>/update/<id>`, `job/<kind>/done`); with
    /// `autostart` every created unit is started right away.
    pub fn new(kind: &'static str, autostart: bool, services: Services) -> Self {
        Self {
            kind,
            autostart,
            services,
            types: RwLock::new(HashMap::new()),
            units: RwLock::new(HashMap::new()),
        }
    }

    fn units(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Unit<L>>>> {
        self.units.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn units_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Unit<L>>>> {
        self.units.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kind label of this controller.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Adds (or replaces) a type in the table.
    pub fn register_type<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(UnitContext) -> Result<Arc<L>, TaskError> + Send + Sync + 'static,
    {
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(factory));
    }

    /// Sorted list of registered type names.
    pub fn types(&self) -> Vec<String> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = types.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Builds a unit from `desc` and adds it to the controller.
    pub async fn create(&self, desc: Descriptor) -> Result<Arc<Unit<L>>, ControllerError> {
        if self.units().contains_key(&desc.id) {
            return Err(ControllerError::DuplicateId { id: desc.id });
        }
        let factory = self
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&desc.unit_type)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownType {
                unit_type: desc.unit_type.clone(),
            })?;

        let id: Arc<str> = Arc::from(desc.id.as_str());
        let ctx = UnitContext {
            id: Arc::clone(&id),
            props: desc.props.clone(),
            services: self.services.clone(),
        };
        let behaviour = factory(ctx).map_err(|error| ControllerError::Build {
            id: desc.id.clone(),
            error,
        })?;
        let unit = Unit::new(
            id,
            desc.unit_type.as_str(),
            self.kind,
            desc.props,
            behaviour,
            self.services.scheduler().clone(),
        );

        {
            let mut units = self.units_mut();
            if units.contains_key(&desc.id) {
                return Err(ControllerError::DuplicateId { id: desc.id });
            }
            units.insert(desc.id.clone(), Arc::clone(&unit));
        }
        info!(kind = self.kind, unit = %desc.id, unit_type = %desc.unit_type, "unit created");

        if self.autostart {
            unit.start().await?;
        }
        Ok(unit)
    }

    /// Stops and drops a unit.
    pub async fn remove(&self, id: &str) -> Result<(), ControllerError> {
        let unit = self.units_mut().remove(id).ok_or_else(|| not_found(id))?;
        unit.stop().await;
        info!(kind = self.kind, unit = id, "unit removed");
        Ok(())
    }

    /// Looks up a unit.
    pub fn unit(&self, id: &str) -> Option<Arc<Unit<L>>> {
        self.units().get(id).cloned()
    }

    fn find(&self, id: &str) -> Result<Arc<Unit<L>>, ControllerError> {
        self.unit(id).ok_or_else(|| not_found(id))
    }

    /// Looks up a unit for a device-facing operation, logging a miss.
    fn find_logged(&self, id: &str, op: &'static str) -> Option<Arc<Unit<L>>> {
        let unit = self.unit(id);
        if unit.is_none() {
            error!(kind = self.kind, unit = id, op, "unit not found");
        }
        unit
    }

    /// Starts a unit.
    pub async fn start(&self, id: &str) -> Result<(), ControllerError> {
        let unit = self.find(id)?;
        unit.start().await?;
        self.push_update(&unit);
        Ok(())
    }

    /// Stops a unit; returns once its `on_stop()` has completed.
    pub async fn stop(&self, id: &str) -> Result<(), ControllerError> {
        let unit = self.find(id)?;
        unit.stop().await;
        self.push_update(&unit);
        Ok(())
    }

    /// Snapshot of one unit.
    pub fn get_state(&self, id: &str) -> Result<UnitSnapshot, ControllerError> {
        self.find(id).map(|u| u.get_state())
    }

    /// Snapshots of every unit, sorted by id.
    pub fn list(&self) -> Vec<UnitSnapshot> {
        let mut all: Vec<UnitSnapshot> = self.units().values().map(|u| u.get_state()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Runs a custom action; failures are logged.
    pub async fn call_action(&self, id: &str, action: &str, params: Value) {
        let Some(unit) = self.find_logged(id, "call_action") else {
            return;
        };
        match unit.call_action(action, params).await {
            Ok(()) => self.push_update(&unit),
            Err(e) => {
                error!(kind = self.kind, unit = id, action, label = e.as_label(), error = %e, "action failed");
            }
        }
    }

    /// Stops every unit concurrently.
    pub async fn shutdown(&self) {
        let units: Vec<Arc<Unit<L>>> = self.units().values().cloned().collect();
        futures::future::join_all(units.iter().map(|u| u.stop())).await;
        info!(kind = self.kind, count = units.len(), "controller shut down");
    }

    /// Fires `<kind>/update/<id>` with the unit snapshot.
    fn push_update(&self, unit: &Unit<L>) {
        let payload = serde_json::to_value(unit.get_state()).unwrap_or(Value::Null);
        self.services
            .push_update(&format!("{}/update/{}", self.kind, unit.id()), payload);
    }
}

fn not_found(id: &str) -> ControllerError {
    ControllerError::NotFound { id: id.to_string() }
}

impl Controller<dyn Actuator> {
    /// Switches an actuator on. With `power = None` the last power is reused.
    /// An actuator that is already on only has its power changed.
    pub async fn on(&self, id: &str, power: Option<Power>) {
        let Some(unit) = self.find_logged(id, "on") else {
            return;
        };
        let actor = unit.behaviour();
        let power = power.unwrap_or_else(|| actor.power());
        let result = if actor.is_on() {
            actor.set_power(power).await
        } else {
            actor.on(power).await
        };
        self.report(&unit, "on", result);
    }

    /// Switches an actuator off.
    pub async fn off(&self, id: &str) {
        let Some(unit) = self.find_logged(id, "off") else {
            return;
        };
        let actor = unit.behaviour();
        if !actor.is_on() {
            return;
        }
        let result = actor.off().await;
        self.report(&unit, "off", result);
    }

    /// Inverts an actuator's on/off state.
    pub async fn toggle(&self, id: &str) {
        let Some(unit) = self.find_logged(id, "toggle") else {
            return;
        };
        let actor = unit.behaviour();
        let result = if actor.is_on() {
            actor.off().await
        } else {
            actor.on(actor.power()).await
        };
        self.report(&unit, "toggle", result);
    }

    /// Changes an actuator's power.
    pub async fn set_power(&self, id: &str, power: Power) {
        let Some(unit) = self.find_logged(id, "set_power") else {
            return;
        };
        let result = unit.behaviour().set_power(power).await;
        self.report(&unit, "set_power", result);
    }

    /// On/off state of an actuator.
    pub fn is_on(&self, id: &str) -> Option<bool> {
        self.unit(id).map(|u| u.behaviour().is_on())
    }

    fn report(&self, unit: &Unit<dyn Actuator>, op: &'static str, result: Result<(), TaskError>) {
        match result {
            Ok(()) => self.push_update(unit),
            Err(e) => error!(unit = unit.id(), op, error = %e, "actuator operation failed"),
        }
    }
}

impl Controller<dyn Sensor> {
    /// Last value read by a sensor.
    pub fn value(&self, id: &str) -> Option<f64> {
        self.unit(id).and_then(|u| u.behaviour().value())
    }
}

impl Controller<dyn ControlLogic> {
    /// Current target of a control logic.
    pub fn target(&self, id: &str) -> Option<f64> {
        self.unit(id).map(|u| u.behaviour().target())
    }

    /// Changes the target of a control logic.
    pub async fn set_target(&self, id: &str, target: f64) {
        let Some(unit) = self.find_logged(id, "set_target") else {
            return;
        };
        unit.behaviour().set_target(target);
        info!(kind = self.kind, unit = id, target, "target changed");
        self.push_update(&unit);
    }

    /// Starts a stopped control logic or stops a running one.
    pub async fn toggle(&self, id: &str) {
        let Some(unit) = self.find_logged(id, "toggle") else {
            return;
        };
        if unit.is_running() {
            unit.stop().await;
        } else if let Err(e) = unit.start().await {
            error!(kind = self.kind, unit = id, error = %e, "failed to start control logic");
            return;
        }
        self.push_update(&unit);
    }
}

/// Event payload helper for readings.
pub(crate) fn reading(id: &str, value: f64) -> Value {
    json!({ "id": id, "value": value })
}
