//! # Runtime: wires the bus, the scheduler and the registry together.
//!
//! ```text
//! RuntimeBuilder::build()
//!   ├─ EventBus::new(cfg.bus)          + explicit handler table
//!   ├─ Scheduler::with_handler(cfg.scheduler, bus, exception handler)
//!   └─ Registry::new(cfg, bus, scheduler)
//!
//! run_until_signal()
//!   ├─ wait_for_shutdown_signal()
//!   ├─ fire_default("system/shutdown")   (handlers get up to bus.fire_timeout)
//!   └─ shutdown()
//!        ├─ registry.shutdown()          (steps, logics, sensors, actors)
//!        └─ scheduler.close()            → CloseReport
//! ```

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::core::builder::RuntimeBuilder;
use crate::core::registry::{Registry, Services};
use crate::core::shutdown;
use crate::error::RuntimeError;
use crate::scheduler::{CloseReport, Scheduler};

/// Topic fired right before a signal-driven shutdown.
pub const SHUTDOWN_TOPIC: &str = "system/shutdown";

/// A fully wired brewvisor instance.
pub struct Runtime {
    cfg: Arc<Config>,
    bus: EventBus,
    scheduler: Scheduler,
    registry: Arc<Registry>,
}

impl Runtime {
    /// Starts building a runtime from `cfg`.
    pub fn builder(cfg: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: Arc<Config>,
        bus: EventBus,
        scheduler: Scheduler,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            cfg,
            bus,
            scheduler,
            registry,
        }
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Job scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Controllers.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Services handed to units.
    pub fn services(&self) -> &Services {
        self.registry.services()
    }

    /// Stops every unit, then closes the scheduler.
    ///
    /// Jobs that do not unwind within `scheduler.close_timeout` are aborted and
    /// listed in the report.
    pub async fn shutdown(&self) -> CloseReport {
        self.registry.shutdown().await;
        let report = self.scheduler.close().await;
        if report.stuck.is_empty() {
            info!(
                cancelled = report.cancelled,
                discarded = report.discarded,
                "runtime stopped"
            );
        } else {
            warn!(stuck = ?report.stuck, "runtime stopped with stuck jobs");
        }
        report
    }

    /// Waits for a termination signal, announces it on the bus and shuts down.
    pub async fn run_until_signal(&self) -> Result<CloseReport, RuntimeError> {
        let signal = shutdown::wait_for_shutdown_signal().await?;
        info!(signal, "shutdown requested");
        self.bus
            .fire_default(SHUTDOWN_TOPIC, json!({ "signal": signal }))
            .await;
        Ok(self.shutdown().await)
    }
}
