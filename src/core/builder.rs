use std::sync::Arc;

use crate::bus::{EventBus, HandlerRef};
use crate::config::Config;
use crate::core::registry::Registry;
use crate::core::runtime::Runtime;
use crate::error::BusError;
use crate::scheduler::{ExceptionHandler, LogExceptionHandler, Scheduler};

/// Builder for a [`Runtime`].
///
/// Bus handlers are declared here with their topic, before anything runs.
pub struct RuntimeBuilder {
    cfg: Config,
    exception_handler: Arc<dyn ExceptionHandler>,
    handlers: Vec<(String, HandlerRef, bool)>,
}

impl RuntimeBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            exception_handler: Arc::new(LogExceptionHandler),
            handlers: Vec::new(),
        }
    }

    /// Replaces the observer of failed jobs (default: [`LogExceptionHandler`]).
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Subscribes `handler` to `topic` at build time.
    pub fn with_handler(mut self, topic: impl Into<String>, handler: HandlerRef) -> Self {
        self.handlers.push((topic.into(), handler, false));
        self
    }

    /// Subscribes `handler` to the first event on `topic` only.
    pub fn with_once_handler(mut self, topic: impl Into<String>, handler: HandlerRef) -> Self {
        self.handlers.push((topic.into(), handler, true));
        self
    }

    /// Mirrors every event to `tracing` through [`LogWriter`](crate::LogWriter).
    ///
    /// Requires the `logging` feature flag.
    #[cfg(feature = "logging")]
    pub fn with_log_writer(self) -> Self {
        self.with_handler(crate::LogWriter::TOPIC, Arc::new(crate::LogWriter::new()))
    }

    /// Builds the runtime.
    ///
    /// Must be called inside a tokio runtime. Fails if a declared handler is
    /// registered twice or its topic is malformed.
    pub fn build(self) -> Result<Arc<Runtime>, BusError> {
        let cfg = Arc::new(self.cfg);
        let bus = EventBus::new(cfg.bus.clone());
        for (topic, handler, once) in self.handlers {
            bus.register(&topic, handler, once)?;
        }

        let scheduler =
            Scheduler::with_handler(cfg.scheduler.clone(), bus.clone(), self.exception_handler);
        let registry = Registry::new(Arc::clone(&cfg), bus.clone(), scheduler.clone());

        Ok(Arc::new(Runtime::new_internal(cfg, bus, scheduler, registry)))
    }
}
