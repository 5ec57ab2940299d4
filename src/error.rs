//! Error types used by the brewvisor runtime, its jobs and its units.
//!
//! - [`TaskError`] failure of a job body or of a unit hook (`on_start`, `run`, ...).
//! - [`SchedulerError`] contract violations raised by the [`Scheduler`](crate::Scheduler).
//! - [`BusError`] contract violations raised by the [`EventBus`](crate::EventBus).
//! - [`HandlerError`] failure returned by a bus handler (logged at the dispatch boundary).
//! - [`UnitError`] / [`ControllerError`] lifecycle and controller failures.
//! - [`RuntimeError`] failures of the runtime itself.
//!
//! Every enum provides `as_label` (stable snake_case label for logs).

use std::any::Any;

use thiserror::Error;

/// # Errors produced by job bodies and unit hooks.
///
/// `Canceled` is the cooperative cancellation signal; it is absorbed at the unit
/// boundary and by the scheduler and never reported as a failure.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Execution failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Execution observed a cancellation request and stopped.
    #[error("context cancelled")]
    Canceled,

    /// Execution panicked; the panic was caught at the supervision boundary.
    #[error("panicked: {info}")]
    Panicked {
        /// Panic payload rendered as text.
        info: String,
    },
}

impl TaskError {
    /// Shorthand for [`TaskError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        TaskError::Fail {
            error: error.into(),
        }
    }

    /// Builds a [`TaskError::Panicked`] from a caught panic payload.
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let info = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError::Panicked { info }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use brewvisor::TaskError;
    ///
    /// assert_eq!(TaskError::fail("boom").as_label(), "task_failed");
    /// assert_eq!(TaskError::Canceled.as_label(), "task_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fail { .. } => "task_failed",
            TaskError::Canceled => "task_canceled",
            TaskError::Panicked { .. } => "task_panicked",
        }
    }

    /// True for the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

/// Contract violations raised synchronously by the scheduler.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// `spawn` was called after `close` had begun.
    #[error("scheduler closed")]
    Closed,
}

impl SchedulerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SchedulerError::Closed => "scheduler_closed",
        }
    }
}

/// Errors raised by the event bus.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The handler is already registered; unregister it first.
    #[error("handler {key} already registered on '{topic}'; unregister first")]
    AlreadyRegistered {
        /// Reply key of the handler (`scope.name`).
        key: String,
        /// Topic the handler is currently registered on.
        topic: String,
    },

    /// The topic pattern is malformed.
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The rejected pattern.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A result was requested for a key that was never tracked.
    #[error("event key {key} not found")]
    UnknownKey {
        /// The requested key.
        key: String,
    },
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::AlreadyRegistered { .. } => "bus_already_registered",
            BusError::InvalidTopic { .. } => "bus_invalid_topic",
            BusError::UnknownKey { .. } => "bus_unknown_key",
        }
    }
}

/// Failure returned by a bus handler.
///
/// Recovered at the dispatch boundary: logged, never surfaced to the publisher.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler failed.
    #[error("handler failed: {error}")]
    Failed {
        /// The underlying error message.
        error: String,
    },
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(error: impl Into<String>) -> Self {
        HandlerError::Failed {
            error: error.into(),
        }
    }
}

impl From<TaskError> for HandlerError {
    fn from(e: TaskError) -> Self {
        HandlerError::failed(e.to_string())
    }
}

/// Errors raised by unit lifecycle operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum UnitError {
    /// `init()` of the behaviour failed.
    #[error("init failed: {0}")]
    Init(#[source] TaskError),

    /// The scheduler refused the unit's run loop.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The behaviour does not implement the requested custom action.
    #[error("unknown action '{action}'")]
    UnknownAction {
        /// Requested action name.
        action: String,
    },

    /// A custom action failed.
    #[error("action '{action}' failed: {source}")]
    Action {
        /// Requested action name.
        action: String,
        /// Underlying failure.
        #[source]
        source: TaskError,
    },
}

impl UnitError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            UnitError::Init(_) => "unit_init_failed",
            UnitError::Scheduler(_) => "unit_scheduler_refused",
            UnitError::UnknownAction { .. } => "unit_unknown_action",
            UnitError::Action { .. } => "unit_action_failed",
        }
    }
}

/// Errors raised by controllers when building or looking up units.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A unit with this id already exists in the controller.
    #[error("unit '{id}' already exists")]
    DuplicateId {
        /// Offending id.
        id: String,
    },

    /// No factory is registered for the descriptor's type.
    #[error("unknown unit type '{unit_type}'")]
    UnknownType {
        /// Requested type name.
        unit_type: String,
    },

    /// No unit with this id.
    #[error("unit '{id}' not found")]
    NotFound {
        /// Requested id.
        id: String,
    },

    /// The type factory failed to build the behaviour.
    #[error("failed to build unit '{id}': {error}")]
    Build {
        /// Id of the unit being built.
        id: String,
        /// Factory failure.
        #[source]
        error: TaskError,
    },

    /// A lifecycle operation failed.
    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl ControllerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControllerError::DuplicateId { .. } => "controller_duplicate_id",
            ControllerError::UnknownType { .. } => "controller_unknown_type",
            ControllerError::NotFound { .. } => "controller_not_found",
            ControllerError::Build { .. } => "controller_build_failed",
            ControllerError::Unit(e) => e.as_label(),
        }
    }
}

/// # Errors produced by the runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// OS signal listeners could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Signal(_) => "runtime_signal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panicked_renders_str_and_string_payloads() {
        let e = TaskError::panicked(Box::new("boom"));
        assert_eq!(e.to_string(), "panicked: boom");

        let e = TaskError::panicked(Box::new(String::from("bang")));
        assert_eq!(e.as_label(), "task_panicked");
        assert!(e.to_string().contains("bang"));

        let e = TaskError::panicked(Box::new(42u8));
        assert!(e.to_string().contains("unknown"));
    }

    #[test]
    fn controller_error_forwards_unit_label() {
        let e = ControllerError::from(UnitError::Scheduler(SchedulerError::Closed));
        assert_eq!(e.as_label(), "unit_scheduler_refused");
        assert_eq!(e.to_string(), "scheduler closed");
    }
}
