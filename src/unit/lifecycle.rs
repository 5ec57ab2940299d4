//! # Lifecycle contract shared by every unit.
//!
//! A behaviour implements [`Lifecycle`]; a [`Unit`](crate::Unit) drives it:
//!
//! ```text
//! init() ─► on_start() ─► run(ctx) ─┬─ natural end
//!                                   ├─ Err(e)          (reported to the job observer)
//!                                   └─ ctx cancelled   (swallowed)
//!                         on_stop() ◄── always, on every exit path
//! ```
//!
//! `run` is dropped at its next await point once the unit is stopped, so long loops
//! only need to await regularly; checking `ctx` is optional.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, UnitError};

/// Hooks of a controllable long-running component.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
/// use brewvisor::{Lifecycle, TaskError};
///
/// struct Blink;
///
/// #[async_trait]
/// impl Lifecycle for Blink {
///     async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
///         while !ctx.is_cancelled() {
///             tokio::time::sleep(Duration::from_millis(500)).await;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// One-time setup, called before the first start.
    fn init(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Runs before `run`. A failure skips `run` but not `on_stop`.
    async fn on_start(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Main body.
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError>;

    /// Cleanup; runs on every exit path and completes before `stop()` returns.
    async fn on_stop(&self) {}

    /// Behaviour-specific state merged into the unit snapshot.
    fn state(&self) -> Value {
        Value::Null
    }

    /// Custom action entry point.
    async fn call_action(&self, action: &str, _params: Value) -> Result<(), UnitError> {
        Err(UnitError::UnknownAction {
            action: action.to_string(),
        })
    }
}
