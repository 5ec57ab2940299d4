//! # Failure drain.
//!
//! Every failing job is pushed onto an unbounded channel and observed **exactly once**
//! by a dedicated loop that hands it to the configured [`ExceptionHandler`]. The loop
//! ends only when `close()` sends [`DrainMsg::Close`].
//!
//! ```text
//! on_done(Failed) ──► tx.send(Failed(JobFailure)) ──► drain loop ──► handler.handle(&failure)
//! close()         ──► tx.send(Close)              ──► drain loop exits
//! ```
//!
//! A panicking handler is contained; the loop keeps running.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::error::TaskError;

/// A job that finished with a failure.
#[derive(Clone, Debug)]
pub struct JobFailure {
    /// Job id.
    pub id: u64,
    /// Job name.
    pub name: Arc<str>,
    /// Job type.
    pub job_type: Arc<str>,
    /// The failure.
    pub error: Arc<TaskError>,
}

/// Receives every job failure exactly once.
pub trait ExceptionHandler: Send + Sync + 'static {
    /// Called from the drain loop for each failure.
    fn handle(&self, failure: &JobFailure);
}

/// Default handler: logs the failure at `error` level.
#[derive(Debug, Default)]
pub struct LogExceptionHandler;

impl ExceptionHandler for LogExceptionHandler {
    fn handle(&self, f: &JobFailure) {
        error!(
            job = %f.name,
            job_type = %f.job_type,
            label = f.error.as_label(),
            error = %f.error,
            "job failed"
        );
    }
}

pub(crate) enum DrainMsg {
    Failed(JobFailure),
    Close,
}

/// Spawns the drain loop.
pub(crate) fn spawn(
    handler: Arc<dyn ExceptionHandler>,
) -> (mpsc::UnboundedSender<DrainMsg>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                DrainMsg::Failed(failure) => {
                    let observed = catch_unwind(AssertUnwindSafe(|| handler.handle(&failure)));
                    if observed.is_err() {
                        error!(job = %failure.name, "exception handler panicked");
                    }
                }
                DrainMsg::Close => break,
            }
        }
    });
    (tx, task)
}
