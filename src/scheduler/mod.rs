//! # Job scheduler.
//!
//! - [`Scheduler`] runs background work under a concurrency ceiling with a bounded
//!   FIFO pending queue.
//! - [`Job`] tracks one scheduled unit of work.
//! - [`ExceptionHandler`] observes every failing job exactly once.

mod core;
mod drain;
mod job;

pub use self::core::{CloseReport, Scheduler};
pub use drain::{ExceptionHandler, JobFailure, LogExceptionHandler};
pub use job::{Job, JobOutcome, JobStatus};
