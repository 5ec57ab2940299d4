//! # Event bus.
//!
//! Hierarchical publish/subscribe over `/`-delimited topics.
//!
//! - [`EventBus`] owns the topic trie and dispatches events.
//! - [`Handler`] / [`HandlerFn`] are the subscriber side.
//! - [`Reply`] / [`ResultContainer`] implement bounded request/reply.
//! - [`LogWriter`] (feature `logging`) mirrors every event to `tracing`.

mod core;
mod event;
mod handler;
#[cfg(feature = "logging")]
mod log;
mod reply;
mod topic;

pub use self::core::{EventBus, SubscriptionInfo};
pub use event::Event;
pub use handler::{Handler, HandlerFn, HandlerRef};
#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use reply::{HandlerResult, Reply, ResultContainer};
