//! # LogWriter: mirrors bus traffic to `tracing`.
//!
//! A minimal handler meant for the root `#` wildcard. It is the reference shape for a
//! transport layer that forwards every event outward.
//!
//! ## Example output
//! ```text
//! INFO brewvisor::bus::log: event seq=12 topic="actor/update/heater" payload={"power":80}
//! ```

use async_trait::async_trait;
use tracing::info;

use crate::bus::event::Event;
use crate::bus::handler::Handler;
use crate::bus::reply::Reply;
use crate::error::HandlerError;

/// Bus handler that writes every event it receives to the log.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Pattern the writer is meant to be registered on.
    pub const TOPIC: &'static str = "#";

    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for LogWriter {
    fn scope(&self) -> &str {
        "brewvisor"
    }

    fn name(&self) -> &str {
        "log_writer"
    }

    async fn handle(&self, e: Event, _reply: Option<Reply>) -> Result<(), HandlerError> {
        info!(seq = e.seq, topic = e.topic(), payload = %e.payload(), "event");
        Ok(())
    }
}
