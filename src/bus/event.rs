//! # Events delivered to bus handlers.
//!
//! An [`Event`] carries the concrete topic it was fired on, a JSON payload, a wall-clock
//! timestamp and a global sequence number.
//!
//! ## Ordering guarantees
//! Handlers matched by one `fire()` run concurrently, so delivery order across handlers
//! is not defined. `seq` increases monotonically per `fire()` and can be used to restore
//! publication order.
//!
//! ## Example
//! ```rust
//! use brewvisor::Event;
//! use serde_json::json;
//!
//! let ev = Event::new("actor/update/heater", json!({ "power": 80 }));
//! assert_eq!(ev.topic(), "actor/update/heater");
//! assert_eq!(ev.field("power"), Some(&json!(80)));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use serde_json::Value;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Event fired on the bus.
///
/// Cheap to clone: topic and payload are shared.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    topic: Arc<str>,
    payload: Arc<Value>,
}

impl Event {
    /// Creates a new event with the current timestamp and the next sequence number.
    pub fn new(topic: impl Into<Arc<str>>, payload: Value) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            topic: topic.into(),
            payload: Arc::new(payload),
        }
    }

    /// Concrete topic this event was fired on.
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Event payload.
    #[inline]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Looks up a top-level field of an object payload.
    #[inline]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Last topic segment (conventionally the id in `<domain>/<action>/<id>`).
    pub fn last_segment(&self) -> &str {
        self.topic.rsplit('/').next().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new("a", Value::Null);
        let b = Event::new("b", Value::Null);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn last_segment_is_the_id() {
        let ev = Event::new("sensor/reading/s1", json!({}));
        assert_eq!(ev.last_segment(), "s1");
        assert_eq!(Event::new("root", Value::Null).last_segment(), "root");
    }
}
