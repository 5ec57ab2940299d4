//! # Request/reply over the bus.
//!
//! A handler that supports replies receives a [`Reply`] (one-shot sender). After
//! dispatch, `fire()` waits up to its timeout for every tracked reply and returns a
//! [`ResultContainer`]:
//!
//! ```text
//! key                resolved in time     (Some(value), timed_out = false)
//! key                still open at X      (None,        timed_out = true)
//! key                dropped, no value    (None,        timed_out = true)
//! ```
//!
//! A timeout is a partial result, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BusError;

/// One-shot reply channel handed to a handler.
#[derive(Debug)]
pub struct Reply {
    tx: oneshot::Sender<Value>,
}

impl Reply {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Resolves the reply. Returns `false` if the publisher stopped waiting.
    pub fn send(self, value: Value) -> bool {
        self.tx.send(value).is_ok()
    }

    /// True once the publisher stopped waiting (timeout elapsed or no waiter).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of one tracked reply.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResult {
    /// Reply value, if the handler resolved it in time.
    pub value: Option<Value>,
    /// True if no value arrived: still open when the wait ended, or dropped.
    pub timed_out: bool,
}

/// Per-`fire()` map from handler key to its reply outcome.
#[derive(Clone, Debug, Default)]
pub struct ResultContainer {
    results: HashMap<Arc<str>, HandlerResult>,
}

impl ResultContainer {
    pub(crate) fn insert(&mut self, key: Arc<str>, result: HandlerResult) {
        self.results.insert(key, result);
    }

    /// Returns `(value, timed_out)` for `key`.
    ///
    /// Fails with [`BusError::UnknownKey`] if no handler with that key was tracked.
    pub fn get(&self, key: &str) -> Result<(Option<&Value>, bool), BusError> {
        self.results
            .get(key)
            .map(|r| (r.value.as_ref(), r.timed_out))
            .ok_or_else(|| BusError::UnknownKey {
                key: key.to_string(),
            })
    }

    /// True if at least one tracked reply timed out.
    pub fn timed_out(&self) -> bool {
        self.results.values().any(|r| r.timed_out)
    }

    /// Iterates over `(key, result)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HandlerResult)> {
        self.results.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Number of tracked replies.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True if no reply was tracked.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_key_is_an_error() {
        let mut rc = ResultContainer::default();
        rc.insert(
            Arc::from("a.b"),
            HandlerResult {
                value: Some(json!(1)),
                timed_out: false,
            },
        );
        assert_eq!(rc.get("a.b").unwrap(), (Some(&json!(1)), false));
        assert!(matches!(rc.get("x.y"), Err(BusError::UnknownKey { .. })));
        assert!(!rc.timed_out());
    }

    #[tokio::test]
    async fn reply_reports_closed_receiver() {
        let (reply, rx) = Reply::channel();
        drop(rx);
        assert!(reply.is_closed());
        assert!(!reply.send(json!("late")));
    }
}
