//! # EventBus: topic-tree pub/sub with optional request/reply.
//!
//! ## Architecture
//! ```text
//! register(pattern, handler, once)
//!     └─► trie insert (pattern segments) + index[handler identity] = pattern
//!
//! fire(topic, timeout, payload)
//!     ├─► lock: collect matches (exact / + / # at every depth), drop `once` entries
//!     ├─► per match: tokio::spawn(handler.handle(event, reply?))  (never awaited here)
//!     │        └─ Err / panic → logged at this boundary
//!     └─► timeout = Some(x): wait for tracked replies until a shared deadline
//!              └─► ResultContainer { key → (value, timed_out) }
//! ```
//!
//! ## Rules
//! - The trie lock is never held across an await.
//! - One slow handler cannot delay the publisher or any sibling handler.
//! - Two reply handlers with the same key: the later one in match order wins.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::bus::event::Event;
use crate::bus::handler::{HandlerRef, identity};
use crate::bus::reply::{HandlerResult, Reply, ResultContainer};
use crate::bus::topic::{Node, Subscription};
use crate::config::BusConfig;
use crate::error::{BusError, TaskError};

/// Introspection record for one registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Pattern the handler is registered on.
    pub topic: String,
    /// Handler key (`scope.name`).
    pub key: String,
    /// Removed after the first matching `fire()`.
    pub once: bool,
    /// Handler receives a reply channel.
    pub supports_reply: bool,
}

#[derive(Default)]
struct Tree {
    root: Node,
    /// handler identity → pattern it is registered on.
    index: HashMap<usize, Arc<str>>,
}

struct Inner {
    cfg: BusConfig,
    tree: Mutex<Tree>,
}

/// Hierarchical publish/subscribe bus.
///
/// Cheap to clone; all clones share the same trie.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new(cfg: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                tree: Mutex::new(Tree::default()),
            }),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.inner
            .tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler` on `pattern`.
    ///
    /// Fails with [`BusError::AlreadyRegistered`] if this handler (same `Arc`) is
    /// already registered anywhere, and with [`BusError::InvalidTopic`] for a
    /// malformed pattern.
    pub fn register(
        &self,
        pattern: &str,
        handler: HandlerRef,
        once: bool,
    ) -> Result<(), BusError> {
        let segments = Node::parse(pattern)?;
        let id = identity(&handler);

        let mut tree = self.tree();
        if let Some(existing) = tree.index.get(&id) {
            return Err(BusError::AlreadyRegistered {
                key: handler.key(),
                topic: existing.to_string(),
            });
        }

        debug!(topic = pattern, key = %handler.key(), once, "bus register");
        let topic: Arc<str> = Arc::from(pattern);
        tree.index.insert(id, Arc::clone(&topic));
        tree.root.insert(
            &segments,
            Subscription {
                topic,
                handler,
                once,
            },
        );
        Ok(())
    }

    /// Removes `handler` from the bus. Returns `false` if it was not registered.
    pub fn unregister(&self, handler: &HandlerRef) -> bool {
        let id = identity(handler);
        let mut tree = self.tree();
        let Some(topic) = tree.index.remove(&id) else {
            return false;
        };
        let segments: Vec<&str> = topic.split('/').collect();
        let removed = tree.root.remove(&segments, id);
        debug!(topic = %topic, key = %handler.key(), "bus unregister");
        removed
    }

    /// True if `handler` is currently registered.
    pub fn is_registered(&self, handler: &HandlerRef) -> bool {
        self.tree().index.contains_key(&identity(handler))
    }

    /// Lists every registration (sorted by topic, then key).
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let tree = self.tree();
        let mut subs = Vec::new();
        tree.root.visit(&mut subs);
        let mut out: Vec<SubscriptionInfo> = subs
            .into_iter()
            .map(|s| SubscriptionInfo {
                topic: s.topic.to_string(),
                key: s.handler.key(),
                once: s.once,
                supports_reply: s.handler.supports_reply(),
            })
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic).then_with(|| a.key.cmp(&b.key)));
        out
    }

    /// Fires `topic` and, if `timeout` is set, waits up to it for replies.
    ///
    /// Returns `None` when `timeout` is `None`. A topic matching nothing yields an empty
    /// container (or `None`) without any side effect.
    pub async fn fire(
        &self,
        topic: &str,
        timeout: Option<Duration>,
        payload: Value,
    ) -> Option<ResultContainer> {
        let pending = self.dispatch(topic, payload);
        let timeout = timeout?;

        let deadline = Instant::now() + timeout;
        let mut results = ResultContainer::default();
        for (key, rx) in pending {
            let result = match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(value)) => HandlerResult {
                    value: Some(value),
                    timed_out: false,
                },
                // A dropped reply can never resolve.
                Ok(Err(_)) | Err(_) => HandlerResult {
                    value: None,
                    timed_out: true,
                },
            };
            results.insert(key, result);
        }
        Some(results)
    }

    /// Fires `topic` and waits for replies up to [`BusConfig::fire_timeout`].
    pub async fn fire_default(&self, topic: &str, payload: Value) -> ResultContainer {
        self.fire(topic, Some(self.inner.cfg.fire_timeout), payload)
            .await
            .unwrap_or_default()
    }

    /// Dispatches `topic` without waiting for anything.
    ///
    /// Must be called from within a tokio runtime.
    pub fn fire_and_forget(&self, topic: &str, payload: Value) {
        drop(self.dispatch(topic, payload));
    }

    /// Matches, spawns every handler and returns the reply receivers to track.
    fn dispatch(&self, topic: &str, payload: Value) -> Vec<(Arc<str>, oneshot::Receiver<Value>)> {
        let matched = {
            let mut tree = self.tree();
            let mut fired_once = Vec::new();
            let matched = tree
                .root
                .collect(topic, self.inner.cfg.reserved_prefix, &mut fired_once);
            for id in fired_once {
                tree.index.remove(&id);
            }
            matched
        };
        if matched.is_empty() {
            return Vec::new();
        }

        let event = Event::new(topic, payload);
        let mut pending = Vec::new();
        for sub in matched {
            let handler = sub.handler;
            let reply = if handler.supports_reply() {
                let (reply, rx) = Reply::channel();
                pending.push((Arc::from(handler.key()), rx));
                Some(reply)
            } else {
                None
            };
            tokio::spawn(run_handler(handler, event.clone(), reply));
        }
        pending
    }
}

/// Runs one handler, recovering failures and panics at this boundary.
async fn run_handler(handler: HandlerRef, event: Event, reply: Option<Reply>) {
    let topic = event.topic().to_string();
    let fut = handler.handle(event, reply);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %topic, key = %handler.key(), error = %e, "bus handler failed");
        }
        Err(panic) => {
            let e = TaskError::panicked(panic);
            error!(topic = %topic, key = %handler.key(), error = %e, "bus handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::bus::handler::HandlerFn;
    use crate::error::HandlerError;

    fn counter(scope: &'static str, hits: &Arc<AtomicUsize>) -> HandlerRef {
        let hits = Arc::clone(hits);
        HandlerFn::arc(scope, "count", move |_, _| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = EventBus::new(BusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = counter("dup", &hits);

        bus.register("a/b", Arc::clone(&h), false).unwrap();
        let err = bus.register("c/d", Arc::clone(&h), false).unwrap_err();
        assert!(matches!(err, BusError::AlreadyRegistered { ref topic, .. } if topic == "a/b"));

        assert!(bus.unregister(&h));
        assert!(!bus.unregister(&h));
        bus.register("c/d", h, false).unwrap();
    }

    #[tokio::test]
    async fn once_fires_at_most_once() {
        let bus = EventBus::new(BusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = counter("once", &hits);
        bus.register("job/+/done", Arc::clone(&h), true).unwrap();

        for _ in 0..3 {
            bus.fire("job/x/done", None, Value::Null).await;
        }
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!bus.is_registered(&h));
    }

    #[tokio::test]
    async fn unmatched_topic_is_a_no_op() {
        let bus = EventBus::new(BusConfig::default());
        let rc = bus.fire("nothing/here", Some(Duration::from_millis(10)), json!({})).await;
        assert!(rc.is_some_and(|rc| rc.is_empty()));
        assert!(bus.fire("nothing/here", None, json!({})).await.is_none());
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_affect_siblings() {
        let bus = EventBus::new(BusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));

        bus.register(
            "x",
            HandlerFn::arc("bad", "fail", |_, _| async { Err(HandlerError::failed("nope")) }),
            false,
        )
        .unwrap();
        bus.register(
            "x",
            HandlerFn::arc("bad", "panic", |_, _| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
            false,
        )
        .unwrap();
        bus.register("x", counter("good", &hits), false).unwrap();

        bus.fire_and_forget("x", Value::Null);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_resolved_or_timed_out() {
        let bus = EventBus::new(BusConfig::default());
        bus.register(
            "kettle/+",
            HandlerFn::with_reply("kettle", "fast", |ev, reply| async move {
                if let Some(reply) = reply {
                    reply.send(json!({ "id": ev.last_segment() }));
                }
                Ok(())
            }),
            false,
        )
        .unwrap();
        bus.register(
            "kettle/#",
            HandlerFn::with_reply("kettle", "slow", |_, reply| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                drop(reply);
                Ok(())
            }),
            false,
        )
        .unwrap();

        let started = Instant::now();
        let rc = bus
            .fire("kettle/k1", Some(Duration::from_millis(200)), Value::Null)
            .await
            .unwrap();
        assert!(started.elapsed() <= Duration::from_millis(250));

        assert_eq!(rc.get("kettle.fast").unwrap(), (Some(&json!({"id": "k1"})), false));
        assert_eq!(rc.get("kettle.slow").unwrap(), (None, true));
        assert!(rc.timed_out());
        assert!(rc.get("kettle.none").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_reply_counts_as_unresolved() {
        let bus = EventBus::new(BusConfig::default());
        bus.register(
            "fermenter/+",
            HandlerFn::with_reply("fermenter", "silent", |_, reply| async move {
                drop(reply);
                Ok(())
            }),
            false,
        )
        .unwrap();

        let rc = bus
            .fire("fermenter/f1", Some(Duration::from_secs(1)), Value::Null)
            .await
            .unwrap();
        assert_eq!(rc.get("fermenter.silent").unwrap(), (None, true));
        assert!(rc.timed_out());
    }

    #[tokio::test]
    async fn subscriptions_lists_registrations() {
        let bus = EventBus::new(BusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.register("b/#", counter("s2", &hits), true).unwrap();
        bus.register("a/+", counter("s1", &hits), false).unwrap();

        let subs = bus.subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].topic, "a/+");
        assert_eq!(subs[0].key, "s1.count");
        assert!(subs[1].once);
        assert!(!subs[1].supports_reply);
    }
}
