//! # Bus handlers and the function-backed implementation.
//!
//! This module defines the [`Handler`] trait (async, identity-based) and a convenient
//! function-backed implementation [`HandlerFn`]. The common handle type is
//! [`HandlerRef`], an `Arc<dyn Handler>`.
//!
//! ## Identity
//! A subscription is identified by the **`Arc` allocation** of its handler: registering
//! the same `HandlerRef` twice is a contract violation, and `unregister` takes the same
//! `HandlerRef` back. Two different `Arc`s are two different handlers, even when they
//! wrap equal closures.
//!
//! ## Reply channel
//! A handler that returns `true` from [`Handler::supports_reply`] receives a [`Reply`]
//! on every dispatch. The bus tracks it under [`Handler::key`] (`scope.name`).

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::bus::event::Event;
use crate::bus::reply::Reply;
use crate::error::HandlerError;

/// Shared handle to a handler object.
pub type HandlerRef = Arc<dyn Handler>;

/// # Subscriber callback.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use brewvisor::{Event, Handler, HandlerError, Reply};
///
/// struct Audit;
///
/// #[async_trait]
/// impl Handler for Audit {
///     fn scope(&self) -> &str { "audit" }
///     fn name(&self) -> &str { "record" }
///
///     async fn handle(&self, ev: Event, _reply: Option<Reply>) -> Result<(), HandlerError> {
///         let _ = ev.topic();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Defining scope (module, component) of the handler.
    fn scope(&self) -> &str;

    /// Handler name, unique within its scope.
    fn name(&self) -> &str;

    /// Stable key used to track replies: `scope.name`.
    fn key(&self) -> String {
        format!("{}.{}", self.scope(), self.name())
    }

    /// Whether this handler wants a [`Reply`] on each dispatch.
    fn supports_reply(&self) -> bool {
        false
    }

    /// Handles one event.
    ///
    /// Runs concurrently with every other handler matched by the same `fire()`.
    /// Errors are logged by the bus and never reach the publisher.
    async fn handle(&self, event: Event, reply: Option<Reply>) -> Result<(), HandlerError>;
}

type BoxHandlerFn =
    dyn Fn(Event, Option<Reply>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

/// Function-backed handler.
///
/// Wraps a closure that creates a new future per dispatch.
///
/// ## Example
/// ```rust
/// use brewvisor::{HandlerFn, HandlerRef, HandlerError};
///
/// let h: HandlerRef = HandlerFn::arc("kettle", "on_reading", |ev, _reply| async move {
///     let _ = ev.payload();
///     Ok::<_, HandlerError>(())
/// });
/// assert_eq!(h.key(), "kettle.on_reading");
/// ```
pub struct HandlerFn {
    scope: Cow<'static, str>,
    name: Cow<'static, str>,
    reply: bool,
    f: Box<BoxHandlerFn>,
}

impl HandlerFn {
    /// Creates a fire-and-forget handler.
    pub fn new<F, Fut>(
        scope: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        f: F,
    ) -> Self
    where
        F: Fn(Event, Option<Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            scope: scope.into(),
            name: name.into(),
            reply: false,
            f: Box::new(move |ev, reply| Box::pin(f(ev, reply))),
        }
    }

    /// Creates the handler and returns it as a [`HandlerRef`].
    pub fn arc<F, Fut>(
        scope: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        f: F,
    ) -> HandlerRef
    where
        F: Fn(Event, Option<Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Arc::new(Self::new(scope, name, f))
    }

    /// Creates a handler that opts into the reply channel.
    ///
    /// The closure always receives `Some(reply)`.
    pub fn with_reply<F, Fut>(
        scope: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        f: F,
    ) -> HandlerRef
    where
        F: Fn(Event, Option<Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let mut h = Self::new(scope, name, f);
        h.reply = true;
        Arc::new(h)
    }
}

#[async_trait]
impl Handler for HandlerFn {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_reply(&self) -> bool {
        self.reply
    }

    async fn handle(&self, event: Event, reply: Option<Reply>) -> Result<(), HandlerError> {
        (self.f)(event, reply).await
    }
}

/// Identity of a handler allocation, used as the registry key.
#[inline]
pub(crate) fn identity(handler: &HandlerRef) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}
