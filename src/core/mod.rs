//! Runtime core: controllers, the registry and the runtime that wires them.
//!
//! Internal modules:
//! - [`controller`]: owns the units of one kind, built from descriptors through a type table;
//! - [`registry`]: the explicit object holding every controller, plus the injected services;
//! - [`runtime`]: wires config, bus, scheduler and registry; shuts everything down;
//! - [`builder`]: declares bus handlers and the exception handler before build;
//! - [`shutdown`]: cross-platform termination signal handling.

mod builder;
mod controller;
mod registry;
mod runtime;
mod shutdown;

pub use builder::RuntimeBuilder;
pub use controller::{Controller, Descriptor, Factory, Props};
pub use registry::{Registry, Services, UnitContext};
pub use runtime::{Runtime, SHUTDOWN_TOPIC};
