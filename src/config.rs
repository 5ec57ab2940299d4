//! # Runtime configuration.
//!
//! Provides [`Config`], the centralized settings for the scheduler, the event bus
//! and the built-in periodic units.
//!
//! ## Sentinel values
//! - `scheduler.limit = 0` → unlimited concurrency
//! - `scheduler.pending_limit = 0` → unbounded pending queue
//!
//! All structs deserialize with `#[serde(default)]`, so any subset of fields may be
//! provided by whatever loads the configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Job scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Event bus settings.
    pub bus: BusConfig,
    /// Defaults for the built-in periodic units.
    pub unit: UnitConfig,
    /// Static configuration values exposed to units through
    /// [`Services::config_value`](crate::Services::config_value).
    pub values: Map<String, Value>,
}

impl Config {
    /// Returns a static configuration value, if present.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Scheduler configuration.
///
/// ## Field semantics
/// - `limit`: max concurrently active jobs (`0` = unlimited)
/// - `pending_limit`: max queued jobs before `spawn` blocks (`0` = unbounded)
/// - `close_timeout`: how long `close()` waits for active jobs to unwind
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub limit: usize,
    /// Capacity of the pending queue.
    pub pending_limit: usize,
    /// Upper bound on the wait performed by `close()`.
    pub close_timeout: Duration,
}

impl SchedulerConfig {
    /// Returns the concurrency ceiling as an `Option`.
    ///
    /// - `None` → unlimited
    /// - `Some(n)` → at most `n` active jobs
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.limit == 0 {
            None
        } else {
            Some(self.limit)
        }
    }

    /// Returns the pending queue capacity as an `Option` (`None` = unbounded).
    #[inline]
    pub fn pending_capacity(&self) -> Option<usize> {
        if self.pending_limit == 0 {
            None
        } else {
            Some(self.pending_limit)
        }
    }
}

impl Default for SchedulerConfig {
    /// Default configuration:
    ///
    /// - `limit = 100`
    /// - `pending_limit = 10000`
    /// - `close_timeout = 100ms`
    fn default() -> Self {
        Self {
            limit: 100,
            pending_limit: 10_000,
            close_timeout: Duration::from_millis(100),
        }
    }
}

/// Event bus configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Reply wait used by [`EventBus::fire_default`](crate::EventBus::fire_default).
    pub fire_timeout: Duration,

    /// Optional reserved first character for system topics.
    ///
    /// When set, a topic starting with this character is **not** matched by a
    /// `+` or `#` subscription sitting at the root level; the pattern has to
    /// spell out the first segment. `None` (default) keeps plain matching.
    pub reserved_prefix: Option<char>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            fire_timeout: Duration::from_millis(500),
            reserved_prefix: None,
        }
    }
}

/// Defaults shared by the built-in periodic units.
///
/// A zero `poll_interval` is treated as unset and falls back to the default (1s).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Interval between two evaluations of a periodic unit.
    pub poll_interval: Duration,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl UnitConfig {
    /// Effective polling interval, never zero.
    #[inline]
    pub fn interval(&self) -> Duration {
        if self.poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            self.poll_interval
        }
    }
}
