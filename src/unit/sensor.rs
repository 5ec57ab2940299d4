//! # Sensors.
//!
//! A sensor periodically reads a value and pushes it to observers on
//! `sensor/reading/<id>`. [`PollingSensor`] covers the common case of a read
//! function called on a fixed interval.
//!
//! ```text
//! run(ctx) ── loop ──► tick ──► read() ─┬─ Ok(v)  → last = v, push_reading(id, v)
//!                ▲                      └─ Err(e) → warn!, keep last value
//!                └──── until ctx.cancelled()
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::{Services, UnitContext};
use crate::error::TaskError;
use crate::unit::lifecycle::Lifecycle;

/// A unit producing numeric readings.
pub trait Sensor: Lifecycle {
    /// Last value read, if any.
    fn value(&self) -> Option<f64>;

    /// Measurement unit for display (`"°C"`, `"%"`, ...).
    fn unit(&self) -> &str {
        ""
    }
}

type ReadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<f64, TaskError>> + Send + Sync>;

const NO_VALUE: u64 = u64::MAX;

/// Sensor backed by a read function polled on an interval.
///
/// The interval is taken from the `interval` prop (seconds), falling back to
/// `unit.poll_interval` from the runtime config. The `unit` prop sets the
/// measurement unit.
pub struct PollingSensor {
    id: Arc<str>,
    interval: Duration,
    unit: String,
    read: ReadFn,
    last: AtomicU64,
    services: Services,
}

impl PollingSensor {
    /// Builds a sensor for `ctx` calling `read` on every tick.
    pub fn new<F, Fut>(ctx: &UnitContext, read: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<f64, TaskError>> + Send + 'static,
    {
        let interval = ctx
            .props
            .secs("interval")
            .unwrap_or_else(|| ctx.services.config().unit.interval());
        Self {
            id: Arc::clone(&ctx.id),
            interval,
            unit: ctx.props.str("unit").unwrap_or_default().to_string(),
            read: Arc::new(move || Box::pin(read())),
            last: AtomicU64::new(NO_VALUE),
            services: ctx.services.clone(),
        }
    }

    /// Type-erased constructor for [`Controller::register_type`](crate::Controller::register_type).
    pub fn factory<F, Fut>(
        read: F,
    ) -> impl Fn(UnitContext) -> Result<Arc<dyn Sensor>, TaskError> + Send + Sync + 'static
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<f64, TaskError>> + Send + 'static,
    {
        move |ctx| Ok(Arc::new(PollingSensor::new(&ctx, read.clone())) as Arc<dyn Sensor>)
    }

    /// Polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn store(&self, value: f64) {
        self.last.store(value.to_bits(), Ordering::SeqCst);
    }
}

#[async_trait]
impl Lifecycle for PollingSensor {
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(TaskError::Canceled),
                _ = tick.tick() => {}
            }
            match (self.read)().await {
                Ok(value) => {
                    self.store(value);
                    self.services.push_reading(&self.id, value);
                }
                Err(e) => warn!(sensor = %self.id, error = %e, "sensor read failed"),
            }
        }
    }

    fn state(&self) -> Value {
        json!({ "value": self.value(), "unit": self.unit })
    }
}

impl Sensor for PollingSensor {
    fn value(&self) -> Option<f64> {
        match self.last.load(Ordering::SeqCst) {
            NO_VALUE => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    fn unit(&self) -> &str {
        &self.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use crate::bus::{Event, HandlerFn};
    use crate::config::Config;
    use crate::core::{Descriptor, Props, Registry};
    use crate::{EventBus, Scheduler};

    fn registry(cfg: Config) -> Arc<Registry> {
        let cfg = Arc::new(cfg);
        let bus = EventBus::new(cfg.bus.clone());
        let scheduler = Scheduler::new(cfg.scheduler.clone(), bus.clone());
        Registry::new(cfg, bus, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn polls_and_pushes_readings() {
        let reg = registry(Config::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let sink = HandlerFn::arc("test", "readings", move |ev: Event, _reply| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev);
                Ok(())
            }
        });
        reg.services().bus().register("sensor/reading/+", sink, false).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        reg.sensors.register_type(
            "Counter",
            PollingSensor::factory(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(20.0 + n as f64) }
            }),
        );
        let props = Props::default().with("interval", json!(2)).with("unit", json!("°C"));
        reg.sensors
            .create(Descriptor::new("t1", "Counter").with_props(props))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic(), "sensor/reading/t1");
        assert_eq!(first.field("value"), Some(&json!(20.0)));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.field("value"), Some(&json!(21.0)));
        assert_eq!(reg.sensors.value("t1"), Some(21.0));
        assert_eq!(reg.services().sensor_value("t1"), Some(21.0));

        reg.sensors.stop("t1").await.unwrap();
        let n = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), n);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_uses_the_default() {
        let mut cfg = Config::default();
        cfg.unit.poll_interval = Duration::ZERO;
        let reg = registry(cfg);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        reg.sensors.register_type(
            "Steady",
            PollingSensor::factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(18.0) }
            }),
        );
        let props = Props::default().with("interval", json!(1e-12));
        reg.sensors
            .create(Descriptor::new("t3", "Steady").with_props(props))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(reg.sensors.get_state("t3").unwrap().running);
        assert_eq!(reg.sensors.value("t3"), Some(18.0));
        reg.sensors.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_keep_the_last_value() {
        let reg = registry(Config::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        reg.sensors.register_type(
            "Flaky",
            PollingSensor::factory(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(64.5)
                    } else {
                        Err(TaskError::fail("bus timeout"))
                    }
                }
            }),
        );
        reg.sensors.create(Descriptor::new("t2", "Flaky")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(reg.sensors.value("t2"), Some(64.5));
        assert!(reg.sensors.get_state("t2").unwrap().running);
        reg.sensors.shutdown().await;
    }
}
