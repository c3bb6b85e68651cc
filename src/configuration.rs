//! Dyno declarations and the process-wide handle that owns them.
//!
//! ```rust,ignore
//! let config = Configuration::builder()
//!     .web()
//!     .worker_fn("worker", || 1.23)?
//!     .apply();
//! let hirefire = HireFire::new(config);
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::DispatchState;
use crate::error::{MeasureError, WorkerError};
use crate::settings::Settings;
use crate::transport::{HttpTransport, Transport};
use crate::web::Web;
use crate::worker::{Measure, Worker};

/// One entry of the info endpoint's response body.
///
/// Whole values serialize as JSON integers (`"value": 5`), the rest as
/// floats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerValue {
    pub name: String,
    #[serde(serialize_with = "serialize_metric")]
    pub value: f64,
}

// Largest magnitude below which every integer is exactly representable in f64.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

fn serialize_metric<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() <= MAX_EXACT_INT {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// The effective, immutable set of declared dynos.
#[derive(Debug, Default)]
pub struct Configuration {
    settings: Settings,
    web: Option<Web>,
    workers: Vec<Worker>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The web dyno, if declared.
    pub fn web(&self) -> Option<&Web> {
        self.web.as_ref()
    }

    /// Worker dynos in declaration order.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Poll every worker's provider, in declaration order.
    ///
    /// # Errors
    /// The first provider failure, unchanged.
    pub async fn info(&self) -> Result<Vec<WorkerValue>, MeasureError> {
        let mut values = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            values.push(WorkerValue {
                name: worker.name().to_owned(),
                value: worker.value().await?,
            });
        }
        Ok(values)
    }
}

/// Accumulates dyno declarations; [`apply`](Self::apply) produces the
/// [`Configuration`].
#[derive(Default)]
pub struct ConfigurationBuilder {
    settings: Option<Settings>,
    web: bool,
    web_state: DispatchState,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    workers: Vec<Worker>,
}

impl ConfigurationBuilder {
    /// Use these settings instead of reading the environment at `apply`.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Declare the web dyno (request queue time).
    pub fn web(mut self) -> Self {
        self.web = true;
        self
    }

    /// Initial dispatch interval for the web dyno.
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.web_state.interval = interval;
        self
    }

    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.web_state.timeout = timeout;
        self
    }

    pub fn buffer_ttl(mut self, secs: u64) -> Self {
        self.web_state.buffer_ttl = secs;
        self
    }

    /// Deliver web metrics through `transport` instead of HTTP.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Declare a worker dyno measured by `measure`.
    ///
    /// # Errors
    /// [`WorkerError::InvalidDynoName`], raised here rather than at dispatch.
    pub fn worker(mut self, name: impl Into<String>, measure: impl Measure + 'static) -> Result<Self, WorkerError> {
        self.workers.push(Worker::new(name, measure)?);
        Ok(self)
    }

    /// Declare a worker dyno measured by a closure.
    pub fn worker_fn<F>(mut self, name: impl Into<String>, f: F) -> Result<Self, WorkerError>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.workers.push(Worker::from_fn(name, f)?);
        Ok(self)
    }

    /// Finalise the declarations.
    pub fn apply(self) -> Configuration {
        let settings = self.settings.unwrap_or_else(Settings::from_env);
        let web = self.web.then(|| {
            let transport = self
                .transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new(settings.clone())));
            let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
            Web::with_state(transport, clock, self.web_state)
        });
        Configuration {
            settings,
            web,
            workers: self.workers,
        }
    }
}

/// Shared handle to the active [`Configuration`].
///
/// Clone it into every request adapter. [`reconfigure`](Self::reconfigure)
/// swaps in a whole new configuration; adapters pick it up on their next
/// call.
#[derive(Debug, Clone, Default)]
pub struct HireFire {
    active: Arc<RwLock<Arc<Configuration>>>,
}

impl HireFire {
    pub fn new(config: Configuration) -> Self {
        Self {
            active: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn configuration(&self) -> Arc<Configuration> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the active configuration and return the previous one.
    ///
    /// The previous configuration's dispatcher is not stopped; call
    /// `stop_dispatcher` on its web dyno if it was running.
    pub fn reconfigure(&self, config: Configuration) -> Arc<Configuration> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, Arc::new(config))
    }
}
