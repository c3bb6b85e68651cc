//! Worker dynos and the measurement providers that report their queues.
//!
//! Providers are polled fresh every time the info endpoint is hit. Nothing
//! here is buffered or cached.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MeasureError, WorkerError};

static DYNO_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,29}$").expect("dyno name pattern compiles")
});

/// Whether `name` is usable as a dyno name: a leading letter followed by up
/// to 29 letters, digits, hyphens or underscores.
pub fn is_valid_dyno_name(name: &str) -> bool {
    DYNO_NAME.is_match(name)
}

/// Produces the current value of one metric.
#[async_trait]
pub trait Measure: Send + Sync {
    async fn measure(&self) -> Result<f64, MeasureError>;
}

/// Adapts a plain closure into a [`Measure`].
pub struct FnMeasure<F>(pub F);

#[async_trait]
impl<F> Measure for FnMeasure<F>
where
    F: Fn() -> Result<f64, MeasureError> + Send + Sync,
{
    async fn measure(&self) -> Result<f64, MeasureError> {
        (self.0)()
    }
}

/// A named worker dyno and the provider of its queue metric.
#[derive(Clone)]
pub struct Worker {
    name: String,
    measure: Arc<dyn Measure>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Worker {
    /// # Errors
    /// [`WorkerError::InvalidDynoName`] when `name` fails
    /// [`is_valid_dyno_name`].
    pub fn new(name: impl Into<String>, measure: impl Measure + 'static) -> Result<Self, WorkerError> {
        Self::from_arc(name, Arc::new(measure))
    }

    pub fn from_arc(name: impl Into<String>, measure: Arc<dyn Measure>) -> Result<Self, WorkerError> {
        let name = name.into();
        if !is_valid_dyno_name(&name) {
            return Err(WorkerError::InvalidDynoName(name));
        }
        Ok(Self { name, measure })
    }

    /// Convenience for infallible closures: `Worker::from_fn("worker", || 1.23)`.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Result<Self, WorkerError>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::new(name, FnMeasure(move || -> Result<f64, MeasureError> { Ok(f()) }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll the provider now.
    pub async fn value(&self) -> Result<f64, MeasureError> {
        self.measure.measure().await
    }
}
