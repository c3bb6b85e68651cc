//! # Stage: Job Queue Providers
//!
//! ## Responsibility
//! Measure worker-dyno signals (queue size, queue latency) from a job
//! broker, and adapt those measurements into [`Measure`] providers that a
//! [`Worker`](crate::worker::Worker) can poll.
//!
//! ## Guarantees
//! - Broker clients are synchronous; the [`Measure`] adapters run them on
//!   tokio's blocking pool so the info endpoint never stalls the runtime.
//! - Every broker failure surfaces as a [`BrokerError`], never a panic.
//!
//! ## NOT Responsible For
//! - Caching: every poll queries the broker afresh
//! - Connection pooling across polls

use std::env;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BrokerError, MeasureError};
use crate::worker::Measure;

#[cfg(feature = "rq")]
pub mod rq;

#[cfg(feature = "rq")]
pub use rq::Rq;

// ---------------------------------------------------------------------------
// Redis URL resolution
// ---------------------------------------------------------------------------

/// Environment variables consulted, in order, when no Redis URL is given.
pub const REDIS_URL_ENVS: [&str; 5] = [
    "REDIS_TLS_URL",
    "REDIS_URL",
    "REDISTOGO_URL",
    "REDISCLOUD_URL",
    "OPENREDIS_URL",
];

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// `explicit`, else the first set variable of [`REDIS_URL_ENVS`], else
/// [`DEFAULT_REDIS_URL`].
pub fn resolve_redis_url(explicit: Option<&str>) -> String {
    resolve_redis_url_with(explicit, |key| env::var(key).ok())
}

fn resolve_redis_url_with(explicit: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> String {
    explicit
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            REDIS_URL_ENVS
                .iter()
                .find_map(|&key| lookup(key).filter(|url| !url.is_empty()))
        })
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_owned())
}

// ---------------------------------------------------------------------------
// JobQueue capability
// ---------------------------------------------------------------------------

/// Blocking introspection of one or more job queues.
///
/// `Rq` is the bundled implementation. Other brokers, such as Celery over
/// Redis or AMQP, plug in by implementing this trait and wrapping the
/// implementation in [`QueueSize`] or [`QueueLatency`].
pub trait JobQueue: Send + Sync + 'static {
    /// Jobs waiting to run now, summed across queues.
    fn job_queue_size(&self) -> Result<u64, BrokerError>;

    /// Seconds the oldest runnable job has been waiting, maximum across
    /// queues. `0.0` when nothing is waiting.
    fn job_queue_latency(&self) -> Result<f64, BrokerError>;
}

/// Reports [`JobQueue::job_queue_size`] as a [`Measure`].
pub struct QueueSize<Q>(Arc<Q>);

/// Reports [`JobQueue::job_queue_latency`] as a [`Measure`].
pub struct QueueLatency<Q>(Arc<Q>);

impl<Q: JobQueue> QueueSize<Q> {
    pub fn new(queue: Q) -> Self {
        Self(Arc::new(queue))
    }

    /// Share one broker handle between size and latency providers.
    pub fn shared(queue: Arc<Q>) -> Self {
        Self(queue)
    }
}

impl<Q: JobQueue> QueueLatency<Q> {
    pub fn new(queue: Q) -> Self {
        Self(Arc::new(queue))
    }

    pub fn shared(queue: Arc<Q>) -> Self {
        Self(queue)
    }
}

async fn blocking<Q, T>(queue: &Arc<Q>, call: fn(&Q) -> Result<T, BrokerError>) -> Result<T, BrokerError>
where
    Q: JobQueue,
    T: Send + 'static,
{
    let queue = Arc::clone(queue);
    tokio::task::spawn_blocking(move || call(&queue))
        .await
        .map_err(|e| BrokerError::Task(e.to_string()))?
}

#[async_trait]
impl<Q: JobQueue> Measure for QueueSize<Q> {
    async fn measure(&self) -> Result<f64, MeasureError> {
        let size = blocking(&self.0, Q::job_queue_size).await?;
        Ok(size as f64)
    }
}

#[async_trait]
impl<Q: JobQueue> Measure for QueueLatency<Q> {
    async fn measure(&self) -> Result<f64, MeasureError> {
        Ok(blocking(&self.0, Q::job_queue_latency).await?)
    }
}
