//! # Stage: RQ Queue Introspection
//!
//! ## Responsibility
//! Read queue size and queue latency for [RQ](https://python-rq.org) queues
//! straight out of Redis.
//!
//! ## Key layout
//! - `rq:queue:<name>`: list of job ids, oldest at index 0
//! - `rq:scheduled:<name>`: sorted set of job ids scored by due unix time
//! - `rq:job:<id>`: hash; field `enqueued_at` is an ISO-8601 timestamp
//!
//! ## Guarantees
//! - One pipelined round trip per phase (two for latency, one for size)
//! - Scheduled jobs count only once they are due
//! - Non-panicking: Redis and parse failures are returned as [`BrokerError`]
//!
//! ## NOT Responsible For
//! - Started, deferred or failed job registries

#![cfg(feature = "rq")]

use chrono::{DateTime, NaiveDateTime, Utc};

use super::{resolve_redis_url, JobQueue};
use crate::clock::{Clock, SystemClock};
use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// Redis keys
// ---------------------------------------------------------------------------

fn queue_key(queue: &str) -> String {
    format!("rq:queue:{queue}")
}

fn scheduled_key(queue: &str) -> String {
    format!("rq:scheduled:{queue}")
}

fn job_key(job_id: &str) -> String {
    format!("rq:job:{job_id}")
}

// ---------------------------------------------------------------------------
// RqOps trait
// ---------------------------------------------------------------------------

/// Head of one queue: the oldest enqueued job id and the earliest scheduled
/// job whose score is at most `now`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct QueueHead {
    pub(crate) job_id: Option<String>,
    pub(crate) due: Option<(String, f64)>,
}

/// The Redis reads `Rq` needs, batched per phase.
pub(crate) trait RqOps {
    /// For each queue, `LINDEX rq:queue:<q> 0` and
    /// `ZRANGEBYSCORE rq:scheduled:<q> -inf <now> WITHSCORES LIMIT 0 1`.
    fn queue_heads(&mut self, queues: &[String], now: f64) -> Result<Vec<QueueHead>, BrokerError>;

    /// `HGET rq:job:<id> enqueued_at` for each id.
    fn enqueued_at(&mut self, job_ids: &[String]) -> Result<Vec<Option<String>>, BrokerError>;

    /// For each queue, `LLEN rq:queue:<q>` and `ZCOUNT rq:scheduled:<q> 0 <now>`.
    fn queue_counts(&mut self, queues: &[String], now: i64) -> Result<Vec<u64>, BrokerError>;
}

// ---------------------------------------------------------------------------
// redis::Connection impl
// ---------------------------------------------------------------------------

impl RqOps for redis::Connection {
    fn queue_heads(&mut self, queues: &[String], now: f64) -> Result<Vec<QueueHead>, BrokerError> {
        let mut pipe = redis::pipe();
        for queue in queues {
            pipe.cmd("LINDEX").arg(queue_key(queue)).arg(0);
            pipe.cmd("ZRANGEBYSCORE")
                .arg(scheduled_key(queue))
                .arg("-inf")
                .arg(now)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(1);
        }
        let replies: Vec<redis::Value> = pipe.query(self)?;

        replies
            .chunks_exact(2)
            .map(|pair| -> Result<QueueHead, BrokerError> {
                let job_id: Option<String> = redis::from_redis_value(&pair[0])?;
                let due: Vec<(String, f64)> = redis::from_redis_value(&pair[1])?;
                Ok(QueueHead {
                    job_id,
                    due: due.into_iter().next(),
                })
            })
            .collect()
    }

    fn enqueued_at(&mut self, job_ids: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in job_ids {
            pipe.cmd("HGET").arg(job_key(id)).arg("enqueued_at");
        }
        Ok(pipe.query(self)?)
    }

    fn queue_counts(&mut self, queues: &[String], now: i64) -> Result<Vec<u64>, BrokerError> {
        let mut pipe = redis::pipe();
        for queue in queues {
            pipe.cmd("LLEN").arg(queue_key(queue));
            pipe.cmd("ZCOUNT").arg(scheduled_key(queue)).arg(0).arg(now);
        }
        Ok(pipe.query(self)?)
    }
}

// ---------------------------------------------------------------------------
// Measurements over any RqOps
// ---------------------------------------------------------------------------

pub(crate) fn measure_size(ops: &mut dyn RqOps, queues: &[String], now: i64) -> Result<u64, BrokerError> {
    if queues.is_empty() {
        return Err(BrokerError::MissingQueue);
    }
    Ok(ops.queue_counts(queues, now)?.into_iter().sum())
}

pub(crate) fn measure_latency(ops: &mut dyn RqOps, queues: &[String], now: f64) -> Result<f64, BrokerError> {
    if queues.is_empty() {
        return Err(BrokerError::MissingQueue);
    }

    let heads = ops.queue_heads(queues, now)?;
    let job_ids: Vec<String> = heads.iter().filter_map(|h| h.job_id.clone()).collect();
    let enqueued = ops.enqueued_at(&job_ids)?;

    let mut latency = 0.0_f64;

    for stamp in enqueued.iter().flatten() {
        latency = latency.max(now - parse_enqueued_at(stamp)?);
    }

    for (_, score) in heads.iter().filter_map(|h| h.due.as_ref()) {
        if *score < now {
            latency = latency.max(now - score);
        }
    }

    Ok(latency)
}

/// Parse RQ's `enqueued_at` into fractional unix seconds.
///
/// RQ writes UTC with a trailing `Z`; offset-less values are taken as UTC.
fn parse_enqueued_at(raw: &str) -> Result<f64, BrokerError> {
    let utc = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc()))
        .map_err(|_| BrokerError::Malformed(format!("enqueued_at `{raw}`")))?;
    Ok(utc.timestamp_micros() as f64 / 1_000_000.0)
}

// ---------------------------------------------------------------------------
// Rq
// ---------------------------------------------------------------------------

/// RQ queues on one Redis server.
///
/// ```rust,ignore
/// let rq = Rq::new(["default", "mailer"])?;
/// config.worker("worker", QueueLatency::new(rq))?;
/// ```
pub struct Rq {
    queues: Vec<String>,
    client: redis::Client,
}

impl std::fmt::Debug for Rq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rq").field("queues", &self.queues).finish_non_exhaustive()
    }
}

impl Rq {
    /// Queues on the Redis server named by the environment
    /// (see [`resolve_redis_url`]).
    pub fn new<I, S>(queues: I) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_url(queues, None)
    }

    /// Queues on `redis_url`, or the environment's server when `None`.
    ///
    /// Opening the client does not connect; connection errors surface on the
    /// first measurement.
    pub fn with_url<I, S>(queues: I, redis_url: Option<&str>) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = redis::Client::open(resolve_redis_url(redis_url))?;
        Ok(Self {
            queues: queues.into_iter().map(Into::into).collect(),
            client,
        })
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }
}

impl JobQueue for Rq {
    fn job_queue_size(&self) -> Result<u64, BrokerError> {
        if self.queues.is_empty() {
            return Err(BrokerError::MissingQueue);
        }
        let mut conn = self.client.get_connection()?;
        measure_size(&mut conn, &self.queues, SystemClock.unix_secs())
    }

    fn job_queue_latency(&self) -> Result<f64, BrokerError> {
        if self.queues.is_empty() {
            return Err(BrokerError::MissingQueue);
        }
        let mut conn = self.client.get_connection()?;
        let now = SystemClock.unix_millis() as f64 / 1_000.0;
        measure_latency(&mut conn, &self.queues, now)
    }
}

// ---------------------------------------------------------------------------
// MockRqOps
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockRqOps {
    lists: std::collections::HashMap<String, Vec<String>>,
    zsets: std::collections::HashMap<String, Vec<(String, f64)>>,
    enqueued: std::collections::HashMap<String, String>,
    round_trips: usize,
}

#[cfg(test)]
impl MockRqOps {
    pub(crate) fn enqueue(&mut self, queue: &str, job_id: &str, enqueued_at: &str) -> &mut Self {
        self.lists.entry(queue_key(queue)).or_default().push(job_id.to_owned());
        self.enqueued.insert(job_key(job_id), enqueued_at.to_owned());
        self
    }

    pub(crate) fn schedule(&mut self, queue: &str, job_id: &str, due: f64) -> &mut Self {
        let set = self.zsets.entry(scheduled_key(queue)).or_default();
        set.push((job_id.to_owned(), due));
        set.sort_by(|a, b| a.1.total_cmp(&b.1));
        self
    }

    fn scheduled(&self, queue: &str) -> &[(String, f64)] {
        self.zsets.get(&scheduled_key(queue)).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
impl RqOps for MockRqOps {
    fn queue_heads(&mut self, queues: &[String], now: f64) -> Result<Vec<QueueHead>, BrokerError> {
        self.round_trips += 1;
        Ok(queues
            .iter()
            .map(|q| QueueHead {
                job_id: self.lists.get(&queue_key(q)).and_then(|l| l.first().cloned()),
                due: self.scheduled(q).iter().find(|(_, s)| *s <= now).cloned(),
            })
            .collect())
    }

    fn enqueued_at(&mut self, job_ids: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        self.round_trips += 1;
        Ok(job_ids.iter().map(|id| self.enqueued.get(&job_key(id)).cloned()).collect())
    }

    fn queue_counts(&mut self, queues: &[String], now: i64) -> Result<Vec<u64>, BrokerError> {
        self.round_trips += 1;
        Ok(queues
            .iter()
            .flat_map(|q| {
                let len = self.lists.get(&queue_key(q)).map_or(0, Vec::len) as u64;
                let due = self
                    .scheduled(q)
                    .iter()
                    .filter(|(_, s)| *s >= 0.0 && *s <= now as f64)
                    .count() as u64;
                [len, due]
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
