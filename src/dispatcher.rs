//! # Stage: Web Metrics Dispatcher
//!
//! ## Responsibility
//! Periodically drains the [`Buffer`] and ships the snapshot through a
//! [`Transport`]. Undelivered snapshots go back into the buffer, bounded by
//! the buffer TTL. The collector tunes interval, timeout and TTL through
//! response headers.
//!
//! ## Guarantees
//! - Idempotent lifecycle: `start()`/`stop()` report whether they acted
//! - Serial ticks: two drain cycles never overlap, even across restarts
//! - At-least-once: a failed tick re-buffers its snapshot
//! - Bounded: re-buffering evicts buckets older than the TTL
//! - Non-fatal: no tick outcome stops the loop or reaches request handlers
//!
//! ## NOT Responsible For
//! - Recording samples (see `web::Web::record`)
//! - Retrying inside a tick; the next tick is the retry

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::buffer::Buffer;
use crate::clock::{Clock, SystemClock};
use crate::error::DispatchError;
use crate::transport::{Overrides, Transport};

// ---------------------------------------------------------------------------
// DispatchState
// ---------------------------------------------------------------------------

/// Collector-tunable dispatch parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchState {
    /// Pause between drain attempts.
    pub interval: Duration,
    /// Per-attempt network timeout.
    pub timeout: Duration,
    /// Maximum age, in seconds, of a re-buffered bucket.
    pub buffer_ttl: u64,
}

impl Default for DispatchState {
    /// 1 s interval, 5 s timeout, 60 s TTL.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            buffer_ttl: 60,
        }
    }
}

impl DispatchState {
    /// Apply whatever the collector sent; absent fields keep their value.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(interval) = overrides.interval {
            self.interval = interval;
        }
        if let Some(timeout) = overrides.timeout {
            self.timeout = timeout;
        }
        if let Some(ttl) = overrides.buffer_ttl {
            self.buffer_ttl = ttl;
        }
    }
}

/// What one drain cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing buffered; no network I/O.
    Idle,
    /// The collector accepted the snapshot.
    Delivered { buckets: usize, samples: usize },
    /// Delivery failed; the snapshot was re-buffered and `evicted` stale
    /// buckets were dropped.
    Requeued { error: DispatchError, evicted: usize },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Shared {
    buffer: Arc<Buffer>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<DispatchState>,
    // Held for the whole tick, network I/O included, so ticks never overlap.
    gate: tokio::sync::Mutex<()>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Lifecycle slot. `Stopping` covers the window in which `stop()` waits for
/// the loop task; the dispatcher still counts as running and cannot be
/// restarted until it ends.
enum Lifecycle {
    Idle,
    Running(Runner),
    Stopping,
}

/// Background drain loop over a shared [`Buffer`].
///
/// Use [`Dispatcher::builder`] to construct.
pub struct Dispatcher {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

/// Returns the slot to `Idle` when `stop()` finishes or is cancelled.
struct StopGuard<'a>(&'a Mutex<Lifecycle>);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Idle;
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Dispatcher {
    pub fn builder(buffer: Arc<Buffer>, transport: Arc<dyn Transport>) -> DispatcherBuilder {
        DispatcherBuilder {
            buffer,
            transport,
            clock: Arc::new(SystemClock),
            state: DispatchState::default(),
        }
    }

    /// Begin the periodic loop on the current tokio runtime.
    ///
    /// Returns `false` if the loop is already running, is still stopping,
    /// or there is no runtime to spawn onto.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "[HireFire] Cannot start web metrics dispatcher outside a tokio runtime.");
                return false;
            }
        };

        info!("[HireFire] Starting web metrics dispatcher.");
        let (shutdown, rx) = watch::channel(false);
        let handle = runtime.spawn(run(Arc::clone(&self.shared), rx));
        *lifecycle = Lifecycle::Running(Runner { shutdown, handle });
        true
    }

    /// Halt the loop. Waits for an in-flight tick to finish before returning;
    /// until then the dispatcher still reports running.
    ///
    /// Returns `false` if it was not running or another `stop()` is already
    /// waiting.
    pub async fn stop(&self) -> bool {
        let runner = {
            let mut lifecycle = self.lock_lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(runner) => runner,
                other => {
                    *lifecycle = other;
                    return false;
                }
            }
        };
        let _reset = StopGuard(&self.lifecycle);

        let _ = runner.shutdown.send(true);
        if let Err(e) = runner.handle.await {
            error!(error = %e, "[HireFire] Web metrics dispatcher task ended abnormally.");
        }
        info!("[HireFire] Web metrics dispatcher stopped.");
        true
    }

    pub fn is_running(&self) -> bool {
        !matches!(*self.lock_lifecycle(), Lifecycle::Idle)
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one drain cycle now, independent of the loop.
    pub async fn tick(&self) -> TickOutcome {
        self.shared.tick().await
    }

    /// Current tunables.
    pub fn state(&self) -> DispatchState {
        self.shared.state()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.shared.buffer
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // A dropped dispatcher must not leave an orphaned loop behind.
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running(runner) = lifecycle {
            let _ = runner.shutdown.send(true);
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval = shared.state().interval;
        tokio::select! {
            // Fires on stop() or when the Dispatcher is dropped.
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        // Not raced against shutdown: an in-flight tick always completes.
        shared.tick().await;
    }
}

impl Shared {
    fn state(&self) -> DispatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn tick(&self) -> TickOutcome {
        let _gate = self.gate.lock().await;

        let pending = self.buffer.snapshot_and_clear();
        if pending.is_empty() {
            return TickOutcome::Idle;
        }

        let buckets = pending.len();
        let samples: usize = pending.values().map(Vec::len).sum();
        let state = self.state();
        info!(buckets, samples, "[HireFire] Dispatching web metrics.");

        match self.transport.send(&pending, state.timeout).await {
            Ok(overrides) => {
                if !overrides.is_empty() {
                    let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    current.apply(overrides);
                    debug!(state = ?*current, "[HireFire] Applied dispatch overrides.");
                }
                TickOutcome::Delivered { buckets, samples }
            }
            Err(error) => {
                let evicted = self
                    .buffer
                    .repopulate(pending, self.clock.unix_secs(), state.buffer_ttl);
                error!(
                    evicted,
                    configuration = error.is_configuration(),
                    "[HireFire] Error while dispatching web metrics: {error}"
                );
                TickOutcome::Requeued { error, evicted }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Dispatcher`].
///
/// ```rust,ignore
/// let dispatcher = Dispatcher::builder(Arc::clone(&buffer), transport)
///     .interval(Duration::from_millis(500))
///     .build();
/// dispatcher.start();
/// ```
pub struct DispatcherBuilder {
    buffer: Arc<Buffer>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: DispatchState,
}

impl DispatcherBuilder {
    /// Time source used to age buckets on re-buffering.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace all initial tunables at once.
    pub fn state(mut self, state: DispatchState) -> Self {
        self.state = state;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.state.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.state.timeout = timeout;
        self
    }

    pub fn buffer_ttl(mut self, secs: u64) -> Self {
        self.state.buffer_ttl = secs;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            shared: Arc::new(Shared {
                buffer: self.buffer,
                transport: self.transport,
                clock: self.clock,
                state: Mutex::new(self.state),
                gate: tokio::sync::Mutex::new(()),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Snapshot;
    use crate::clock::MockClock;
    use crate::test_support::LogSink;
    use crate::transport::MockTransport;

    const T0: i64 = 946_684_800;

    fn dispatcher(transport: Arc<MockTransport>, clock: &MockClock) -> Dispatcher {
        Dispatcher::builder(Arc::new(Buffer::new()), transport)
            .clock(Arc::new(clock.clone()))
            .build()
    }

    fn snapshot(pairs: &[(i64, &[u64])]) -> Snapshot {
        pairs.iter().map(|(b, s)| (*b, s.to_vec())).collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_is_idempotent() {
        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));
        assert!(d.start());
        assert!(d.is_running());
        assert!(!d.start());
        assert!(d.stop().await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));
        assert!(!d.stop().await, "stopping a stopped dispatcher is a no-op");
        d.start();
        assert!(d.stop().await);
        assert!(!d.is_running());
        assert!(!d.stop().await);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));
        assert!(d.start());
        assert!(d.stop().await);
        assert!(d.start());
        assert!(d.is_running());
        assert!(d.stop().await);
    }

    #[tokio::test]
    async fn lifecycle_notices_logged_once_per_transition() {
        let sink = LogSink::default();
        let _guard = sink.install();

        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));
        d.start();
        d.start();
        assert_eq!(sink.count("[HireFire] Starting web metrics dispatcher."), 1);

        d.stop().await;
        d.stop().await;
        assert_eq!(sink.count("[HireFire] Web metrics dispatcher stopped."), 1);
    }

    #[tokio::test]
    async fn stop_leaves_nothing_to_flush_when_idle() {
        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));
        d.start();
        d.stop().await;
        assert!(d.buffer().snapshot_and_clear().is_empty());
    }

    // -----------------------------------------------------------------------
    // tick
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_buffer_skips_transport() {
        let transport = Arc::new(MockTransport::ok());
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        assert_eq!(d.tick().await, TickOutcome::Idle);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn successful_tick_ships_snapshot_and_empties_buffer() {
        let transport = Arc::new(MockTransport::ok());
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        d.buffer().add(5, 0);
        d.buffer().add(10, 0);

        let outcome = d.tick().await;

        assert_eq!(outcome, TickOutcome::Delivered { buckets: 1, samples: 2 });
        assert_eq!(transport.sent(), vec![snapshot(&[(0, &[5, 10])])]);
        assert!(d.buffer().is_empty());
    }

    #[tokio::test]
    async fn rejected_tick_leaves_buffer_unchanged() {
        let transport = Arc::new(MockTransport::failing(DispatchError::Rejected {
            status: 500,
            body: String::new(),
        }));
        let d = dispatcher(transport, &MockClock::at_secs(0));
        d.buffer().add(5, 0);
        let before = d.buffer().peek();

        let outcome = d.tick().await;

        assert!(matches!(outcome, TickOutcome::Requeued { evicted: 0, .. }));
        assert_eq!(d.buffer().peek(), before);
    }

    #[tokio::test]
    async fn every_failure_kind_requeues() {
        for error in [
            DispatchError::MissingToken,
            DispatchError::Timeout,
            DispatchError::Request("Generic Error".into()),
            DispatchError::Rejected { status: 503, body: "busy".into() },
        ] {
            let d = dispatcher(
                Arc::new(MockTransport::failing(error.clone())),
                &MockClock::at_secs(T0 as u64),
            );
            d.buffer().add(5, T0);
            match d.tick().await {
                TickOutcome::Requeued { error: got, .. } => assert_eq!(got, error),
                other => panic!("expected requeue for {error:?}, got {other:?}"),
            }
            assert_eq!(d.buffer().peek(), snapshot(&[(T0, &[5])]));
        }
    }

    #[tokio::test]
    async fn failure_is_logged_with_cause() {
        let sink = LogSink::default();
        let _guard = sink.install();

        let d = dispatcher(
            Arc::new(MockTransport::failing(DispatchError::Timeout)),
            &MockClock::at_secs(0),
        );
        d.buffer().add(5, 0);
        d.tick().await;

        assert!(sink.contains(
            "[HireFire] Error while dispatching web metrics: The request to the server timed out."
        ));
    }

    #[tokio::test]
    async fn missing_token_logs_remedy() {
        let sink = LogSink::default();
        let _guard = sink.install();

        let d = dispatcher(
            Arc::new(MockTransport::failing(DispatchError::MissingToken)),
            &MockClock::at_secs(0),
        );
        d.buffer().add(5, 0);
        d.tick().await;

        assert!(sink.contains("HIREFIRE_TOKEN environment variable is not set"));
    }

    #[tokio::test]
    async fn ttl_evicts_only_stale_buckets_on_failure() {
        let clock = MockClock::at_secs(T0 as u64);
        let transport = Arc::new(MockTransport::failing(DispatchError::Rejected {
            status: 500,
            body: String::new(),
        }));
        let d = dispatcher(transport, &clock);

        d.buffer().add(5, T0);
        d.buffer().add(10, T0 + 30);

        clock.set_secs(T0 as u64 + 60);
        d.tick().await;
        assert_eq!(d.buffer().peek(), snapshot(&[(T0, &[5]), (T0 + 30, &[10])]));

        clock.set_secs(T0 as u64 + 61);
        assert!(matches!(d.tick().await, TickOutcome::Requeued { evicted: 1, .. }));
        assert_eq!(d.buffer().peek(), snapshot(&[(T0 + 30, &[10])]));

        clock.set_secs(T0 as u64 + 90);
        d.tick().await;
        assert_eq!(d.buffer().peek(), snapshot(&[(T0 + 30, &[10])]));

        clock.set_secs(T0 as u64 + 91);
        d.tick().await;
        assert!(d.buffer().is_empty());
    }

    #[tokio::test]
    async fn sustained_outage_keeps_buffer_bounded() {
        let clock = MockClock::at_secs(T0 as u64);
        let d = dispatcher(Arc::new(MockTransport::failing(DispatchError::Timeout)), &clock);

        for second in 0..120u64 {
            clock.set_secs(T0 as u64 + second);
            d.buffer().add(1, clock.unix_secs());
            d.tick().await;
            let oldest = *d.buffer().peek().keys().next().unwrap();
            assert!(clock.unix_secs() - oldest <= 60);
        }
        assert_eq!(d.buffer().bucket_count(), 61);
    }

    #[tokio::test]
    async fn success_headers_retune_state() {
        let transport = Arc::new(MockTransport::replying([Ok(Overrides {
            interval: Some(Duration::from_secs(10)),
            timeout: Some(Duration::from_secs(10)),
            buffer_ttl: Some(120),
        })]));
        let d = dispatcher(transport, &MockClock::at_secs(0));
        assert_eq!(d.state(), DispatchState::default());

        d.buffer().add(5, 0);
        d.tick().await;

        assert_eq!(
            d.state(),
            DispatchState {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(10),
                buffer_ttl: 120,
            }
        );
    }

    #[tokio::test]
    async fn partial_overrides_keep_other_values() {
        let transport = Arc::new(MockTransport::replying([Ok(Overrides {
            buffer_ttl: Some(30),
            ..Overrides::default()
        })]));
        let d = dispatcher(transport, &MockClock::at_secs(0));
        d.buffer().add(5, 0);
        d.tick().await;

        let state = d.state();
        assert_eq!(state.buffer_ttl, 30);
        assert_eq!(state.interval, Duration::from_secs(1));
        assert_eq!(state.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failed_tick_does_not_retune() {
        let d = dispatcher(
            Arc::new(MockTransport::failing(DispatchError::Timeout)),
            &MockClock::at_secs(0),
        );
        d.buffer().add(5, 0);
        d.tick().await;
        assert_eq!(d.state(), DispatchState::default());
    }

    #[tokio::test]
    async fn retuned_ttl_drives_next_eviction() {
        let clock = MockClock::at_secs(T0 as u64);
        let transport = Arc::new(MockTransport::replying([
            Ok(Overrides { buffer_ttl: Some(5), ..Overrides::default() }),
            Err(DispatchError::Timeout),
        ]));
        let d = dispatcher(transport, &clock);

        d.buffer().add(1, T0);
        d.tick().await;

        d.buffer().add(2, T0);
        clock.set_secs(T0 as u64 + 6);
        assert!(matches!(d.tick().await, TickOutcome::Requeued { evicted: 1, .. }));
        assert!(d.buffer().is_empty());
    }

    // -----------------------------------------------------------------------
    // Loop scheduling (virtual time)
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_every_interval() {
        let transport = Arc::new(MockTransport::ok());
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        d.start();

        d.buffer().add(1, 0);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.calls(), 1);

        d.buffer().add(2, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.calls(), 2);

        d.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_adopts_new_interval_after_success() {
        let transport = Arc::new(MockTransport::replying([Ok(Overrides {
            interval: Some(Duration::from_secs(10)),
            ..Overrides::default()
        })]));
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        d.start();

        d.buffer().add(1, 0);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.calls(), 1);

        d.buffer().add(2, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.calls(), 1, "still waiting out the 10 s interval");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.calls(), 2);

        d.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_failures() {
        let transport = Arc::new(MockTransport::failing(DispatchError::Timeout));
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        d.start();
        d.buffer().add(1, 0);

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(transport.calls(), 3);
        assert!(d.is_running());
        assert_eq!(d.buffer().peek(), snapshot(&[(0, &[1])]));
        d.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_tick() {
        let transport = Arc::new(MockTransport::ok().delayed(Duration::from_secs(3)));
        let d = dispatcher(Arc::clone(&transport), &MockClock::at_secs(0));
        d.start();
        d.buffer().add(1, 0);

        // First tick begins at 1 s and is inside send() until 4 s.
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(transport.calls(), 0);

        assert!(d.stop().await);
        assert_eq!(transport.calls(), 1, "in-flight tick completed before stop returned");
        assert!(d.buffer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_stop_blocks_restart() {
        let transport = Arc::new(MockTransport::ok().delayed(Duration::from_secs(3)));
        let d = Arc::new(dispatcher(Arc::clone(&transport), &MockClock::at_secs(0)));
        d.start();
        d.buffer().add(1, 0);
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let stopping = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(d.is_running(), "still running while the tick drains");
        assert!(!d.start(), "no second loop while the first is stopping");
        assert!(!d.stop().await, "only one stop waits");

        assert!(stopping.await.unwrap());
        assert!(!d.is_running());
        assert_eq!(transport.calls(), 1);

        assert!(d.start());
        assert!(d.stop().await);
    }

    #[test]
    fn start_outside_runtime_is_refused() {
        let sink = LogSink::default();
        let _guard = sink.install();

        let d = dispatcher(Arc::new(MockTransport::ok()), &MockClock::at_secs(0));

        assert!(!d.start());
        assert!(!d.is_running());
        assert!(sink.contains("outside a tokio runtime"));
        assert_eq!(sink.count("[HireFire] Starting web metrics dispatcher."), 0);
    }

    // -----------------------------------------------------------------------
    // Samples recorded during an in-flight tick
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn samples_added_mid_send_wait_for_next_tick() {
        let transport = Arc::new(MockTransport::ok().delayed(Duration::from_secs(1)));
        let d = Arc::new(dispatcher(Arc::clone(&transport), &MockClock::at_secs(0)));
        d.buffer().add(1, 0);

        let ticking = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.buffer().add(2, 0);

        assert_eq!(ticking.await.unwrap(), TickOutcome::Delivered { buckets: 1, samples: 1 });
        assert_eq!(transport.sent(), vec![snapshot(&[(0, &[1])])]);
        assert_eq!(d.buffer().peek(), snapshot(&[(0, &[2])]));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_merges_ahead_of_samples_added_mid_send() {
        let transport = Arc::new(MockTransport::failing(DispatchError::Timeout).delayed(Duration::from_secs(1)));
        let d = Arc::new(dispatcher(Arc::clone(&transport), &MockClock::at_secs(0)));
        d.buffer().add(1, 0);

        let ticking = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.buffer().add(2, 0);

        assert!(matches!(
            ticking.await.unwrap(),
            TickOutcome::Requeued { error: DispatchError::Timeout, evicted: 0 }
        ));
        assert_eq!(d.buffer().peek(), snapshot(&[(0, &[1, 2])]));
    }
}
