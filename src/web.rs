//! The web dyno: records request queue time and dispatches it in the
//! background.

use std::sync::Arc;

use crate::buffer::{Buffer, Sample};
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{DispatchState, Dispatcher, TickOutcome};
use crate::settings::Settings;
use crate::transport::{HttpTransport, Transport};

/// Request queue time recorder for one process.
///
/// `record` is cheap and safe to call from every request handler; delivery
/// happens on the dispatcher task started with [`Web::start_dispatcher`].
pub struct Web {
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Web {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Web")
            .field("dispatcher", &self.dispatcher)
            .field("buffered_samples", &self.buffer().sample_count())
            .finish()
    }
}

impl Web {
    /// Deliver to the HireFire collector described by `settings`.
    pub fn new(settings: Settings) -> Self {
        Self::with_transport(Arc::new(HttpTransport::new(settings)), Arc::new(SystemClock))
    }

    /// Deliver through any transport, timed by any clock.
    pub fn with_transport(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self::with_state(transport, clock, DispatchState::default())
    }

    pub fn with_state(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, state: DispatchState) -> Self {
        let dispatcher = Dispatcher::builder(Arc::new(Buffer::new()), transport)
            .clock(Arc::clone(&clock))
            .state(state)
            .build();
        Self { clock, dispatcher }
    }

    /// Record one request's queue time, bucketed by the current second.
    pub fn record(&self, latency_ms: Sample) {
        self.dispatcher.buffer().add(latency_ms, self.clock.unix_secs());
    }

    /// See [`Dispatcher::start`].
    pub fn start_dispatcher(&self) -> bool {
        self.dispatcher.start()
    }

    /// See [`Dispatcher::stop`].
    pub async fn stop_dispatcher(&self) -> bool {
        self.dispatcher.stop().await
    }

    pub fn dispatcher_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Drain and deliver once, outside the schedule.
    pub async fn dispatch_buffer(&self) -> TickOutcome {
        self.dispatcher.tick().await
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        self.dispatcher.buffer()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
