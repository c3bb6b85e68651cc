//! # hirefire-resource
//!
//! Metrics agent for the HireFire autoscaler.
//!
//! Two kinds of dyno are supported:
//!
//! - **web**: request queue time is recorded per request into a
//!   [`Buffer`], and a background [`Dispatcher`] periodically POSTs the
//!   drained buffer to the HireFire collector.
//! - **worker**: a named [`Measure`] (job queue size, latency, anything) is
//!   polled on demand whenever HireFire hits the info endpoint.
//!
//! ## Pipeline
//!
//! ```text
//! request ──► middleware ──► Web::record ──► Buffer
//!                                              │  every interval
//!                                              ▼
//!                                         Dispatcher ──► Transport ──► collector
//!                                              ▲               │
//!                                              └── overrides ◄─┘
//! ```
//!
//! Delivery failures are logged through `tracing` and the snapshot goes back
//! into the buffer; nothing is ever surfaced to request-handling code.

pub mod broker;
pub mod buffer;
pub mod clock;
pub mod configuration;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod settings;
pub mod transport;
pub mod web;
pub mod worker;

pub use buffer::{Buffer, Bucket, Sample, Snapshot};
pub use clock::{Clock, MockClock, SystemClock};
pub use configuration::{Configuration, ConfigurationBuilder, HireFire, WorkerValue};
pub use dispatcher::{DispatchState, Dispatcher, TickOutcome};
pub use error::{BrokerError, DispatchError, MeasureError, WorkerError};
pub use middleware::{InfoResponse, RequestParts};
pub use settings::Settings;
pub use transport::{HttpTransport, Overrides, Transport, MAX_REJECTION_BODY};
pub use web::Web;
pub use worker::{FnMeasure, Measure, Worker};

/// Crate version, reported to the collector.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client identifier reported alongside [`VERSION`].
pub const CLIENT_NAME: &str = "Rust";

/// Value of the `HireFire-Resource` header, e.g. `Rust-1.0.0`.
pub fn resource_header() -> String {
    format!("{CLIENT_NAME}-{VERSION}")
}
