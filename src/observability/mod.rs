//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! store, sync and server subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every change notification is logged with its key, action and index
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;
