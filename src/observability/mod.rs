//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! pool / connect_job / transaction produce:
//!     → logging.rs (structured tracing events, subscriber set up by the binary)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//! ```
//!
//! # Design Decisions
//! - The library never installs a subscriber or a metrics recorder
//! - Metric updates are no-ops until the embedding process installs a recorder

pub mod logging;
pub mod metrics;
