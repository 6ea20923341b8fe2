//! Observability
//!
//! - Structured logging through `tracing`, JSON or human-readable
//! - Lock-free stream counters, served by the HTTP layer

mod logging;
mod metrics;

pub use logging::{env_filter, init_logging};
pub use metrics::{MetricsSnapshot, StreamMetrics};
