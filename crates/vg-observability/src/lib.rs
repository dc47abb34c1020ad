//! # vg-observability
//!
//! Logging and metrics infrastructure for Vendorgate.
//!
//! This crate provides structured logging via the tracing ecosystem and
//! KPI aggregation over the counters the engine and scheduler emit through
//! the `metrics` facade.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{ApprovalKpis, ApprovalMetrics};
