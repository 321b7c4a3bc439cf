//! # Utility Modules
//!
//! Supporting utilities shared by the registry and the facade.
//!
//! ## Components
//! - **Last Error**: engine-wide most-recent failure message
//! - **Logging**: tracing-subscriber setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: thread-safe counters per engine

pub mod last_error;
pub mod logging;
pub mod metrics;

pub use last_error::LastError;
pub use metrics::{Metrics, MetricsSnapshot};
