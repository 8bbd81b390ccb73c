//! Vesalius Infrastructure Library
//!
//! Process-level plumbing shared by the archive daemons:
//! - Telemetry initialization (tracing subscriber)
//! - Shutdown signal handling

#[cfg(feature = "observability-basic")]
pub mod telemetry;

pub mod shutdown;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};

pub use shutdown::shutdown_signal;
