//! Telemetry initialization
//!
//! Structured logging through `tracing-subscriber`, as text or JSON lines.

mod init_basic;

pub use init_basic::{init_telemetry, shutdown_telemetry};
