//! Database repositories for the storage lifecycle
//
// Purge repository trait and Postgres implementation
pub mod purge;
//
// In-process archive used by tests and dry runs
pub mod memory;
//
// Pool setup and migrations
pub mod pool;
//
// Bounded retry for transient failures
pub mod retry;
//
// Export completion notifications (LISTEN/NOTIFY)
pub mod notify;

pub use memory::InMemoryArchive;
pub use notify::{listen_export_events, parse_export_completed, EXPORT_COMPLETED_CHANNEL};
pub use pool::{connect, run_migrations};
pub use purge::{PgPurgeRepository, PurgeRepository};
pub use retry::retry_with_delay;
