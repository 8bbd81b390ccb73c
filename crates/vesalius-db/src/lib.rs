//! Vesalius persistence layer
//!
//! The study, series, instance, location and metadata records the purge engine reads
//! and claims. [`db::PurgeRepository`] is the contract; [`db::PgPurgeRepository`] is
//! the Postgres implementation and [`db::InMemoryArchive`] an in-process one used by
//! tests and dry runs.

pub mod db;

pub use db::{
    connect, listen_export_events, parse_export_completed, retry_with_delay, run_migrations,
    InMemoryArchive, PgPurgeRepository, PurgeRepository, EXPORT_COMPLETED_CHANNEL,
};
