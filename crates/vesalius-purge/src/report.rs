//! Counters reported by deletion batches and tier scans.

use std::fmt;
use std::ops::AddAssign;

/// Outcome of one [`crate::DeletionPool::delete_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    /// Claim lost to another worker, or the record disappeared.
    pub skipped: usize,
    /// Left for the next cycle.
    pub failed: usize,
    /// Sum of the sizes of the items deleted.
    pub bytes_freed: u64,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.bytes_freed += other.bytes_freed;
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (skipped={}, failed={})",
            self.succeeded, self.skipped, self.failed
        )
    }
}

/// Totals of one [`crate::PurgeScheduler::process`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub storage_id: String,
    pub metadata: BatchReport,
    pub objects: BatchReport,
    pub studies_evicted: usize,
    pub studies_deferred: usize,
}

impl PurgeReport {
    pub fn new(storage_id: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            ..Self::default()
        }
    }

    pub fn bytes_freed(&self) -> u64 {
        self.metadata.bytes_freed + self.objects.bytes_freed
    }
}
