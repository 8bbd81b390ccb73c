//! Result of a compare-and-swap ownership transfer.

/// Outcome of a deletion claim.
///
/// `Claimed` grants the exclusive right to physically delete the claimed bytes.
/// The other variants are expected under concurrency and are counted as skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome<T = ()> {
    Claimed(T),
    /// The persisted value changed since it was observed: another worker won.
    AlreadyClaimed,
    /// The record no longer exists.
    NotFound,
}

impl<T> ClaimOutcome<T> {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    /// Returns the claimed value, if any.
    pub fn claimed(self) -> Option<T> {
        match self {
            ClaimOutcome::Claimed(value) => Some(value),
            ClaimOutcome::AlreadyClaimed | ClaimOutcome::NotFound => None,
        }
    }
}
