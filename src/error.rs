use thiserror::Error;

/// Errors surfaced by the journal, merger, and codecs.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The underlying store failed. The atomic-commit discipline guarantees
    /// no partial journal state; callers may retry.
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A serialized vector clock could not be decoded.
    #[error("invalid clock: {0}")]
    InvalidClock(String),

    /// A change was malformed (empty identifier, unknown change type,
    /// non-positive version, shape/variant mismatch). Rejected before any
    /// mutation.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// The optional native CRDT extension is missing or failed to load.
    /// Recoverable: the pure journal path does not need it.
    #[error("crdt accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),
}
