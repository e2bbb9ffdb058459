//! Conflict-free, eventually-consistent sync between replicas of a
//! record-oriented store.
//!
//! Each replica records mutations in a causally-ordered [`Journal`]; a
//! [`Merger`] exchanges change logs between two journals so that, after a
//! mutual sync, both observe the same set of changes and equivalent clocks,
//! regardless of message ordering or duplicate delivery.

pub mod change;
pub mod clock;
pub mod error;
pub mod extension;
pub mod journal;
pub mod merge;

pub use change::{Change, ChangeOp, ChangeType, DEFAULT_TABLE, timestamp_now};
pub use clock::{ClockOrdering, VectorClock};
pub use error::SyncError;
pub use journal::{ApplyOutcome, Journal};
pub use merge::{MergeReport, Merger, merge_databases};
