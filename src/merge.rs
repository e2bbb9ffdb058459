//! Bidirectional merge between two journals.
//!
//! The merger is a stateless coordinator: it computes the delta a peer is
//! owed, applies the symmetric delta locally, and advances the per-peer
//! cursors. Every applied change commits on its own, so an abandoned sync
//! can simply be retried; duplicate delivery is absorbed by the journal.

use std::path::Path;

use tracing::debug;

use crate::change::Change;
use crate::error::SyncError;
use crate::journal::{ApplyOutcome, Journal};

/// Outcome of one merge operation.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Changes handed to the peer.
    pub sent: usize,
    /// Remote changes newly applied locally (duplicates excluded).
    pub received: usize,
    /// Reserved: the CRDT model retains all concurrent changes, so nothing
    /// is ever rejected as a conflict. Always 0.
    pub conflicts_resolved: usize,
    /// Per-change failures, collected rather than aborting the batch.
    /// Failures on the peer's side are prefixed with `remote:`.
    pub errors: Vec<String>,
}

impl MergeReport {
    /// True when the merge completed without errors.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Coordinates sync for one local journal.
pub struct Merger<'a> {
    local: &'a Journal,
}

impl<'a> Merger<'a> {
    pub fn new(local: &'a Journal) -> Self {
        Self { local }
    }

    /// Compute the delta owed to `peer_site`: everything past the version the
    /// peer has acknowledged, minus the peer's own changes (never echoed
    /// back). Returns the delta and the local version the peer may adopt as
    /// its watermark for this journal; the pair is observed atomically.
    pub fn outbound_to(&self, peer_site: &str) -> Result<(Vec<Change>, i64), SyncError> {
        let acked = self.local.acked_watermark(peer_site)?;
        let (changes, local_version) = self.local.snapshot_since(acked)?;
        let outbound: Vec<Change> = changes
            .into_iter()
            .filter(|c| c.site_id != peer_site)
            .collect();
        Ok((outbound, local_version))
    }

    /// Apply a batch pulled from `peer_site`, in the peer's ascending
    /// `db_version` order. Per-change failures are collected; the batch
    /// never aborts on a single bad row.
    ///
    /// The pull watermark advances to `peer_version` when the batch was
    /// empty (establishing the cursor for an idle peer) or when at least one
    /// change processed without error; the journal clamps it monotonic.
    pub fn apply_incoming(
        &self,
        changes: &[Change],
        peer_site: &str,
        peer_version: i64,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut processed = 0usize;

        for change in changes {
            match self.local.apply_remote(change) {
                Ok(ApplyOutcome::Applied) => {
                    report.received += 1;
                    processed += 1;
                }
                Ok(ApplyOutcome::Duplicate) => processed += 1,
                Err(e) => report.errors.push(format!(
                    "error applying change {} ({}/{}): {e}",
                    change.entity_id, change.site_id, change.db_version
                )),
            }
        }

        if changes.is_empty() || processed > 0 {
            if let Err(e) = self.local.set_peer_watermark(peer_site, peer_version) {
                report
                    .errors
                    .push(format!("error updating watermark for {peer_site}: {e}"));
            }
        }

        report
    }

    /// Bidirectional exchange with `remote`: pull and apply its delta, push
    /// ours, and advance both sides' cursors. After an error-free sync with
    /// no concurrent mutation, the two journals hold the same set of changes
    /// and equal clocks.
    pub fn sync_with(&self, remote: &Journal) -> Result<MergeReport, SyncError> {
        let local_site = self.local.site_id();
        let peer_site = remote.site_id();

        let (to_send, local_version) = self.outbound_to(peer_site)?;

        let since = self.local.peer_watermark(peer_site)?;
        let (remote_changes, remote_version) = remote.snapshot_since(since)?;
        let incoming: Vec<Change> = remote_changes
            .into_iter()
            .filter(|c| c.site_id != local_site)
            .collect();

        let mut report = self.apply_incoming(&incoming, peer_site, remote_version);
        let pulled_clean = report.errors.is_empty();

        let remote_report = Merger::new(remote).apply_incoming(&to_send, local_site, local_version);
        if remote_report.errors.is_empty() {
            // The peer now holds our journal through `local_version`.
            self.local.set_acked_watermark(peer_site, local_version)?;
        }
        if pulled_clean {
            remote.set_acked_watermark(local_site, remote_version)?;
        }

        report.sent = to_send.len();
        report
            .errors
            .extend(remote_report.errors.iter().map(|e| format!("remote: {e}")));

        debug!(
            local = %local_site,
            peer = %peer_site,
            sent = report.sent,
            received = report.received,
            errors = report.errors.len(),
            "bidirectional sync complete"
        );
        Ok(report)
    }
}

/// Open two journal stores and run one bidirectional sync between them.
///
/// Site ids are derived from the file stems, so repeated merges of the same
/// paths keep stable identities.
pub fn merge_databases(
    path_a: impl AsRef<Path>,
    path_b: impl AsRef<Path>,
) -> Result<MergeReport, SyncError> {
    let site_of = |p: &Path| {
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string());
        format!("site-{stem}")
    };

    let journal_a = Journal::open(path_a.as_ref(), site_of(path_a.as_ref()))?;
    let journal_b = Journal::open(path_b.as_ref(), site_of(path_b.as_ref()))?;
    Merger::new(&journal_a).sync_with(&journal_b)
}
