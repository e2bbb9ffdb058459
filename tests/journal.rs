//! Journal behavior against a real store: recording, idempotent remote
//! apply, persistence across reopen, and watermark discipline.

use replica_sync::{
    ApplyOutcome, Change, ChangeOp, Journal, SyncError, VectorClock, timestamp_now,
};
use tempfile::TempDir;

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    VectorClock::from_counters(entries.iter().map(|(s, n)| (s.to_string(), *n)))
}

fn remote_change(site: &str, db_version: i64, entity: &str) -> Change {
    Change {
        entity_id: entity.to_string(),
        table_name: "entities".to_string(),
        op: ChangeOp::insert_row("{}"),
        site_id: site.to_string(),
        db_version,
        clock: clock(&[(site, db_version as u64)]),
        timestamp: timestamp_now(),
    }
}

#[test]
fn record_then_read_back() {
    let journal = Journal::open_in_memory("test-site").unwrap();

    let change = journal
        .record("e1", ChangeOp::insert_row(r#"{"name":"x"}"#))
        .unwrap();

    assert_eq!(change.db_version, 1);
    assert_eq!(change.site_id, "test-site");
    assert_eq!(change.clock, clock(&[("test-site", 1)]));
    assert_eq!(journal.current_version().unwrap(), 1);

    let rows = journal.changes_since(0).unwrap();
    assert_eq!(rows, vec![change]);
}

#[test]
fn duplicate_remote_apply_is_a_no_op() {
    let journal = Journal::open_in_memory("local").unwrap();
    let change = remote_change("rs", 1, "e1");

    assert_eq!(journal.apply_remote(&change).unwrap(), ApplyOutcome::Applied);
    assert_eq!(
        journal.apply_remote(&change).unwrap(),
        ApplyOutcome::Duplicate
    );

    assert_eq!(journal.current_clock(), clock(&[("rs", 1)]));
    assert_eq!(journal.changes_since(0).unwrap().len(), 1);
}

#[test]
fn remote_rows_keep_their_origin_version() {
    let journal = Journal::open_in_memory("local").unwrap();
    journal.apply_remote(&remote_change("rs", 7, "e1")).unwrap();

    let rows = journal.changes_since(0).unwrap();
    assert_eq!(rows[0].site_id, "rs");
    assert_eq!(rows[0].db_version, 7);
    assert_eq!(journal.current_version().unwrap(), 7);
}

#[test]
fn local_versions_are_minted_per_origin() {
    let journal = Journal::open_in_memory("local").unwrap();
    journal.apply_remote(&remote_change("rs", 5, "e1")).unwrap();

    // Remote rows must not perturb this site's own numbering.
    let first = journal.record("mine-1", ChangeOp::Delete).unwrap();
    let second = journal.record("mine-2", ChangeOp::Delete).unwrap();
    assert_eq!(first.db_version, 1);
    assert_eq!(second.db_version, 2);
}

#[test]
fn record_observes_previously_applied_clocks() {
    let journal = Journal::open_in_memory("a").unwrap();
    journal.apply_remote(&remote_change("b", 3, "eb")).unwrap();

    let change = journal.record("ea", ChangeOp::insert_row("{}")).unwrap();
    assert_eq!(change.clock, clock(&[("a", 1), ("b", 3)]));
}

#[test]
fn changes_since_filters_and_orders_by_version() {
    let journal = Journal::open_in_memory("s").unwrap();
    for i in 1..=4 {
        journal
            .record(&format!("e{i}"), ChangeOp::insert_row("{}"))
            .unwrap();
    }

    let rows = journal.changes_since(2).unwrap();
    let versions: Vec<i64> = rows.iter().map(|c| c.db_version).collect();
    assert_eq!(versions, vec![3, 4]);
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.db");

    {
        let journal = Journal::open(&path, "s").unwrap();
        journal.record("e1", ChangeOp::insert_row("{}")).unwrap();
        journal
            .record("e2", ChangeOp::update_column("name", r#""x""#))
            .unwrap();
        journal.set_peer_watermark("peer", 4).unwrap();
    }

    let journal = Journal::open(&path, "s").unwrap();
    assert_eq!(journal.current_version().unwrap(), 2);
    assert_eq!(journal.current_clock(), clock(&[("s", 2)]));
    assert_eq!(journal.peer_watermark("peer").unwrap(), 4);

    let rows = journal.changes_since(0).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].entity_id, "e1");
    assert_eq!(rows[1].entity_id, "e2");
}

#[test]
fn stale_persisted_clock_is_healed_on_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.db");

    {
        let journal = Journal::open(&path, "s").unwrap();
        journal.record("e1", ChangeOp::insert_row("{}")).unwrap();
        journal.record("e2", ChangeOp::insert_row("{}")).unwrap();
    }

    // Simulate a crash that lost the clock write but kept the rows.
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE clock SET clock_json = '{}' WHERE id = 1", [])
            .unwrap();
    }

    let journal = Journal::open(&path, "s").unwrap();
    assert_eq!(journal.current_clock(), clock(&[("s", 2)]));
}

#[test]
fn watermarks_never_go_backwards() {
    let journal = Journal::open_in_memory("s").unwrap();
    assert_eq!(journal.peer_watermark("peer").unwrap(), 0);

    journal.set_peer_watermark("peer", 5).unwrap();
    journal.set_peer_watermark("peer", 3).unwrap();
    assert_eq!(journal.peer_watermark("peer").unwrap(), 5);

    journal.set_acked_watermark("peer", 2).unwrap();
    journal.set_acked_watermark("peer", 1).unwrap();
    assert_eq!(journal.acked_watermark("peer").unwrap(), 2);
    // The two cursors are independent.
    assert_eq!(journal.peer_watermark("peer").unwrap(), 5);
}

#[test]
fn invalid_changes_are_rejected_before_any_mutation() {
    let journal = Journal::open_in_memory("s").unwrap();

    let mut missing_entity = remote_change("rs", 1, "e1");
    missing_entity.entity_id.clear();
    assert!(matches!(
        journal.apply_remote(&missing_entity),
        Err(SyncError::InvalidChange(_))
    ));

    let mut bad_version = remote_change("rs", 1, "e1");
    bad_version.db_version = 0;
    assert!(matches!(
        journal.apply_remote(&bad_version),
        Err(SyncError::InvalidChange(_))
    ));

    assert!(matches!(
        journal.record("", ChangeOp::Delete),
        Err(SyncError::InvalidChange(_))
    ));

    assert!(journal.changes_since(0).unwrap().is_empty());
    assert!(journal.current_clock().is_empty());
}

#[test]
fn empty_site_id_is_rejected_at_open() {
    assert!(matches!(
        Journal::open_in_memory(""),
        Err(SyncError::InvalidChange(_))
    ));
}

#[test]
fn reopening_is_idempotent_over_an_existing_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.db");

    let journal = Journal::open(&path, "s").unwrap();
    journal.record("e1", ChangeOp::insert_row("{}")).unwrap();
    drop(journal);

    // A second bootstrap over the same store must not clobber anything.
    let journal = Journal::open(&path, "s").unwrap();
    let change = journal.record("e2", ChangeOp::insert_row("{}")).unwrap();
    assert_eq!(change.db_version, 2);
    assert_eq!(change.clock, clock(&[("s", 2)]));
}
