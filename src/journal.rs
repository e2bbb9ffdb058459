//! Persistent per-replica change journal.
//!
//! A [`Journal`] owns one SQLite store holding the causally-ordered change
//! log, the replica's current vector clock, and per-peer sync watermarks.
//! Local mutations advance the clock and mint a per-origin `db_version`;
//! remote changes are applied verbatim and idempotently, keyed on the
//! `(site_id, db_version, entity_id)` identity triple.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, trace, warn};

use crate::change::{Change, ChangeOp, ChangeType, DEFAULT_TABLE, format_timestamp,
    parse_timestamp, timestamp_now};
use crate::clock::VectorClock;
use crate::error::SyncError;

/// Result of applying a remote change. Duplicate delivery is a success, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
}

struct JournalInner {
    conn: Connection,
    clock: VectorClock,
}

/// One replica's change journal, clock, and watermark state.
///
/// All mutating operations serialize through one lock; journal append and
/// clock write commit in a single transaction, so the store is never left
/// half-written.
pub struct Journal {
    site_id: String,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open (or create) a journal store at `path` for the given site.
    ///
    /// Idempotent: over an existing store the persisted clock is read back
    /// and the schema bootstrap is a no-op.
    pub fn open(path: impl AsRef<Path>, site_id: impl Into<String>) -> Result<Self, SyncError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, site_id)
    }

    /// In-memory journal, useful for tests and ephemeral replicas.
    pub fn open_in_memory(site_id: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_connection(Connection::open_in_memory()?, site_id)
    }

    fn with_connection(conn: Connection, site_id: impl Into<String>) -> Result<Self, SyncError> {
        let site_id = site_id.into();
        if site_id.is_empty() {
            return Err(SyncError::InvalidChange("site_id must not be empty".into()));
        }

        Self::init_schema(&conn)?;
        let clock = Self::load_clock(&conn)?;
        debug!(site = %site_id, "journal opened");

        Ok(Self {
            site_id,
            inner: Mutex::new(JournalInner { conn, clock }),
        })
    }

    /// Create required tables and indexes. Safe to call multiple times.
    fn init_schema(conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS changes (
position INTEGER PRIMARY KEY AUTOINCREMENT,
entity_id TEXT NOT NULL,
change_type TEXT NOT NULL CHECK(change_type IN ('insert','update','delete')),
table_name TEXT NOT NULL,
column_name TEXT,
value TEXT,
site_id TEXT NOT NULL,
db_version INTEGER NOT NULL,
clock_json TEXT NOT NULL,
timestamp_iso TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_db_version ON changes(db_version);
CREATE INDEX IF NOT EXISTS idx_changes_entity ON changes(entity_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_changes_identity
ON changes(site_id, db_version, entity_id);

CREATE TABLE IF NOT EXISTS peers (
site_id TEXT PRIMARY KEY,
last_seen_version INTEGER NOT NULL DEFAULT 0,
last_acked_version INTEGER NOT NULL DEFAULT 0,
last_sync_iso TEXT
);

CREATE TABLE IF NOT EXISTS clock (
id INTEGER PRIMARY KEY CHECK (id = 1),
clock_json TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    /// Read the persisted clock, initializing it on a fresh store, and heal
    /// it upward if a crash left it behind the clock implied by the journal
    /// rows.
    fn load_clock(conn: &Connection) -> Result<VectorClock, SyncError> {
        let persisted: Option<String> = conn
            .query_row("SELECT clock_json FROM clock WHERE id = 1", [], |r| r.get(0))
            .optional()?;

        let persisted = match persisted {
            Some(json) => VectorClock::from_json(&json)?,
            None => {
                let empty = VectorClock::new();
                conn.execute(
                    "INSERT INTO clock(id, clock_json) VALUES(1, ?1)",
                    params![empty.to_json()?],
                )?;
                empty
            }
        };

        let mut implied = VectorClock::new();
        let mut stmt = conn.prepare("SELECT clock_json FROM changes")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for row in rows {
            implied = implied.merge(&VectorClock::from_json(&row?)?);
        }

        if persisted.dominates(&implied) {
            return Ok(persisted);
        }

        warn!("persisted clock behind journal rows, healing");
        let healed = persisted.merge(&implied);
        conn.execute(
            "UPDATE clock SET clock_json = ?1 WHERE id = 1",
            params![healed.to_json()?],
        )?;
        Ok(healed)
    }

    /// The site this journal records for.
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a local mutation against the default table.
    pub fn record(&self, entity_id: &str, op: ChangeOp) -> Result<Change, SyncError> {
        self.record_in(DEFAULT_TABLE, entity_id, op)
    }

    /// Record a local mutation: advance the clock for this site, mint the
    /// next per-origin `db_version`, and commit row and clock atomically.
    pub fn record_in(
        &self,
        table_name: &str,
        entity_id: &str,
        op: ChangeOp,
    ) -> Result<Change, SyncError> {
        if entity_id.is_empty() {
            return Err(SyncError::InvalidChange("entity_id must not be empty".into()));
        }

        let mut inner = self.lock();
        let next_clock = inner.clock.increment(&self.site_id);
        let timestamp = timestamp_now();

        let tx = inner.conn.transaction()?;
        // The MAX is scoped to rows this site originated; applied-remote rows
        // keep their origin's numbering and must not perturb ours.
        let db_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(db_version), 0) FROM changes WHERE site_id = ?1",
            params![self.site_id],
            |r| r.get::<_, i64>(0),
        )? + 1;

        tx.execute(
            "INSERT INTO changes
(entity_id, change_type, table_name, column_name, value, site_id, db_version, clock_json, timestamp_iso)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entity_id,
                op.change_type().as_str(),
                table_name,
                op.column(),
                op.value(),
                self.site_id,
                db_version,
                next_clock.to_json()?,
                format_timestamp(&timestamp),
            ],
        )?;
        tx.execute(
            "INSERT INTO clock(id, clock_json) VALUES(1, ?1)
ON CONFLICT(id) DO UPDATE SET clock_json=excluded.clock_json",
            params![next_clock.to_json()?],
        )?;
        tx.commit()?;

        inner.clock = next_clock.clone();
        trace!(site = %self.site_id, db_version, entity = %entity_id, "recorded local change");

        Ok(Change {
            entity_id: entity_id.to_string(),
            table_name: table_name.to_string(),
            op,
            site_id: self.site_id.clone(),
            db_version,
            clock: next_clock,
            timestamp,
        })
    }

    /// Apply a change received from another replica.
    ///
    /// Idempotent: a change whose identity triple is already present is
    /// reported as [`ApplyOutcome::Duplicate`] with no side effects. On
    /// apply, the incoming row is stored verbatim (origin `site_id` and
    /// `db_version` preserved) and the local clock is merged with the
    /// change's clock in the same commit.
    pub fn apply_remote(&self, change: &Change) -> Result<ApplyOutcome, SyncError> {
        change.validate()?;

        let mut inner = self.lock();
        let seen: Option<i64> = inner
            .conn
            .query_row(
                "SELECT 1 FROM changes WHERE entity_id = ?1 AND site_id = ?2 AND db_version = ?3",
                params![change.entity_id, change.site_id, change.db_version],
                |r| r.get(0),
            )
            .optional()?;
        if seen.is_some() {
            trace!(
                origin = %change.site_id,
                db_version = change.db_version,
                entity = %change.entity_id,
                "duplicate remote change skipped"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let merged = inner.clock.merge(&change.clock);

        let tx = inner.conn.transaction()?;
        tx.execute(
            "INSERT INTO changes
(entity_id, change_type, table_name, column_name, value, site_id, db_version, clock_json, timestamp_iso)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                change.entity_id,
                change.change_type().as_str(),
                change.table_name,
                change.column_name(),
                change.value(),
                change.site_id,
                change.db_version,
                change.clock.to_json()?,
                format_timestamp(&change.timestamp),
            ],
        )?;
        tx.execute(
            "INSERT INTO clock(id, clock_json) VALUES(1, ?1)
ON CONFLICT(id) DO UPDATE SET clock_json=excluded.clock_json",
            params![merged.to_json()?],
        )?;
        tx.commit()?;

        inner.clock = merged;
        debug!(
            origin = %change.site_id,
            db_version = change.db_version,
            entity = %change.entity_id,
            "applied remote change"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// All journal rows with `db_version > since`, ascending. Includes both
    /// locally-originated and applied-remote entries.
    pub fn changes_since(&self, since: i64) -> Result<Vec<Change>, SyncError> {
        let inner = self.lock();
        Self::query_changes_since(&inner.conn, since)
    }

    /// `(changes_since(since), current_version())` observed under one lock,
    /// so a peer may take the returned version as its watermark without
    /// losing any change in the snapshot.
    pub fn snapshot_since(&self, since: i64) -> Result<(Vec<Change>, i64), SyncError> {
        let inner = self.lock();
        let changes = Self::query_changes_since(&inner.conn, since)?;
        let version = Self::query_current_version(&inner.conn)?;
        Ok((changes, version))
    }

    fn query_changes_since(conn: &Connection, since: i64) -> Result<Vec<Change>, SyncError> {
        let mut stmt = conn.prepare(
            "SELECT entity_id, change_type, table_name, column_name, value, site_id, db_version, clock_json, timestamp_iso
FROM changes
WHERE db_version > ?1
ORDER BY db_version ASC, position ASC",
        )?;

        type Raw = (
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            i64,
            String,
            String,
        );
        let rows = stmt.query_map(params![since], |r| {
            Ok::<Raw, _>((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (entity_id, change_type, table_name, column, value, site_id, db_version, clock_json, ts) =
                row?;
            let op = ChangeOp::from_parts(ChangeType::parse(&change_type)?, column, value)?;
            out.push(Change {
                entity_id,
                table_name,
                op,
                site_id,
                db_version,
                clock: VectorClock::from_json(&clock_json)?,
                timestamp: parse_timestamp(&ts)?,
            });
        }
        Ok(out)
    }

    /// Highest `db_version` across all journal rows, local and remote.
    pub fn current_version(&self) -> Result<i64, SyncError> {
        let inner = self.lock();
        Self::query_current_version(&inner.conn)
    }

    fn query_current_version(conn: &Connection) -> Result<i64, SyncError> {
        let v = conn.query_row(
            "SELECT COALESCE(MAX(db_version), 0) FROM changes",
            [],
            |r| r.get(0),
        )?;
        Ok(v)
    }

    /// Copy of the current vector clock.
    pub fn current_clock(&self) -> VectorClock {
        self.lock().clock.clone()
    }

    /// Highest `db_version` from `peer` this journal has observed (the pull
    /// cursor). 0 for a peer never seen.
    pub fn peer_watermark(&self, peer: &str) -> Result<i64, SyncError> {
        self.read_peer_column(peer, "last_seen_version")
    }

    /// Advance the pull cursor for `peer`. Writes never go backwards: the
    /// stored value is clamped to `max(existing, version)`.
    pub fn set_peer_watermark(&self, peer: &str, version: i64) -> Result<(), SyncError> {
        self.write_peer_column(peer, "last_seen_version", version)
    }

    /// Highest local `current_version` that `peer` has confirmed receiving
    /// (the outbound cursor). 0 for a peer never pushed to.
    pub fn acked_watermark(&self, peer: &str) -> Result<i64, SyncError> {
        self.read_peer_column(peer, "last_acked_version")
    }

    /// Advance the outbound cursor for `peer`, clamped monotonic like
    /// [`set_peer_watermark`](Self::set_peer_watermark).
    pub fn set_acked_watermark(&self, peer: &str, version: i64) -> Result<(), SyncError> {
        self.write_peer_column(peer, "last_acked_version", version)
    }

    fn read_peer_column(&self, peer: &str, column: &str) -> Result<i64, SyncError> {
        let inner = self.lock();
        let v: Option<i64> = inner
            .conn
            .query_row(
                &format!("SELECT {column} FROM peers WHERE site_id = ?1"),
                params![peer],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0))
    }

    fn write_peer_column(&self, peer: &str, column: &str, version: i64) -> Result<(), SyncError> {
        let inner = self.lock();
        inner.conn.execute(
            &format!(
                "INSERT INTO peers(site_id, {column}, last_sync_iso) VALUES(?1, ?2, ?3)
ON CONFLICT(site_id) DO UPDATE SET
{column} = MAX({column}, excluded.{column}),
last_sync_iso = excluded.last_sync_iso"
            ),
            params![peer, version.max(0), format_timestamp(&timestamp_now())],
        )?;
        Ok(())
    }
}
