//! Optional native CRDT accelerator (cr-sqlite).
//!
//! When the cr-sqlite extension is installed, change tracking for domain
//! tables can be delegated to it via the `crsql_*` SQL surface. Nothing in
//! the journal or merger depends on this module; absence of the extension
//! surfaces as [`SyncError::AcceleratorUnavailable`] and the pure path keeps
//! working.

use std::env;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, LoadExtensionGuard, params};
use tracing::debug;

use crate::error::SyncError;

#[cfg(target_os = "macos")]
const EXTENSION_FILE: &str = "crsqlite.dylib";
#[cfg(target_os = "windows")]
const EXTENSION_FILE: &str = "crsqlite.dll";
#[cfg(all(unix, not(target_os = "macos")))]
const EXTENSION_FILE: &str = "crsqlite.so";

/// One row of the `crsql_changes` virtual table, kept opaque: rows are read
/// and re-applied as-is, never interpreted.
#[derive(Debug, Clone)]
pub struct AcceleratorChange {
    pub table: String,
    pub pk: Value,
    pub cid: String,
    pub val: Value,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: Value,
    pub cl: i64,
    pub seq: i64,
}

/// Locate the extension library for the current platform.
///
/// Search order: `CRSQLITE_PATH`, `$HOME/.local/lib`, `/usr/local/lib`,
/// `/usr/lib`.
pub fn extension_path() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(p) = env::var("CRSQLITE_PATH") {
        if !p.is_empty() {
            candidates.push(PathBuf::from(p));
        }
    }
    if let Ok(home) = env::var("HOME") {
        candidates.push(Path::new(&home).join(".local/lib").join(EXTENSION_FILE));
    }
    candidates.push(Path::new("/usr/local/lib").join(EXTENSION_FILE));
    candidates.push(Path::new("/usr/lib").join(EXTENSION_FILE));

    candidates.into_iter().find(|p| p.exists())
}

/// True if the extension library can be found on this host.
pub fn is_available() -> bool {
    extension_path().is_some()
}

/// Load the extension into a connection, searching the standard locations.
pub fn load(conn: &Connection) -> Result<(), SyncError> {
    let path = extension_path().ok_or_else(|| {
        SyncError::AcceleratorUnavailable(format!(
            "{EXTENSION_FILE} not found; set CRSQLITE_PATH to the library location"
        ))
    })?;
    load_from(conn, &path)
}

/// Load the extension from an explicit path.
pub fn load_from(conn: &Connection, path: &Path) -> Result<(), SyncError> {
    unsafe {
        let _guard = LoadExtensionGuard::new(conn)
            .map_err(|e| SyncError::AcceleratorUnavailable(e.to_string()))?;
        conn.load_extension(path, None).map_err(|e| {
            SyncError::AcceleratorUnavailable(format!("failed to load {}: {e}", path.display()))
        })?;
    }
    debug!(path = %path.display(), "crdt accelerator loaded");
    Ok(())
}

/// Enable CRDT tracking for a domain table.
pub fn as_crr(conn: &Connection, table: &str) -> Result<(), SyncError> {
    conn.query_row("SELECT crsql_as_crr(?1)", params![table], |_| Ok(()))?;
    Ok(())
}

/// The extension-assigned site id of this database.
pub fn site_id(conn: &Connection) -> Result<Vec<u8>, SyncError> {
    let id = conn.query_row("SELECT crsql_site_id()", [], |r| r.get(0))?;
    Ok(id)
}

/// The extension-maintained database version.
pub fn db_version(conn: &Connection) -> Result<i64, SyncError> {
    let v = conn.query_row("SELECT crsql_db_version()", [], |r| r.get(0))?;
    Ok(v)
}

/// All accelerator-tracked changes past `since`, ascending.
pub fn changes_since(conn: &Connection, since: i64) -> Result<Vec<AcceleratorChange>, SyncError> {
    let mut stmt = conn.prepare(
        "SELECT \"table\", pk, cid, val, col_version, db_version, site_id, cl, seq
FROM crsql_changes WHERE db_version > ?1 ORDER BY db_version ASC",
    )?;
    let rows = stmt.query_map(params![since], |r| {
        Ok(AcceleratorChange {
            table: r.get(0)?,
            pk: r.get(1)?,
            cid: r.get(2)?,
            val: r.get(3)?,
            col_version: r.get(4)?,
            db_version: r.get(5)?,
            site_id: r.get(6)?,
            cl: r.get(7)?,
            seq: r.get(8)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Re-apply changes pulled from another accelerator-enabled database.
pub fn apply_changes(conn: &Connection, changes: &[AcceleratorChange]) -> Result<(), SyncError> {
    let mut stmt = conn.prepare(
        "INSERT INTO crsql_changes(\"table\", pk, cid, val, col_version, db_version, site_id, cl, seq)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for c in changes {
        stmt.execute(params![
            c.table,
            c.pk,
            c.cid,
            c.val,
            c.col_version,
            c.db_version,
            c.site_id,
            c.cl,
            c.seq,
        ])?;
    }
    Ok(())
}
