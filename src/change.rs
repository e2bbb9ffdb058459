//! Journal entry value type and its canonical wire encoding.
//!
//! A [`Change`] records one mutation together with its causal metadata. The
//! operation is modeled as a tagged variant so invalid shapes (an update
//! without a column, a delete carrying a payload) cannot be constructed; the
//! wire form is the flat mapping exchanged between replicas.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::SyncError;

/// Default table for entity-level changes.
pub const DEFAULT_TABLE: &str = "entities";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Kind of mutation, encoded as the lowercase tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "insert" => Ok(ChangeType::Insert),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            other => Err(SyncError::InvalidChange(format!(
                "unknown change_type `{other}`"
            ))),
        }
    }
}

/// The mutation itself, with variant-specific required fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    /// A new row. `column` may scope the insert to one column; `value` is the
    /// JSON-encoded payload.
    Insert {
        column: Option<String>,
        value: Option<String>,
    },
    /// A column-level update. The column is required.
    Update {
        column: String,
        value: Option<String>,
    },
    /// A row removal. Carries no column and no payload.
    Delete,
}

impl ChangeOp {
    /// Whole-row insert with a JSON payload.
    pub fn insert_row(value: impl Into<String>) -> Self {
        ChangeOp::Insert {
            column: None,
            value: Some(value.into()),
        }
    }

    /// Column-level update.
    pub fn update_column(column: impl Into<String>, value: impl Into<String>) -> Self {
        ChangeOp::Update {
            column: column.into(),
            value: Some(value.into()),
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeOp::Insert { .. } => ChangeType::Insert,
            ChangeOp::Update { .. } => ChangeType::Update,
            ChangeOp::Delete => ChangeType::Delete,
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            ChangeOp::Insert { column, .. } => column.as_deref(),
            ChangeOp::Update { column, .. } => Some(column),
            ChangeOp::Delete => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            ChangeOp::Insert { value, .. } | ChangeOp::Update { value, .. } => value.as_deref(),
            ChangeOp::Delete => None,
        }
    }

    /// Rebuild the variant from the flat (type, column, value) triplet used
    /// by the wire mapping and the store row, rejecting invalid shapes.
    pub fn from_parts(
        change_type: ChangeType,
        column: Option<String>,
        value: Option<String>,
    ) -> Result<Self, SyncError> {
        match change_type {
            ChangeType::Insert => Ok(ChangeOp::Insert { column, value }),
            ChangeType::Update => match column {
                Some(column) => Ok(ChangeOp::Update { column, value }),
                None => Err(SyncError::InvalidChange(
                    "update requires a column_name".into(),
                )),
            },
            ChangeType::Delete => {
                if column.is_some() || value.is_some() {
                    Err(SyncError::InvalidChange(
                        "delete carries no column_name or value".into(),
                    ))
                } else {
                    Ok(ChangeOp::Delete)
                }
            }
        }
    }
}

/// One journal entry: a mutation plus the causal metadata stamped by the
/// originating replica.
///
/// Identity across replicas is the `(site_id, db_version, entity_id)` triple;
/// `timestamp` is an audit field and is never consulted for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireChange", try_from = "WireChange")]
pub struct Change {
    pub entity_id: String,
    pub table_name: String,
    pub op: ChangeOp,
    pub site_id: String,
    pub db_version: i64,
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl Change {
    pub fn change_type(&self) -> ChangeType {
        self.op.change_type()
    }

    pub fn column_name(&self) -> Option<&str> {
        self.op.column()
    }

    pub fn value(&self) -> Option<&str> {
        self.op.value()
    }

    /// Reject changes that must never enter a journal.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.entity_id.is_empty() {
            return Err(SyncError::InvalidChange("entity_id must not be empty".into()));
        }
        if self.site_id.is_empty() {
            return Err(SyncError::InvalidChange("site_id must not be empty".into()));
        }
        if self.db_version < 1 {
            return Err(SyncError::InvalidChange(format!(
                "db_version must be positive, got {}",
                self.db_version
            )));
        }
        Ok(())
    }
}

/// Canonical flat mapping exchanged between replicas (UTF-8 JSON on the
/// wire, batched as a JSON array).
#[derive(Serialize, Deserialize)]
struct WireChange {
    entity_id: String,
    change_type: ChangeType,
    table_name: String,
    column_name: Option<String>,
    value: Option<String>,
    site_id: String,
    db_version: i64,
    clock: VectorClock,
    #[serde(with = "ts_micros")]
    timestamp: DateTime<Utc>,
}

impl From<Change> for WireChange {
    fn from(c: Change) -> Self {
        WireChange {
            entity_id: c.entity_id.clone(),
            change_type: c.change_type(),
            table_name: c.table_name.clone(),
            column_name: c.column_name().map(str::to_string),
            value: c.value().map(str::to_string),
            site_id: c.site_id,
            db_version: c.db_version,
            clock: c.clock,
            timestamp: c.timestamp,
        }
    }
}

impl TryFrom<WireChange> for Change {
    type Error = SyncError;

    fn try_from(w: WireChange) -> Result<Self, Self::Error> {
        let op = ChangeOp::from_parts(w.change_type, w.column_name, w.value)?;
        let change = Change {
            entity_id: w.entity_id,
            table_name: w.table_name,
            op,
            site_id: w.site_id,
            db_version: w.db_version,
            clock: w.clock,
            timestamp: w.timestamp,
        };
        change.validate()?;
        Ok(change)
    }
}

/// Current UTC time truncated to the journal's microsecond resolution.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Render a timestamp in the canonical encoding (UTC, microseconds).
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a canonical timestamp; offset-less input is taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, SyncError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| SyncError::InvalidChange(format!("bad timestamp `{s}`: {e}")))
}

mod ts_micros {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        super::parse_timestamp(&raw).map_err(D::Error::custom)
    }
}
