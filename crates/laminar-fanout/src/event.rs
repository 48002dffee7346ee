//! Change events carried through the processor.
//!
//! A [`ChangeEvent`] is one row-level change (or one non-row event such as a
//! schema change) produced by an upstream CDC connector. Rows are flat JSON
//! objects keyed by column name, which matches how the CDC connectors render
//! `before`/`after` images.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row image: column name to value.
pub type Row = Map<String, Value>;

/// Ordered partition key values selected from a row.
pub type KeyVector = Vec<Value>;

/// Classification of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Row inserted; the `after` image is authoritative.
    Insert,
    /// Row updated; both images may be present.
    Update,
    /// Row deleted; the `before` image is authoritative.
    Delete,
    /// Schema change. Never partitionable.
    Ddl,
    /// Source heartbeat or other non-row event. Never partitionable.
    Heartbeat,
}

impl ChangeKind {
    /// Returns true for row-level (DML) changes.
    #[must_use]
    pub fn is_dml(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Returns the short code for the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Ddl => "DDL",
            Self::Heartbeat => "HB",
        }
    }
}

/// A single change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The change classification.
    pub kind: ChangeKind,
    /// Fully qualified table name, if the event belongs to a table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Row image before the change (update, delete).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    /// Row image after the change (insert, update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
    /// Source commit timestamp in milliseconds since Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ts_ms: Option<i64>,
    /// Opaque source position (LSN, GTID, binlog offset...) used for offset flushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    /// Intake sequence number, assigned by the processor on submit.
    #[serde(default)]
    pub seq: u64,
}

impl ChangeEvent {
    fn new(kind: ChangeKind, before: Option<Row>, after: Option<Row>) -> Self {
        Self {
            kind,
            table: None,
            before,
            after,
            source_ts_ms: None,
            position: None,
            seq: 0,
        }
    }

    /// Creates an insert event.
    #[must_use]
    pub fn insert(after: Row) -> Self {
        Self::new(ChangeKind::Insert, None, Some(after))
    }

    /// Creates an update event.
    #[must_use]
    pub fn update(before: Row, after: Row) -> Self {
        Self::new(ChangeKind::Update, Some(before), Some(after))
    }

    /// Creates a delete event.
    #[must_use]
    pub fn delete(before: Row) -> Self {
        Self::new(ChangeKind::Delete, Some(before), None)
    }

    /// Creates a schema change event.
    #[must_use]
    pub fn ddl() -> Self {
        Self::new(ChangeKind::Ddl, None, None)
    }

    /// Creates a heartbeat event.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(ChangeKind::Heartbeat, None, None)
    }

    /// Sets the table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the source commit timestamp.
    #[must_use]
    pub fn with_source_ts(mut self, ts_ms: i64) -> Self {
        self.source_ts_ms = Some(ts_ms);
        self
    }

    /// Sets the source position.
    #[must_use]
    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// Returns true for row-level (DML) changes.
    #[must_use]
    pub fn is_dml(&self) -> bool {
        self.kind.is_dml()
    }

    /// Returns the before image if present and non-empty.
    #[must_use]
    pub fn before_row(&self) -> Option<&Row> {
        self.before.as_ref().filter(|row| !row.is_empty())
    }

    /// Returns the after image if present and non-empty.
    #[must_use]
    pub fn after_row(&self) -> Option<&Row> {
        self.after.as_ref().filter(|row| !row.is_empty())
    }
}

/// Builds a [`Row`] from `(column, value)` pairs.
///
/// ```rust
/// use laminar_fanout::event::row;
/// use serde_json::json;
///
/// let r = row([("id", json!(42)), ("name", json!("alice"))]);
/// assert_eq!(r["id"], 42);
/// ```
#[must_use]
pub fn row<K, I>(pairs: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_classification() {
        assert!(ChangeKind::Insert.is_dml());
        assert!(ChangeKind::Update.is_dml());
        assert!(ChangeKind::Delete.is_dml());
        assert!(!ChangeKind::Ddl.is_dml());
        assert!(!ChangeKind::Heartbeat.is_dml());
        assert_eq!(ChangeKind::Update.as_str(), "U");
        assert!(ChangeEvent::delete(row([("id", json!(1))])).is_dml());
        assert!(!ChangeEvent::heartbeat().is_dml());
    }

    #[test]
    fn test_empty_rows_are_absent() {
        let event = ChangeEvent::update(Row::new(), row([("id", json!(1))]));
        assert!(event.before_row().is_none());
        assert_eq!(event.after_row().unwrap()["id"], 1);
    }

    #[test]
    fn test_deserialize_from_json_line() {
        let line = r#"{"kind":"update","table":"public.users","before":{"id":1},"after":{"id":2},"position":"0/16B3748"}"#;
        let event: ChangeEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.table.as_deref(), Some("public.users"));
        assert_eq!(event.before_row().unwrap()["id"], 1);
        assert_eq!(event.after_row().unwrap()["id"], 2);
        assert_eq!(event.position.as_deref(), Some("0/16B3748"));
        assert_eq!(event.seq, 0);
        assert!(event.source_ts_ms.is_none());
    }

    #[test]
    fn test_serialize_skips_absent_fields() {
        let event = ChangeEvent::ddl().with_table("public.users");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "ddl");
        assert!(json.get("before").is_none());
        assert!(json.get("after").is_none());
    }
}
