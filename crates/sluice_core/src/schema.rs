//! Catalog metadata: tables, sources, materialized views and the reserved
//! system table ids.
//!
//! All of these are plain serde-serializable values; the server's meta
//! controller owns the mutable registry and persists these structs as JSON
//! rows in the `tables` system table.

use serde::{Deserialize, Serialize};

use crate::error::SluiceError;
use crate::types::ColumnType;

/// Name of the built-in system schema.
pub const SYSTEM_SCHEMA: &str = "sys";

// Reserved system table ids. User tables are allocated from
// `USER_TABLE_ID_BASE` so system ranges never collide with them.

/// Per-shard row holding `(last_applied_index, receiver_seq, batch_seq)`.
pub const LAST_LOG_INDEX_RECEIVED_TABLE_ID: u64 = 1;
/// Per-shard staging table for forwarded rows awaiting push processing.
pub const RECEIVER_TABLE_ID: u64 = 2;
/// Per-shard dedup ledger: originator id -> last accepted sequence.
pub const FORWARD_DEDUP_TABLE_ID: u64 = 3;
/// Tombstones for rows planned for deletion if a DDL fails.
pub const TO_DELETE_TABLE_ID: u64 = 4;
/// Persisted catalog rows.
pub const TABLES_TABLE_ID: u64 = 5;
/// Persisted secondary index metadata.
pub const INDEXES_TABLE_ID: u64 = 6;
/// Cluster-wide table id sequence row.
pub const SEQUENCE_TABLE_ID: u64 = 7;
/// First id handed out to user tables, sources, MVs and their internal
/// (partial/full aggregate, index) tables.
pub const USER_TABLE_ID_BASE: u64 = 1000;

/// What kind of object a catalog row describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Source,
    MaterializedView,
    Internal,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Source => "source",
            TableKind::MaterializedView => "materialized_view",
            TableKind::Internal => "internal",
        }
    }
}

/// Core table shape shared by sources, MVs and internal tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: u64,
    pub schema_name: String,
    pub name: String,
    pub primary_key_cols: Vec<usize>,
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
}

impl TableInfo {
    pub fn num_columns(&self) -> usize {
        self.column_types.len()
    }
}

/// How one field of a topic message is encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicEncoding {
    Json,
    /// Protobuf with a registered message name.
    Protobuf(String),
    /// Raw UTF-8 bytes, usually message keys.
    StringBytes,
    /// Raw big-endian 64-bit integer, usually message keys.
    Int64Be,
}

impl TopicEncoding {
    /// Parse an encoding name as written in `CREATE SOURCE ... WITH` options.
    pub fn parse(s: &str) -> Result<TopicEncoding, SluiceError> {
        if let Some(message) = s.strip_prefix("protobuf:") {
            if message.is_empty() {
                return Err(SluiceError::UnknownTopicEncoding(s.to_string()));
            }
            return Ok(TopicEncoding::Protobuf(message.to_string()));
        }
        match s {
            "json" => Ok(TopicEncoding::Json),
            "stringbytes" => Ok(TopicEncoding::StringBytes),
            "int64be" => Ok(TopicEncoding::Int64Be),
            other => Err(SluiceError::UnknownTopicEncoding(other.to_string())),
        }
    }
}

/// Picks one column value out of a decoded topic message.
///
/// A selector is either a metadata key (`meta("key")`, `meta("timestamp")`)
/// or a dotted path into the message value (`customer.id`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSelector {
    pub meta_key: Option<String>,
    pub path: Vec<String>,
}

/// Metadata keys a selector may reference.
pub const SELECTOR_META_KEYS: &[&str] = &["header", "key", "timestamp"];

impl ColumnSelector {
    /// Parse a selector expression as written in source DDL.
    pub fn parse(raw: &str) -> Result<ColumnSelector, SluiceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SluiceError::InvalidSelector(raw.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("meta(") {
            let Some(inner) = rest.strip_suffix(')') else {
                return Err(SluiceError::InvalidSelector(raw.to_string()));
            };
            let key = inner.trim().trim_matches('"');
            if !SELECTOR_META_KEYS.contains(&key) {
                return Err(SluiceError::InvalidSelector(raw.to_string()));
            }
            return Ok(ColumnSelector {
                meta_key: Some(key.to_string()),
                path: Vec::new(),
            });
        }
        let path: Vec<String> = raw.split('.').map(|p| p.trim().to_string()).collect();
        if path.iter().any(|p| p.is_empty()) {
            return Err(SluiceError::InvalidSelector(raw.to_string()));
        }
        Ok(ColumnSelector {
            meta_key: None,
            path,
        })
    }
}

/// Topic binding for a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub broker_name: String,
    pub topic_name: String,
    pub header_encoding: TopicEncoding,
    pub key_encoding: TopicEncoding,
    pub value_encoding: TopicEncoding,
    pub col_selectors: Vec<ColumnSelector>,
    pub properties: std::collections::BTreeMap<String, String>,
}

/// A source table continuously ingested from an external topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub table: TableInfo,
    pub topic: TopicInfo,
}

/// A materialized view maintained by the push pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedViewInfo {
    pub table: TableInfo,
    pub query: String,
    /// Internal tables backing the view (partial/full aggregate state).
    pub internal_table_ids: Vec<u64>,
}

/// One catalog entry as persisted in the `tables` system table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CatalogEntry {
    Source(SourceInfo),
    MaterializedView(MaterializedViewInfo),
}

impl CatalogEntry {
    pub fn table(&self) -> &TableInfo {
        match self {
            CatalogEntry::Source(s) => &s.table,
            CatalogEntry::MaterializedView(mv) => &mv.table,
        }
    }

    pub fn kind(&self) -> TableKind {
        match self {
            CatalogEntry::Source(_) => TableKind::Source,
            CatalogEntry::MaterializedView(_) => TableKind::MaterializedView,
        }
    }
}
