use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Row-level change kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CdcOperation {
    Insert,
    Update,
    Delete,
}

impl CdcOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for CdcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical change event. Every adapter's `parse_event` produces this
/// shape and every adapter's `apply_cdc_event` consumes it; the wire keys
/// of its serialization are fixed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CdcEvent {
    pub operation: CdcOperation,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    /// Unix seconds at which the change was observed.
    pub timestamp: i64,
    /// New row image.
    pub data: Map<String, Value>,
    /// Old row image; informational for UPDATE, the key source for DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Map<String, Value>>,
    /// Source position: LSN, resume token or sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl CdcEvent {
    pub fn new(operation: CdcOperation, table_name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            operation,
            table_name: table_name.into(),
            schema_name: None,
            timestamp,
            data: Map::new(),
            old_data: None,
            lsn: None,
            transaction_id: None,
            metadata: Map::new(),
        }
    }

    /// Partition key used when forwarding to a stream platform:
    /// the transaction ID when present, else the table name.
    pub fn partition_key(&self) -> &str {
        self.transaction_id.as_deref().unwrap_or(&self.table_name)
    }
}

/// Message headers stamped onto CDC events forwarded to a stream platform.
pub mod headers {
    pub const OPERATION: &str = "cdc.operation";
    pub const TABLE: &str = "cdc.table";
    pub const TIMESTAMP: &str = "cdc.timestamp";
    pub const SOURCE_TYPE: &str = "cdc.source_type";
    pub const SCHEMA: &str = "cdc.schema";
    pub const TRANSACTION_ID: &str = "cdc.transaction_id";

    pub const SOURCE_TYPE_VALUE: &str = "redb-cdc";
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_keys_are_stable() {
        let mut event = CdcEvent::new(CdcOperation::Insert, "users", 1_700_000_000);
        event.data.insert("id".to_string(), json!(7));
        event.lsn = Some("S1".to_string());

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(
            wire,
            json!({
                "operation": "INSERT",
                "table_name": "users",
                "timestamp": 1_700_000_000,
                "data": {"id": 7},
                "lsn": "S1",
            }),
        );

        let back: CdcEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn partition_key_prefers_transaction_id() {
        let mut event = CdcEvent::new(CdcOperation::Update, "orders", 0);
        assert_eq!(event.partition_key(), "orders");

        event.transaction_id = Some("txn-9".to_string());
        assert_eq!(event.partition_key(), "txn-9");
    }
}
