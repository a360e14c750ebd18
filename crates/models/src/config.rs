use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of store types this engine speaks to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Postgres,
    Mongodb,
    Redis,
    Kafka,
    Dynamodb,
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
            Self::Kafka => "kafka",
            Self::Dynamodb => "dynamodb",
        }
    }

    pub const ALL: [StoreType; 5] = [
        Self::Postgres,
        Self::Mongodb,
        Self::Redis,
        Self::Kafka,
        Self::Dynamodb,
    ];
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "postgres" => Self::Postgres,
            "mongodb" => Self::Mongodb,
            "redis" => Self::Redis,
            "kafka" => Self::Kafka,
            "dynamodb" => Self::Dynamodb,
            other => return Err(format!("unknown store type '{other}'")),
        })
    }
}

/// The change-capture mechanisms an adapter may advertise.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CdcMechanism {
    LogicalReplication,
    Binlog,
    ChangeStreams,
    StreamShards,
    TopicOffsets,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TlsConfig {
    pub mode: TlsMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cert: Option<String>,
}

/// Everything needed to open a connection to one logical database.
/// Immutable once a connection is open; changing it requires a reopen.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub connection_id: String,
    pub store_type: StoreType,
    /// Vendor or deployment flavor, e.g. "supabase" or "aws".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Unsealed by the credential front-end before it reaches the engine.
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    pub database_name: String,
    #[serde(default)]
    pub ssl_verify: bool,
}

/// Like `ConnectionConfig`, but scoped to the server or cluster rather
/// than one logical database. Used for administrative operations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub store_type: StoreType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub ssl_verify: bool,
}

/// Configuration of one change stream over an open source connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    pub replication_id: String,
    pub database_id: String,
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<CdcMechanism>,
    /// Replication slot name; derived from the replication ID when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_name: Option<String>,
    /// Publication name; derived from the replication ID when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_name: Option<String>,
    /// Position token to resume from. Unset means the mechanism's tail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<String>,
}

impl ReplicationConfig {
    pub fn new(replication_id: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            replication_id: replication_id.into(),
            database_id: database_id.into(),
            tables: Vec::new(),
            mechanism: None,
            slot_name: None,
            publication_name: None,
            start_position: None,
        }
    }

    /// Slot name: caller-supplied, or derived deterministically from the
    /// replication ID.
    pub fn slot(&self) -> String {
        self.slot_name
            .clone()
            .unwrap_or_else(|| format!("redb_slot_{}", sanitize(&self.replication_id)))
    }

    /// Publication name: caller-supplied or derived.
    pub fn publication(&self) -> String {
        self.publication_name
            .clone()
            .unwrap_or_else(|| format!("redb_pub_{}", sanitize(&self.replication_id)))
    }

    /// Consumer-group style identifier for stream-platform mechanisms.
    pub fn consumer_group(&self) -> String {
        format!("redb-cdc-{}", self.replication_id)
    }
}

// Identifier-safe: lowercase alphanumerics, everything else folded to '_'.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derived_replication_names() {
        let config = ReplicationConfig::new("Rep-01", "db-1");
        assert_eq!(config.slot(), "redb_slot_rep_01");
        assert_eq!(config.publication(), "redb_pub_rep_01");
        assert_eq!(config.consumer_group(), "redb-cdc-Rep-01");

        let config = ReplicationConfig {
            slot_name: Some("custom".to_string()),
            ..config
        };
        assert_eq!(config.slot(), "custom");
    }
}
