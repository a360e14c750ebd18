//! The narrow read/write contract over the configuration catalog.
//!
//! The engine consumes these traits; it never implements persistent storage
//! itself. `MemoryCatalog` is an in-process implementation used by tests
//! and local tooling.

use models::{
    ConnectionConfig, InstanceConfig, Mapping, MappingRule, ResourceContainer, ResourceItem,
    ResourceUri,
};
use serde::{Deserialize, Serialize};

mod memory;
pub use memory::MemoryCatalog;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} '{id}' not found in catalog")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} '{id}' already exists in catalog")]
    Conflict { kind: &'static str, id: String },
    #[error("catalog storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Repository status of a replication stream record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    Created,
    Active,
    Stopped,
    Failed,
}

/// One replication stream's catalog record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicationSourceRecord {
    pub replication_id: String,
    pub database_id: String,
    pub tables: Vec<String>,
    pub status: StreamStatus,
    #[serde(default)]
    pub status_message: String,
}

/// A persisted checkpoint of one stream's position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub replication_id: String,
    pub token: String,
    /// Unix seconds at which the token was persisted.
    pub saved_at: i64,
}

/// Connection configurations and reachability records.
#[async_trait::async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get_instance_config(&self, instance_id: &str) -> Result<InstanceConfig>;
    async fn get_database_config(&self, database_id: &str) -> Result<ConnectionConfig>;
    async fn update_instance_connection_status(
        &self,
        instance_id: &str,
        connected: bool,
        message: &str,
    ) -> Result<()>;
    async fn update_database_connection_status(
        &self,
        database_id: &str,
        connected: bool,
        message: &str,
    ) -> Result<()>;
}

/// Replication stream records and relationship status.
#[async_trait::async_trait]
pub trait ReplicationRepository: Send + Sync {
    async fn get_replication_source(&self, replication_id: &str)
        -> Result<ReplicationSourceRecord>;
    async fn create_replication_source(&self, record: ReplicationSourceRecord) -> Result<()>;
    async fn remove_replication_source(&self, replication_id: &str) -> Result<()>;
    async fn update_replication_source_status(
        &self,
        replication_id: &str,
        status: StreamStatus,
        message: &str,
    ) -> Result<()>;
    async fn update_relationship_status(
        &self,
        relationship_id: &str,
        status: StreamStatus,
        message: &str,
    ) -> Result<()>;
}

/// Mapping definitions and the virtual-resource inventory which the
/// resolver reconciles template URIs against.
#[async_trait::async_trait]
pub trait MappingRepository: Send + Sync {
    async fn get_mapping(&self, mapping_id: &str) -> Result<Mapping>;
    async fn get_mapping_by_name(&self, name: &str) -> Result<Mapping>;
    async fn rules_for_mapping(&self, mapping_id: &str) -> Result<Vec<MappingRule>>;
    async fn list_virtual_containers(&self) -> Result<Vec<ResourceContainer>>;
    async fn list_virtual_items(&self) -> Result<Vec<ResourceItem>>;
    /// Resolve template URIs to the real URIs their resources reconciled
    /// to. URIs still pending reconciliation are absent from the result.
    async fn resolve_template_uris(
        &self,
        uris: &[ResourceUri],
    ) -> Result<Vec<(ResourceUri, ResourceUri)>>;
}

/// Durable checkpoint tokens, persisted atomically per replication ID.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;
    async fn latest(&self, replication_id: &str) -> Result<Option<Checkpoint>>;
}
