use super::{
    Checkpoint, CheckpointStore, ConfigRepository, Error, MappingRepository, ReplicationRepository,
    ReplicationSourceRecord, Result, StreamStatus,
};
use models::{
    ConnectionConfig, InstanceConfig, Mapping, MappingRule, ReconciliationStatus,
    ResourceContainer, ResourceItem, ResourceUri,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An in-process catalog. Tests construct one per case; local tooling may
/// seed it from fixture files.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    instance_configs: HashMap<String, InstanceConfig>,
    database_configs: HashMap<String, ConnectionConfig>,
    /// (id, connected, message) per status update, newest last.
    status_log: Vec<(String, bool, String)>,
    sources: HashMap<String, ReplicationSourceRecord>,
    relationship_statuses: HashMap<String, (StreamStatus, String)>,
    mappings: HashMap<String, Mapping>,
    virtual_containers: Vec<ResourceContainer>,
    virtual_items: Vec<ResourceItem>,
    checkpoints: HashMap<String, Checkpoint>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_instance_config(&self, config: InstanceConfig) {
        let mut inner = self.inner.write().await;
        inner
            .instance_configs
            .insert(config.instance_id.clone(), config);
    }

    pub async fn add_database_config(&self, config: ConnectionConfig) {
        let mut inner = self.inner.write().await;
        inner
            .database_configs
            .insert(config.connection_id.clone(), config);
    }

    pub async fn add_mapping(&self, mapping: Mapping) {
        let mut inner = self.inner.write().await;
        inner.mappings.insert(mapping.id.clone(), mapping);
    }

    /// Insert or replace a virtual container, keyed by its URI.
    pub async fn add_virtual_container(&self, container: ResourceContainer) {
        let mut inner = self.inner.write().await;
        inner.virtual_containers.retain(|c| c.uri != container.uri);
        inner.virtual_containers.push(container);
    }

    /// Insert or replace a virtual item, keyed by its URI.
    pub async fn add_virtual_item(&self, item: ResourceItem) {
        let mut inner = self.inner.write().await;
        inner.virtual_items.retain(|i| i.uri != item.uri);
        inner.virtual_items.push(item);
    }

    /// The recorded (id, connected, message) status updates, oldest first.
    pub async fn status_log(&self) -> Vec<(String, bool, String)> {
        self.inner.read().await.status_log.clone()
    }

    pub async fn relationship_status(&self, relationship_id: &str) -> Option<(StreamStatus, String)> {
        self.inner
            .read()
            .await
            .relationship_statuses
            .get(relationship_id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ConfigRepository for MemoryCatalog {
    async fn get_instance_config(&self, instance_id: &str) -> Result<InstanceConfig> {
        self.inner
            .read()
            .await
            .instance_configs
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "instance config",
                id: instance_id.to_string(),
            })
    }

    async fn get_database_config(&self, database_id: &str) -> Result<ConnectionConfig> {
        self.inner
            .read()
            .await
            .database_configs
            .get(database_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "database config",
                id: database_id.to_string(),
            })
    }

    async fn update_instance_connection_status(
        &self,
        instance_id: &str,
        connected: bool,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .status_log
            .push((instance_id.to_string(), connected, message.to_string()));
        Ok(())
    }

    async fn update_database_connection_status(
        &self,
        database_id: &str,
        connected: bool,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .status_log
            .push((database_id.to_string(), connected, message.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationRepository for MemoryCatalog {
    async fn get_replication_source(
        &self,
        replication_id: &str,
    ) -> Result<ReplicationSourceRecord> {
        self.inner
            .read()
            .await
            .sources
            .get(replication_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "replication source",
                id: replication_id.to_string(),
            })
    }

    async fn create_replication_source(&self, record: ReplicationSourceRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sources.contains_key(&record.replication_id) {
            return Err(Error::Conflict {
                kind: "replication source",
                id: record.replication_id.clone(),
            });
        }
        inner.sources.insert(record.replication_id.clone(), record);
        Ok(())
    }

    async fn remove_replication_source(&self, replication_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .sources
            .remove(replication_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound {
                kind: "replication source",
                id: replication_id.to_string(),
            })
    }

    async fn update_replication_source_status(
        &self,
        replication_id: &str,
        status: StreamStatus,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner.sources.get_mut(replication_id).ok_or_else(|| Error::NotFound {
            kind: "replication source",
            id: replication_id.to_string(),
        })?;
        record.status = status;
        record.status_message = message.to_string();
        Ok(())
    }

    async fn update_relationship_status(
        &self,
        relationship_id: &str,
        status: StreamStatus,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .relationship_statuses
            .insert(relationship_id.to_string(), (status, message.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl MappingRepository for MemoryCatalog {
    async fn get_mapping(&self, mapping_id: &str) -> Result<Mapping> {
        self.inner
            .read()
            .await
            .mappings
            .get(mapping_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "mapping",
                id: mapping_id.to_string(),
            })
    }

    async fn get_mapping_by_name(&self, name: &str) -> Result<Mapping> {
        self.inner
            .read()
            .await
            .mappings
            .values()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "mapping",
                id: name.to_string(),
            })
    }

    async fn rules_for_mapping(&self, mapping_id: &str) -> Result<Vec<MappingRule>> {
        Ok(self.get_mapping(mapping_id).await?.rules)
    }

    async fn list_virtual_containers(&self) -> Result<Vec<ResourceContainer>> {
        Ok(self.inner.read().await.virtual_containers.clone())
    }

    async fn list_virtual_items(&self) -> Result<Vec<ResourceItem>> {
        Ok(self.inner.read().await.virtual_items.clone())
    }

    async fn resolve_template_uris(
        &self,
        uris: &[ResourceUri],
    ) -> Result<Vec<(ResourceUri, ResourceUri)>> {
        let inner = self.inner.read().await;
        let mut resolved = Vec::new();

        for uri in uris {
            let container_hit = inner
                .virtual_containers
                .iter()
                .find(|c| &c.uri == uri)
                .filter(|c| c.reconciliation_status == ReconciliationStatus::Matched)
                .and_then(|c| c.reconciled_uri.clone());
            let item_hit = inner
                .virtual_items
                .iter()
                .find(|i| &i.uri == uri)
                .filter(|i| i.reconciliation_status == ReconciliationStatus::Matched)
                .and_then(|i| i.reconciled_uri.clone());

            if let Some(real) = container_hit.or(item_hit) {
                resolved.push((uri.clone(), real));
            }
        }
        Ok(resolved)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCatalog {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .checkpoints
            .insert(checkpoint.replication_id.clone(), checkpoint);
        Ok(())
    }

    async fn latest(&self, replication_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.inner.read().await.checkpoints.get(replication_id).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{ContainerType, ResourceUri, StoreUri, TemplateUri};

    #[tokio::test]
    async fn template_uris_resolve_only_when_matched() {
        let catalog = MemoryCatalog::new();

        let template =
            ResourceUri::Template(TemplateUri::container("crm", ContainerType::Table, "users"));
        let real = ResourceUri::Store(StoreUri::container(
            "db-1",
            "appdb",
            ContainerType::Table,
            "users",
        ));

        let mut container = ResourceContainer::real(template.clone(), "users", ContainerType::Table);
        container.is_virtual = true;
        container.reconciliation_status = ReconciliationStatus::Pending;
        container.reconciled_uri = None;
        catalog.add_virtual_container(container.clone()).await;

        let resolved = catalog
            .resolve_template_uris(&[template.clone()])
            .await
            .unwrap();
        assert!(resolved.is_empty());

        container.reconciliation_status = ReconciliationStatus::Matched;
        container.reconciled_uri = Some(real.clone());
        catalog.add_virtual_container(container).await;

        let resolved = catalog.resolve_template_uris(&[template.clone()]).await.unwrap();
        assert_eq!(resolved, vec![(template, real)]);
    }

    #[tokio::test]
    async fn checkpoints_keep_the_most_recent_token() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.latest("rep-1").await.unwrap().is_none());

        for (token, at) in [("S1", 10), ("S2", 20)] {
            catalog
                .save(Checkpoint {
                    replication_id: "rep-1".to_string(),
                    token: token.to_string(),
                    saved_at: at,
                })
                .await
                .unwrap();
        }
        let latest = catalog.latest("rep-1").await.unwrap().unwrap();
        assert_eq!(latest.token, "S2");
        assert_eq!(latest.saved_at, 20);
    }
}
