//! The connection registry: the process-wide owner of live connections.
//! Constructed at the engine root and passed down; callers receive
//! borrowed handles and must release them through the registry.

use adapters::{Connection, Error, ErrorKind, InstanceConnection, Result};
use catalog::ConfigRepository;
use models::{ConnectionConfig, InstanceConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ConnectionRegistry {
    repository: Arc<dyn ConfigRepository>,
    // Many concurrent lookups, exclusive connect/disconnect. No lock is
    // ever held across a network call: connections are constructed
    // first and inserted after.
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    instances: RwLock<HashMap<String, Arc<InstanceConnection>>>,
}

impl ConnectionRegistry {
    pub fn new(repository: Arc<dyn ConfigRepository>) -> Self {
        Self {
            repository,
            connections: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Open a connection and take ownership of it. A second connect with
    /// the same ID fails; callers wanting the existing handle use `get`.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<Arc<Connection>> {
        let id = config.connection_id.clone();
        if self.connections.read().await.contains_key(&id) {
            return Err(Error::configuration(
                "connect",
                format!("connection '{id}' is already registered"),
            ));
        }

        // Dial outside the lock.
        let connection = match adapters::connect(config).await {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                self.record_status(&id, false, &err.to_string()).await;
                return Err(err);
            }
        };

        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            // Lost a connect race; release the newcomer.
            drop(connections);
            connection.close().await;
            return Err(Error::configuration(
                "connect",
                format!("connection '{id}' is already registered"),
            ));
        }
        connections.insert(id.clone(), connection.clone());
        drop(connections);

        self.record_status(&id, true, "connected").await;
        Ok(connection)
    }

    /// Open a connection from its catalog configuration.
    pub async fn connect_by_id(&self, database_id: &str) -> Result<Arc<Connection>> {
        let config = self
            .repository
            .get_database_config(database_id)
            .await
            .map_err(|err| {
                Error::new(ErrorKind::NotFound, "connect", err.to_string()).with_source(err)
            })?;
        self.connect(config).await
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and forget a connection. Idempotent: unknown IDs succeed.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(connection) = removed {
            connection.close().await;
            self.record_status(connection_id, false, "disconnected").await;
        }
        Ok(())
    }

    /// Ping one connection, recording reachability either way.
    pub async fn ping(&self, connection_id: &str) -> Result<()> {
        let connection = self.get(connection_id).await.ok_or_else(|| {
            Error::not_found("ping", format!("connection '{connection_id}' is not registered"))
        })?;
        match connection.ping().await {
            Ok(()) => {
                self.record_status(connection_id, true, "reachable").await;
                Ok(())
            }
            Err(err) => {
                self.record_status(connection_id, false, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Ping every registered connection.
    pub async fn ping_all(&self) -> Vec<(String, Result<()>)> {
        let ids = self.list().await;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.ping(&id).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    pub async fn connect_instance(
        &self,
        config: InstanceConfig,
    ) -> Result<Arc<InstanceConnection>> {
        let id = config.instance_id.clone();
        if self.instances.read().await.contains_key(&id) {
            return Err(Error::configuration(
                "connect_instance",
                format!("instance connection '{id}' is already registered"),
            ));
        }

        let instance = match adapters::connect_instance(config).await {
            Ok(instance) => Arc::new(instance),
            Err(err) => {
                self.record_instance_status(&id, false, &err.to_string()).await;
                return Err(err);
            }
        };

        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            drop(instances);
            instance.close().await;
            return Err(Error::configuration(
                "connect_instance",
                format!("instance connection '{id}' is already registered"),
            ));
        }
        instances.insert(id.clone(), instance.clone());
        drop(instances);

        self.record_instance_status(&id, true, "connected").await;
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Option<Arc<InstanceConnection>> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn disconnect_instance(&self, instance_id: &str) -> Result<()> {
        let removed = self.instances.write().await.remove(instance_id);
        if let Some(instance) = removed {
            instance.close().await;
            self.record_instance_status(instance_id, false, "disconnected")
                .await;
        }
        Ok(())
    }

    /// Close every connection, for engine shutdown.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.write().await.drain().collect();
        for (id, connection) in connections {
            connection.close().await;
            self.record_status(&id, false, "shutdown").await;
        }
        let instances: Vec<_> = self.instances.write().await.drain().collect();
        for (id, instance) in instances {
            instance.close().await;
            self.record_instance_status(&id, false, "shutdown").await;
        }
    }

    // Status write-backs are best-effort; a catalog hiccup never fails
    // the connection operation itself.
    async fn record_status(&self, id: &str, connected: bool, message: &str) {
        if let Err(err) = self
            .repository
            .update_database_connection_status(id, connected, message)
            .await
        {
            tracing::warn!(connection_id = %id, error = %err, "failed to record connection status");
        }
    }

    async fn record_instance_status(&self, id: &str, connected: bool, message: &str) {
        if let Err(err) = self
            .repository
            .update_instance_connection_status(id, connected, message)
            .await
        {
            tracing::warn!(instance_id = %id, error = %err, "failed to record instance status");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use catalog::MemoryCatalog;

    #[tokio::test]
    async fn lookups_and_disconnects_are_total() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryCatalog::new()));

        assert!(registry.get("missing").await.is_none());
        assert!(registry.list().await.is_empty());
        // Disconnecting an unknown connection is a successful no-op.
        registry.disconnect("missing").await.unwrap();

        let err = registry.ping("missing").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn connect_by_id_requires_a_catalog_entry() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryCatalog::new()));
        let err = registry.connect_by_id("db-unknown").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
