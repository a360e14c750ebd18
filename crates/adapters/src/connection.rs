use crate::capabilities::{capabilities, Capabilities};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{DataOperator, MetadataOperator, ReplicationOperator, SchemaOperator};
use crate::{dynamo, kafka, mongo, postgres, redis};
use models::{ConnectionConfig, InstanceConfig, StoreType};
use std::sync::atomic::{AtomicBool, Ordering};

/// The tagged holder of a native client. Operator facets are obtained by
/// pattern match on the variant; there is no type-erased storage and no
/// per-call downcast.
pub enum StoreClient {
    Postgres(postgres::PostgresClient),
    Mongo(mongo::MongoClient),
    Redis(redis::RedisClient),
    Kafka(kafka::KafkaClient),
    Dynamo(dynamo::DynamoClient),
}

/// A live client to a single logical database, identified by the
/// caller-supplied connection ID. Owned by the connection registry from
/// `connect` until `close`.
pub struct Connection {
    config: ConnectionConfig,
    connected: AtomicBool,
    client: StoreClient,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .finish()
    }
}

/// Open a connection per the config, dispatching on its store type.
pub async fn connect(config: ConnectionConfig) -> Result<Connection> {
    let client = match config.store_type {
        StoreType::Postgres => {
            StoreClient::Postgres(postgres::PostgresClient::connect(&config).await?)
        }
        StoreType::Mongodb => StoreClient::Mongo(mongo::MongoClient::connect(&config).await?),
        StoreType::Redis => StoreClient::Redis(redis::RedisClient::connect(&config).await?),
        StoreType::Kafka => StoreClient::Kafka(kafka::KafkaClient::connect(&config).await?),
        StoreType::Dynamodb => StoreClient::Dynamo(dynamo::DynamoClient::connect(&config).await?),
    };
    tracing::info!(
        connection_id = %config.connection_id,
        store_type = %config.store_type,
        host = %config.host,
        "opened connection",
    );
    Ok(Connection {
        config,
        connected: AtomicBool::new(true),
        client,
    })
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.config.connection_id
    }

    pub fn store_type(&self) -> StoreType {
        self.config.store_type
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &'static Capabilities {
        capabilities(self.config.store_type)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn ping(&self) -> Result<()> {
        self.require_open("ping")?;
        match &self.client {
            StoreClient::Postgres(c) => c.ping().await,
            StoreClient::Mongo(c) => c.ping().await,
            StoreClient::Redis(c) => c.ping().await,
            StoreClient::Kafka(c) => c.ping().await,
            StoreClient::Dynamo(c) => c.ping().await,
        }
    }

    /// Close the connection and release the native client. Idempotent;
    /// operator calls after close fail with `ConnectionError`.
    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.client {
            StoreClient::Postgres(c) => c.close().await,
            StoreClient::Mongo(c) => c.close().await,
            StoreClient::Redis(_) | StoreClient::Kafka(_) | StoreClient::Dynamo(_) => {
                // Released on drop.
            }
        }
        tracing::info!(connection_id = %self.config.connection_id, "closed connection");
    }

    pub fn schema(&self) -> Result<&dyn SchemaOperator> {
        self.require_open("schema_operator")?;
        Ok(match &self.client {
            StoreClient::Postgres(c) => c,
            StoreClient::Mongo(c) => c,
            StoreClient::Redis(c) => c,
            StoreClient::Kafka(c) => c,
            StoreClient::Dynamo(c) => c,
        })
    }

    pub fn data(&self) -> Result<&dyn DataOperator> {
        self.require_open("data_operator")?;
        Ok(match &self.client {
            StoreClient::Postgres(c) => c,
            StoreClient::Mongo(c) => c,
            StoreClient::Redis(c) => c,
            StoreClient::Kafka(c) => c,
            StoreClient::Dynamo(c) => c,
        })
    }

    pub fn metadata(&self) -> Result<&dyn MetadataOperator> {
        self.require_open("metadata_operator")?;
        Ok(match &self.client {
            StoreClient::Postgres(c) => c,
            StoreClient::Mongo(c) => c,
            StoreClient::Redis(c) => c,
            StoreClient::Kafka(c) => c,
            StoreClient::Dynamo(c) => c,
        })
    }

    pub fn replication(&self) -> Result<&dyn ReplicationOperator> {
        self.require_open("replication_operator")?;
        Ok(match &self.client {
            StoreClient::Postgres(c) => c,
            StoreClient::Mongo(c) => c,
            StoreClient::Redis(c) => c,
            StoreClient::Kafka(c) => c,
            StoreClient::Dynamo(c) => c,
        })
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::new(
                ErrorKind::Connection,
                operation,
                format!("connection '{}' is closed", self.config.connection_id),
            )
            .with_store(self.config.store_type));
        }
        Ok(())
    }
}

/// Administrative operations scoped to a server or cluster rather than
/// one logical database.
#[async_trait::async_trait]
pub trait InstanceOperator: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn list_databases(&self) -> Result<Vec<String>>;
    async fn create_database(&self, name: &str) -> Result<()>;
    async fn drop_database(&self, name: &str) -> Result<()>;
    async fn close(&self);
}

pub enum InstanceClient {
    Postgres(postgres::PostgresInstance),
    Mongo(mongo::MongoInstance),
    Redis(redis::RedisInstance),
}

/// A live client to a server or cluster, for administrative operations.
pub struct InstanceConnection {
    config: InstanceConfig,
    connected: AtomicBool,
    client: InstanceClient,
}

/// Open an instance-scoped connection. Stores without logical databases
/// reject this with `UnsupportedOperation`.
pub async fn connect_instance(config: InstanceConfig) -> Result<InstanceConnection> {
    let client = match config.store_type {
        StoreType::Postgres => {
            InstanceClient::Postgres(postgres::PostgresInstance::connect(&config).await?)
        }
        StoreType::Mongodb => InstanceClient::Mongo(mongo::MongoInstance::connect(&config).await?),
        StoreType::Redis => InstanceClient::Redis(redis::RedisInstance::connect(&config).await?),
        StoreType::Kafka | StoreType::Dynamodb => {
            return Err(Error::unsupported(
                config.store_type,
                "connect_instance",
                "store has no logical databases",
            ));
        }
    };
    Ok(InstanceConnection {
        config,
        connected: AtomicBool::new(true),
        client,
    })
}

impl InstanceConnection {
    pub fn id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn store_type(&self) -> StoreType {
        self.config.store_type
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn ops(&self) -> Result<&dyn InstanceOperator> {
        if !self.is_connected() {
            return Err(Error::new(
                ErrorKind::Connection,
                "instance_operator",
                format!("instance connection '{}' is closed", self.config.instance_id),
            )
            .with_store(self.config.store_type));
        }
        Ok(match &self.client {
            InstanceClient::Postgres(c) => c,
            InstanceClient::Mongo(c) => c,
            InstanceClient::Redis(c) => c,
        })
    }

    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.client {
            InstanceClient::Postgres(c) => InstanceOperator::close(c).await,
            InstanceClient::Mongo(c) => InstanceOperator::close(c).await,
            InstanceClient::Redis(c) => InstanceOperator::close(c).await,
        }
    }
}
