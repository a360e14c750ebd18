//! Kafka adapter: topics as containers. Movement produces and consumes
//! JSON messages; replication both sources a topic's offsets and, as a
//! target, forwards canonical CDC events with `cdc.*` headers.

mod replication;

use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{
    ContainerSchema, DataOperator, MetadataOperator, RowError, SchemaOperator, StreamBatch,
    StreamRequest, WriteReport,
};
use models::{
    ConnectionConfig, ContainerType, ItemType, ResourceContainer, ResourceItem, ResourceUri, Row,
    StoreType, StoreUri, TlsMode, UnifiedModel, UnifiedType,
};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct KafkaClient {
    pub(crate) producer: FutureProducer,
    pub(crate) config: ConnectionConfig,
}

impl KafkaClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let producer: FutureProducer = client_config(config)
            .create()
            .map_err(|err| kafka_err("connect", err))?;

        let client = Self {
            producer,
            config: config.clone(),
        };
        // Force a metadata round trip so bad brokers fail at connect.
        client.cluster_metadata("connect", None)?;
        Ok(client)
    }

    pub async fn ping(&self) -> Result<()> {
        self.cluster_metadata("ping", None).map(|_| ())
    }

    pub(crate) fn cluster_metadata(
        &self,
        operation: &'static str,
        topic: Option<&str>,
    ) -> Result<rdkafka::metadata::Metadata> {
        self.producer
            .client()
            .fetch_metadata(topic, METADATA_TIMEOUT)
            .map_err(|err| kafka_err(operation, err))
    }

    /// A consumer assigned to every partition of `topic`, positioned
    /// per `offsets`; partitions without an entry start at
    /// `default_offset`.
    pub(crate) fn assigned_consumer(
        &self,
        operation: &'static str,
        group: &str,
        topic: &str,
        offsets: &BTreeMap<i32, i64>,
        default_offset: Offset,
    ) -> Result<(StreamConsumer, Vec<i32>)> {
        let metadata = self.cluster_metadata(operation, Some(topic))?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        if partitions.is_empty() {
            return Err(Error::not_found(operation, format!("topic '{topic}' does not exist"))
                .with_store(StoreType::Kafka));
        }

        let consumer: StreamConsumer = client_config(&self.config)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|err| kafka_err(operation, err))?;

        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            let offset = match offsets.get(partition) {
                Some(next) => Offset::Offset(*next),
                None => default_offset,
            };
            assignment
                .add_partition_offset(topic, *partition, offset)
                .map_err(|err| kafka_err(operation, err))?;
        }
        consumer
            .assign(&assignment)
            .map_err(|err| kafka_err(operation, err))?;
        Ok((consumer, partitions))
    }
}

fn client_config(config: &ConnectionConfig) -> ClientConfig {
    let mut kafka = ClientConfig::new();
    kafka.set(
        "bootstrap.servers",
        format!("{}:{}", config.host, config.port),
    );
    kafka.set("client.id", "redb-relay");

    let tls = config
        .tls
        .as_ref()
        .map(|t| t.mode != TlsMode::Disable)
        .unwrap_or(false);
    match (tls, !config.username.is_empty()) {
        (true, true) => {
            kafka.set("security.protocol", "sasl_ssl");
        }
        (true, false) => {
            kafka.set("security.protocol", "ssl");
        }
        (false, true) => {
            kafka.set("security.protocol", "sasl_plaintext");
        }
        (false, false) => {}
    }
    if !config.username.is_empty() {
        kafka.set("sasl.mechanisms", "PLAIN");
        kafka.set("sasl.username", &config.username);
        kafka.set("sasl.password", &config.password);
    }
    if tls && !config.ssl_verify {
        kafka.set("enable.ssl.certificate.verification", "false");
    }
    kafka
}

#[derive(Serialize, Deserialize, Default)]
struct KafkaCursor {
    /// partition -> next offset to read.
    offsets: BTreeMap<i32, i64>,
}

#[async_trait::async_trait]
impl SchemaOperator for KafkaClient {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let mut model = UnifiedModel::new(
            self.config.connection_id.clone(),
            self.config.database_name.clone(),
        );
        for topic in self.list_tables().await? {
            model.containers.push(ResourceContainer::real(
                self.topic_uri(&topic),
                topic.clone(),
                ContainerType::Topic,
            ));
            // Topics are schemaless; the stable shape is the envelope.
            model.items.push(
                ResourceItem::new(
                    self.envelope_uri(&topic, "key"),
                    topic.clone(),
                    "key",
                    ItemType::Field,
                    "bytes",
                    UnifiedType::String,
                )
                .with_primary_key(),
            );
            model.items.push(ResourceItem::new(
                self.envelope_uri(&topic, "value"),
                topic.clone(),
                "value",
                ItemType::Field,
                "bytes",
                UnifiedType::Json,
            ));
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        // Topic creation is an administrative concern; deployment only
        // verifies the targets exist (auto-creation aside).
        let existing = self.list_tables().await?;
        for container in &model.containers {
            if matches!(
                container.container_type,
                ContainerType::Topic | ContainerType::Stream
            ) && !existing.contains(&container.name)
            {
                return Err(Error::new(
                    ErrorKind::SchemaConflict,
                    "create_structure",
                    format!("topic '{}' does not exist on the cluster", container.name),
                )
                .with_store(StoreType::Kafka));
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let metadata = self.cluster_metadata("list_tables", None)?;
        let mut topics: Vec<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .filter(|name| !name.starts_with("__"))
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let model = self.discover_schema().await?;
        let container = model.container(table).cloned().ok_or_else(|| {
            Error::not_found("get_table_schema", format!("topic '{table}' does not exist"))
                .with_store(StoreType::Kafka)
        })?;
        Ok(ContainerSchema {
            items: model.items_of(table).cloned().collect(),
            container,
        })
    }
}

#[async_trait::async_trait]
impl DataOperator for KafkaClient {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        let batch = self
            .stream(&StreamRequest {
                table: table.to_string(),
                batch_size: limit,
                cursor: None,
                columns: Vec::new(),
            })
            .await?;
        Ok(batch.rows)
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        _use_transaction: bool,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        for (index, row) in rows.iter().enumerate() {
            let key = row
                .get("key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default();
            let payload = match row.get("value") {
                Some(value) => value.to_string(),
                None => Value::Object(row.clone()).to_string(),
            };
            let record = FutureRecord::to(table).key(&key).payload(&payload);
            match self.producer.send(record, METADATA_TIMEOUT).await {
                Ok(_) => report.rows_written += 1,
                Err((err, _)) => report.row_errors.push(RowError {
                    index,
                    message: kafka_err("insert", err).to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn update(&self, _table: &str, _rows: &[Row], _where: &[String]) -> Result<u64> {
        Err(Error::unsupported(
            StoreType::Kafka,
            "update",
            "topics are append-only; produce a new message instead",
        ))
    }

    async fn delete(&self, _table: &str, _key: &Row) -> Result<u64> {
        Err(Error::unsupported(
            StoreType::Kafka,
            "delete",
            "topics are append-only; produce a tombstone instead",
        ))
    }

    async fn execute_query(&self, _statement: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(Error::unsupported(
            StoreType::Kafka,
            "execute_query",
            "no SQL surface over topics",
        ))
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }
        let mut state = match &req.cursor {
            Some(cursor) => cursor.decode::<KafkaCursor>("stream")?,
            None => KafkaCursor::default(),
        };

        let (consumer, partitions) = self.assigned_consumer(
            "stream",
            &format!("redb-stream-{}", self.config.connection_id),
            &req.table,
            &state.offsets,
            Offset::Beginning,
        )?;

        let mut rows = Vec::new();
        while rows.len() < req.batch_size as usize {
            match tokio::time::timeout(POLL_TIMEOUT, consumer.recv()).await {
                Err(_) => break,
                Ok(Err(err)) => return Err(kafka_err("stream", err)),
                Ok(Ok(message)) => {
                    rows.push(message_row(&message));
                    state
                        .offsets
                        .insert(message.partition(), message.offset() + 1);
                }
            }
        }

        // Complete once every partition has reached its high watermark.
        let mut is_complete = true;
        for partition in partitions {
            let (_, high) = consumer
                .fetch_watermarks(&req.table, partition, METADATA_TIMEOUT)
                .map_err(|err| kafka_err("stream", err))?;
            if state.offsets.get(&partition).copied().unwrap_or(0) < high {
                is_complete = false;
                break;
            }
        }
        Ok(StreamBatch {
            rows,
            is_complete,
            next_cursor: if is_complete {
                None
            } else {
                Some(Cursor::encode("stream", &state)?)
            },
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        let metadata = self.cluster_metadata("get_table_row_count", Some(table))?;
        let consumer: StreamConsumer = client_config(&self.config)
            .set("group.id", format!("redb-count-{}", self.config.connection_id))
            .create()
            .map_err(|err| kafka_err("get_table_row_count", err))?;

        let mut total: u64 = 0;
        for topic in metadata.topics().iter().filter(|t| t.name() == table) {
            for partition in topic.partitions() {
                let (low, high) = consumer
                    .fetch_watermarks(table, partition.id(), METADATA_TIMEOUT)
                    .map_err(|err| kafka_err("get_table_row_count", err))?;
                total += (high - low).max(0) as u64;
            }
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl MetadataOperator for KafkaClient {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>> {
        let metadata = self.cluster_metadata("collect_database_metadata", None)?;
        let mut meta = Map::new();
        meta.insert(
            "topic_count".to_string(),
            json!(metadata
                .topics()
                .iter()
                .filter(|t| !t.name().starts_with("__"))
                .count()),
        );
        meta.insert("broker_count".to_string(), json!(metadata.brokers().len()));
        Ok(meta)
    }

    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>> {
        let metadata = self.cluster_metadata("collect_instance_metadata", None)?;
        let brokers: Vec<Value> = metadata
            .brokers()
            .iter()
            .map(|b| json!(format!("{}:{}", b.host(), b.port())))
            .collect();
        let mut meta = Map::new();
        meta.insert("brokers".to_string(), Value::Array(brokers));
        meta.insert(
            "controller_id".to_string(),
            json!(metadata.orig_broker_id()),
        );
        Ok(meta)
    }

    async fn get_version(&self) -> Result<String> {
        // Brokers do not expose a version over the metadata API.
        Ok("apache-kafka".to_string())
    }

    async fn get_unique_identifier(&self) -> Result<String> {
        let metadata = self.cluster_metadata("get_unique_identifier", None)?;
        let mut brokers: Vec<String> = metadata
            .brokers()
            .iter()
            .map(|b| format!("{}:{}", b.host(), b.port()))
            .collect();
        brokers.sort();
        Ok(brokers.join(","))
    }

    async fn get_database_size(&self) -> Result<u64> {
        Err(Error::unsupported(
            StoreType::Kafka,
            "get_database_size",
            "log segment sizes are not exposed to clients",
        ))
    }

    async fn get_table_count(&self) -> Result<u64> {
        Ok(self.list_tables().await?.len() as u64)
    }

    async fn execute_command(&self, _command: &str) -> Result<Value> {
        Err(Error::unsupported(
            StoreType::Kafka,
            "execute_command",
            "no administrative command surface",
        ))
    }
}

impl KafkaClient {
    fn topic_uri(&self, topic: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.config.connection_id,
            &self.config.database_name,
            ContainerType::Topic,
            topic,
        ))
    }

    fn envelope_uri(&self, topic: &str, field: &str) -> ResourceUri {
        ResourceUri::Store(
            StoreUri::container(
                &self.config.connection_id,
                &self.config.database_name,
                ContainerType::Topic,
                topic,
            )
            .with_item(ItemType::Field, field),
        )
    }
}

/// One consumed message as a row: its key, decoded value and position.
pub(crate) fn message_row(message: &rdkafka::message::BorrowedMessage<'_>) -> Row {
    let mut row = Map::new();
    row.insert(
        "key".to_string(),
        message
            .key()
            .map(|k| Value::String(String::from_utf8_lossy(k).to_string()))
            .unwrap_or(Value::Null),
    );
    let value = message
        .payload()
        .map(|p| {
            serde_json::from_slice(p)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(p).to_string()))
        })
        .unwrap_or(Value::Null);
    row.insert("value".to_string(), value);
    row.insert("partition".to_string(), json!(message.partition()));
    row.insert("offset".to_string(), json!(message.offset()));
    if let Some(ms) = message.timestamp().to_millis() {
        row.insert("timestamp_ms".to_string(), json!(ms));
    }
    row
}

pub(crate) fn kafka_err(operation: &'static str, err: rdkafka::error::KafkaError) -> Error {
    use rdkafka::types::RDKafkaErrorCode;

    let kind = match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::SaslAuthenticationFailed | RDKafkaErrorCode::Authentication) => {
            ErrorKind::Authentication
        }
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            ErrorKind::NotFound
        }
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => ErrorKind::Transient,
        _ => ErrorKind::Connection,
    };
    Error::new(kind, operation, err.to_string())
        .with_store(StoreType::Kafka)
        .with_source(err)
}
