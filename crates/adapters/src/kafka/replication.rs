use super::{kafka_err, message_row, KafkaClient};
use crate::error::{Error, Result};
use crate::source::{RawEvent, ReplicationSource, ShardReader};
use crate::traits::ReplicationOperator;
use models::{headers, CdcEvent, CdcMechanism, CdcOperation, ReplicationConfig, StoreType};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::FutureRecord;
use rdkafka::{Message, Offset, TopicPartitionList};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const MECHANISMS: &[CdcMechanism] = &[CdcMechanism::TopicOffsets];
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait::async_trait]
impl ReplicationOperator for KafkaClient {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> &'static [CdcMechanism] {
        MECHANISMS
    }

    async fn check_prerequisites(&self, config: &ReplicationConfig) -> Result<()> {
        if config.tables.is_empty() {
            return Err(Error::configuration(
                "check_prerequisites",
                "replication requires at least one topic",
            ));
        }
        let metadata = self.cluster_metadata("check_prerequisites", None)?;
        let existing: Vec<&str> = metadata.topics().iter().map(|t| t.name()).collect();
        for topic in &config.tables {
            if !existing.contains(&topic.as_str()) {
                return Err(Error::configuration(
                    "check_prerequisites",
                    format!("replicated topic '{topic}' does not exist"),
                )
                .with_store(StoreType::Kafka));
            }
        }
        Ok(())
    }

    async fn connect_source(&self, config: ReplicationConfig) -> Result<ReplicationSource> {
        self.check_prerequisites(&config).await?;

        let offsets = match &config.start_position {
            Some(position) => parse_offsets(position)?,
            None => BTreeMap::new(),
        };
        let mut readers: Vec<Box<dyn ShardReader>> = Vec::new();
        // One worker per topic; partition ordering is preserved within
        // each consumer's assignment.
        for topic in &config.tables {
            let reader = KafkaShardReader::open(self, &config, topic, &offsets)?;
            readers.push(Box::new(reader));
        }

        Ok(ReplicationSource::new(
            config.replication_id.clone(),
            config.database_id.clone(),
            config.tables.clone(),
            config.start_position.clone(),
            readers,
        ))
    }

    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent> {
        let payload = raw.payload.as_object().ok_or_else(|| {
            Error::invalid_data("parse_event", "raw kafka record is not an object")
                .with_store(StoreType::Kafka)
        })?;
        let topic = payload
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::invalid_data("parse_event", "raw kafka record names no topic")
                    .with_store(StoreType::Kafka)
            })?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        // Messages that already carry the canonical shape pass through;
        // anything else is wrapped as an INSERT of the message value.
        if let Ok(event) = serde_json::from_value::<CdcEvent>(value.clone()) {
            return Ok(event);
        }

        let timestamp = payload
            .get("timestamp_ms")
            .and_then(Value::as_i64)
            .map(|ms| ms / 1000)
            .unwrap_or(0);
        let mut event = CdcEvent::new(CdcOperation::Insert, topic, timestamp);
        event.data = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Some(key) = payload.get("key").and_then(Value::as_str) {
            event
                .metadata
                .insert("message_key".to_string(), json!(key));
        }
        event.lsn = Some(raw.position.clone());
        Ok(event)
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<()> {
        // Forwarding wraps the full canonical event and stamps routing
        // headers; the partition key keeps transactions together.
        let payload = serde_json::to_string(event).map_err(|err| {
            Error::invalid_data("apply_cdc_event", "event is not serializable").with_source(err)
        })?;
        let key = event.partition_key().to_string();

        let mut message_headers = OwnedHeaders::new()
            .insert(Header {
                key: headers::OPERATION,
                value: Some(event.operation.as_str()),
            })
            .insert(Header {
                key: headers::TABLE,
                value: Some(&event.table_name),
            })
            .insert(Header {
                key: headers::TIMESTAMP,
                value: Some(&event.timestamp.to_string()),
            })
            .insert(Header {
                key: headers::SOURCE_TYPE,
                value: Some(headers::SOURCE_TYPE_VALUE),
            });
        if let Some(schema) = &event.schema_name {
            message_headers = message_headers.insert(Header {
                key: headers::SCHEMA,
                value: Some(schema),
            });
        }
        if let Some(transaction_id) = &event.transaction_id {
            message_headers = message_headers.insert(Header {
                key: headers::TRANSACTION_ID,
                value: Some(transaction_id),
            });
        }

        let record = FutureRecord::to(&event.table_name)
            .key(&key)
            .payload(&payload)
            .headers(message_headers);
        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(err, _)| kafka_err("apply_cdc_event", err))
    }
}

struct KafkaShardReader {
    topic: String,
    consumer: StreamConsumer,
    /// "topic/partition" -> next offset, merged into position tokens.
    offsets: BTreeMap<String, i64>,
}

impl KafkaShardReader {
    fn open(
        client: &KafkaClient,
        config: &ReplicationConfig,
        topic: &str,
        offsets: &BTreeMap<String, i64>,
    ) -> Result<Self> {
        let per_partition: BTreeMap<i32, i64> = offsets
            .iter()
            .filter_map(|(key, next)| {
                key.strip_prefix(&format!("{topic}/"))
                    .and_then(|p| p.parse().ok())
                    .map(|p: i32| (p, *next))
            })
            .collect();
        // Without a checkpoint the stream starts at the topic's tail.
        let (consumer, _) = client.assigned_consumer(
            "connect_source",
            &config.consumer_group(),
            topic,
            &per_partition,
            Offset::End,
        )?;
        Ok(Self {
            topic: topic.to_string(),
            consumer,
            offsets: offsets.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ShardReader for KafkaShardReader {
    fn shard_id(&self) -> &str {
        &self.topic
    }

    async fn seek(&mut self, position: &str) -> Result<()> {
        let offsets = parse_offsets(position)?;
        let mut assignment = TopicPartitionList::new();
        for (key, next) in &offsets {
            let Some(partition) = key.strip_prefix(&format!("{}/", self.topic)) else {
                continue;
            };
            let partition: i32 = partition.parse().map_err(|_| {
                Error::invalid_data("seek", format!("bad partition in position key '{key}'"))
            })?;
            assignment
                .add_partition_offset(&self.topic, partition, Offset::Offset(*next))
                .map_err(|err| kafka_err("seek", err))?;
        }
        if assignment.count() > 0 {
            self.consumer
                .assign(&assignment)
                .map_err(|err| kafka_err("seek", err))?;
        }
        self.offsets = offsets;
        Ok(())
    }

    async fn next_batch(&mut self, max_events: usize) -> Result<Vec<RawEvent>> {
        let mut events = Vec::new();
        while events.len() < max_events {
            match tokio::time::timeout(POLL_TIMEOUT, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(err)) => return Err(kafka_err("next_batch", err)),
                Ok(Ok(message)) => {
                    let row = message_row(&message);
                    self.offsets.insert(
                        format!("{}/{}", self.topic, message.partition()),
                        message.offset() + 1,
                    );
                    events.push(RawEvent {
                        shard_id: self.topic.clone(),
                        position: encode_offsets(&self.offsets),
                        payload: json!({
                            "topic": self.topic,
                            "partition": message.partition(),
                            "offset": message.offset(),
                            "key": row.get("key"),
                            "value": row.get("value"),
                            "timestamp_ms": row.get("timestamp_ms"),
                        }),
                    });
                }
            }
        }
        Ok(events)
    }

    async fn ack(&mut self, position: &str) -> Result<()> {
        let offsets = parse_offsets(position)?;
        let mut commit = TopicPartitionList::new();
        for (key, next) in &offsets {
            let Some(partition) = key.strip_prefix(&format!("{}/", self.topic)) else {
                continue;
            };
            let Ok(partition) = partition.parse::<i32>() else {
                continue;
            };
            commit
                .add_partition_offset(&self.topic, partition, Offset::Offset(*next))
                .map_err(|err| kafka_err("ack", err))?;
        }
        if commit.count() > 0 {
            self.consumer
                .commit(&commit, rdkafka::consumer::CommitMode::Async)
                .map_err(|err| kafka_err("ack", err))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // The consumer leaves its group on drop.
        Ok(())
    }
}

fn parse_offsets(position: &str) -> Result<BTreeMap<String, i64>> {
    serde_json::from_str(position).map_err(|err| {
        Error::invalid_data("seek", "position is not a topic-offset map").with_source(err)
    })
}

fn encode_offsets(offsets: &BTreeMap<String, i64>) -> String {
    serde_json::to_string(offsets).expect("offset maps always serialize")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn offset_positions_round_trip() {
        let mut offsets = BTreeMap::new();
        offsets.insert("orders/0".to_string(), 41);
        offsets.insert("orders/1".to_string(), 7);

        let token = encode_offsets(&offsets);
        assert_eq!(parse_offsets(&token).unwrap(), offsets);
        assert_eq!(token, "{\"orders/0\":41,\"orders/1\":7}");
    }
}
