use super::{map_to_document, mongo_err, MongoClient};
use crate::error::{Error, Result};
use crate::source::{RawEvent, ReplicationSource, ShardReader};
use crate::traits::ReplicationOperator;
use ::mongodb::bson::{doc, Bson, Document};
use ::mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use ::mongodb::change_stream::ChangeStream;
use ::mongodb::options::{ChangeStreamOptions, FullDocumentType};
use models::{CdcEvent, CdcMechanism, CdcOperation, ReplicationConfig, StoreType};
use serde_json::{json, Map, Value};

const MECHANISMS: &[CdcMechanism] = &[CdcMechanism::ChangeStreams];

#[async_trait::async_trait]
impl ReplicationOperator for MongoClient {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> &'static [CdcMechanism] {
        MECHANISMS
    }

    async fn check_prerequisites(&self, config: &ReplicationConfig) -> Result<()> {
        // Change streams require a replica set (or sharded cluster).
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(|err| mongo_err("check_prerequisites", err))?;
        if hello.get_str("setName").is_err() && hello.get_str("msg").is_err() {
            return Err(Error::configuration(
                "check_prerequisites",
                "change streams require a replica set; this server is standalone",
            )
            .with_store(StoreType::Mongodb));
        }

        if config.tables.is_empty() {
            return Err(Error::configuration(
                "check_prerequisites",
                "replication requires at least one collection",
            ));
        }
        let existing = self
            .database()
            .list_collection_names(None)
            .await
            .map_err(|err| mongo_err("check_prerequisites", err))?;
        for table in &config.tables {
            if !existing.contains(table) {
                return Err(Error::configuration(
                    "check_prerequisites",
                    format!("replicated collection '{table}' does not exist"),
                )
                .with_store(StoreType::Mongodb));
            }
        }
        Ok(())
    }

    async fn connect_source(&self, config: ReplicationConfig) -> Result<ReplicationSource> {
        self.check_prerequisites(&config).await?;

        let mut reader = MongoShardReader {
            database: self.database(),
            collections: config.tables.clone(),
            resume: None,
            stream: None,
        };
        if let Some(position) = &config.start_position {
            reader.seek(position).await?;
        }

        Ok(ReplicationSource::new(
            config.replication_id.clone(),
            config.database_id.clone(),
            config.tables.clone(),
            config.start_position.clone(),
            vec![Box::new(reader)],
        ))
    }

    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent> {
        parse_change_event(raw)
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<()> {
        let collection = self.collection(&event.table_name);
        let data = transform::strip_metadata(&event.data);

        match event.operation {
            CdcOperation::Insert | CdcOperation::Update => {
                let document = map_to_document("apply_cdc_event", &data)?;
                match document.get("_id").cloned() {
                    Some(id) => {
                        // Replace-by-id with upsert: applying the same
                        // event twice converges on the same document.
                        collection
                            .replace_one(
                                doc! { "_id": id },
                                document,
                                ::mongodb::options::ReplaceOptions::builder()
                                    .upsert(true)
                                    .build(),
                            )
                            .await
                            .map_err(|err| mongo_err("apply_cdc_event", err))?;
                    }
                    None => {
                        collection
                            .insert_one(document, None)
                            .await
                            .map_err(|err| mongo_err("apply_cdc_event", err))?;
                    }
                }
                Ok(())
            }
            CdcOperation::Delete => {
                let old = event
                    .old_data
                    .as_ref()
                    .map(transform::strip_metadata)
                    .unwrap_or_default();
                let key = if !old.is_empty() {
                    old
                } else if let Some(id) = data.get("_id") {
                    let mut key = Map::new();
                    key.insert("_id".to_string(), id.clone());
                    key
                } else {
                    return Err(Error::missing_key(
                        "apply_cdc_event",
                        format!("DELETE for '{}' carries no identifying fields", event.table_name),
                    )
                    .with_store(StoreType::Mongodb));
                };
                let filter = map_to_document("apply_cdc_event", &key)?;
                collection
                    .delete_many(filter, None)
                    .await
                    .map_err(|err| mongo_err("apply_cdc_event", err))?;
                Ok(())
            }
        }
    }
}

fn parse_change_event(raw: &RawEvent) -> Result<CdcEvent> {
    let payload = raw.payload.as_object().ok_or_else(|| {
        Error::invalid_data("parse_event", "raw change-stream event is not an object")
            .with_store(StoreType::Mongodb)
    })?;

    let operation_type = payload
        .get("operation_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let operation = match operation_type {
        "insert" => CdcOperation::Insert,
        "update" | "replace" => CdcOperation::Update,
        "delete" => CdcOperation::Delete,
        other => {
            return Err(Error::invalid_data(
                "parse_event",
                format!("unhandled change-stream operation '{other}'"),
            )
            .with_store(StoreType::Mongodb));
        }
    };
    let collection = payload
        .get("collection")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::invalid_data("parse_event", "change-stream event names no collection")
                .with_store(StoreType::Mongodb)
        })?;

    let mut event = CdcEvent::new(
        operation,
        collection,
        payload
            .get("cluster_time")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    );
    event.schema_name = payload
        .get("database")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(Value::Object(full)) = payload.get("full_document") {
        event.data = full.clone();
    }
    if let Some(Value::Object(key)) = payload.get("document_key") {
        if event.data.is_empty() {
            // Deletes carry only the key; surface it as the image.
            event.data = key.clone();
        }
        event.old_data = Some(key.clone());
    }
    event.lsn = payload.get("resume_token").map(|token| token.to_string());
    event
        .metadata
        .insert("message_type".to_string(), json!("change_stream"));
    Ok(event)
}

struct MongoShardReader {
    database: ::mongodb::Database,
    collections: Vec<String>,
    resume: Option<ResumeToken>,
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

impl MongoShardReader {
    async fn ensure_stream(&mut self) -> Result<&mut ChangeStream<ChangeStreamEvent<Document>>> {
        if self.stream.is_none() {
            let pipeline = vec![doc! {
                "$match": { "ns.coll": { "$in": &self.collections } }
            }];
            let options = ChangeStreamOptions::builder()
                .full_document(Some(FullDocumentType::UpdateLookup))
                .resume_after(self.resume.clone())
                .build();
            let stream = self
                .database
                .watch(pipeline, options)
                .await
                .map_err(|err| mongo_err("next_batch", err))?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream was just created"))
    }
}

#[async_trait::async_trait]
impl ShardReader for MongoShardReader {
    fn shard_id(&self) -> &str {
        "0"
    }

    async fn seek(&mut self, position: &str) -> Result<()> {
        let value: Value = serde_json::from_str(position).map_err(|err| {
            Error::invalid_data("seek", "position is not a change-stream resume token")
                .with_source(err)
        })?;
        let bson = Bson::try_from(value).map_err(|err| {
            Error::invalid_data("seek", "position is not BSON-representable").with_source(err)
        })?;
        let token: ResumeToken = ::mongodb::bson::from_bson(bson).map_err(|err| {
            Error::invalid_data("seek", "position does not decode as a resume token")
                .with_source(err)
        })?;
        self.resume = Some(token);
        // The stream is rebuilt from the new token on the next read.
        self.stream = None;
        Ok(())
    }

    async fn next_batch(&mut self, max_events: usize) -> Result<Vec<RawEvent>> {
        self.ensure_stream().await?;
        let stream = self.stream.as_mut().expect("stream exists after ensure");
        let mut events = Vec::new();

        while events.len() < max_events {
            let next = stream
                .next_if_any()
                .await
                .map_err(|err| mongo_err("next_batch", err))?;
            let Some(change) = next else {
                break;
            };
            let token = stream.resume_token().ok_or_else(|| {
                Error::invalid_data("next_batch", "change stream lost its resume token")
            })?;
            let position = serde_json::to_value(&token)
                .map_err(|err| {
                    Error::invalid_data("next_batch", "resume token is not JSON-representable")
                        .with_source(err)
                })?
                .to_string();

            if let Some(raw) = raw_event(&change, &position) {
                events.push(raw);
            }
            // Keep the resume point even when the change was filtered.
            self.resume = Some(token);
        }
        Ok(events)
    }

    async fn ack(&mut self, _position: &str) -> Result<()> {
        // Change streams have no upstream acknowledgement; the resume
        // token alone carries progress.
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

fn raw_event(change: &ChangeStreamEvent<Document>, position: &str) -> Option<RawEvent> {
    let operation_type = match change.operation_type {
        OperationType::Insert => "insert",
        OperationType::Update => "update",
        OperationType::Replace => "replace",
        OperationType::Delete => "delete",
        // DDL and invalidation events do not map to row changes.
        _ => return None,
    };
    let ns = change.ns.as_ref()?;
    let collection = ns.coll.as_ref()?;

    let mut payload = Map::new();
    payload.insert("operation_type".to_string(), json!(operation_type));
    payload.insert("database".to_string(), json!(ns.db));
    payload.insert("collection".to_string(), json!(collection));
    if let Some(key) = &change.document_key {
        payload.insert(
            "document_key".to_string(),
            serde_json::to_value(key).unwrap_or(Value::Null),
        );
    }
    if let Some(full) = &change.full_document {
        payload.insert(
            "full_document".to_string(),
            serde_json::to_value(full).unwrap_or(Value::Null),
        );
    }
    if let Some(cluster_time) = &change.cluster_time {
        payload.insert("cluster_time".to_string(), json!(cluster_time.time as i64));
    }
    payload.insert(
        "resume_token".to_string(),
        serde_json::from_str(position).unwrap_or(Value::String(position.to_string())),
    );

    Some(RawEvent {
        shard_id: "0".to_string(),
        position: position.to_string(),
        payload: Value::Object(payload),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_inserts_from_change_stream_payloads() {
        let raw = RawEvent {
            shard_id: "0".to_string(),
            position: "{\"_data\":\"8263\"}".to_string(),
            payload: json!({
                "operation_type": "insert",
                "database": "appdb",
                "collection": "users",
                "document_key": { "_id": 7 },
                "full_document": { "_id": 7, "name": "Ada" },
                "cluster_time": 1_700_000_000,
                "resume_token": { "_data": "8263" },
            }),
        };
        let event = parse_change_event(&raw).unwrap();
        assert_eq!(event.operation, CdcOperation::Insert);
        assert_eq!(event.table_name, "users");
        assert_eq!(event.schema_name.as_deref(), Some("appdb"));
        assert_eq!(
            Value::Object(event.data.clone()),
            json!({"_id": 7, "name": "Ada"}),
        );
        assert_eq!(event.timestamp, 1_700_000_000);

        // Purity: parsing the same raw event twice yields equal events.
        assert_eq!(parse_change_event(&raw).unwrap(), event);
    }

    #[test]
    fn deletes_surface_the_document_key() {
        let raw = RawEvent {
            shard_id: "0".to_string(),
            position: "{\"_data\":\"8264\"}".to_string(),
            payload: json!({
                "operation_type": "delete",
                "database": "appdb",
                "collection": "users",
                "document_key": { "_id": 7 },
                "resume_token": { "_data": "8264" },
            }),
        };
        let event = parse_change_event(&raw).unwrap();
        assert_eq!(event.operation, CdcOperation::Delete);
        assert_eq!(Value::Object(event.data.clone()), json!({"_id": 7}));
        assert_eq!(
            event.old_data.map(Value::Object),
            Some(json!({"_id": 7})),
        );
    }
}
