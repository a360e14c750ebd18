//! An in-process store speaking the full operator surface. Tests and
//! local tooling use it to drive movement and replication end to end
//! without live databases; its change stream is scripted by the caller.

use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::source::{RawEvent, ReplicationSource, ShardReader};
use crate::traits::{
    ContainerSchema, DataOperator, MetadataOperator, ReplicationOperator, RowError, SchemaOperator,
    StreamBatch, StreamRequest, WriteReport,
};
use models::{
    CdcEvent, CdcMechanism, ContainerType, ItemType, ReplicationConfig, ResourceContainer,
    ResourceItem, ResourceUri, Row, StoreUri, UnifiedModel, UnifiedType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

const MECHANISMS: &[CdcMechanism] = &[CdcMechanism::TopicOffsets];

#[derive(Debug, Clone, Default)]
struct Table {
    primary_key: Vec<String>,
    columns: Vec<(String, UnifiedType)>,
    rows: Vec<Row>,
}

/// The in-memory store. Cheap to construct per test case.
pub struct MemoryStore {
    database_id: String,
    db_name: String,
    tables: Mutex<BTreeMap<String, Table>>,
    events: Mutex<VecDeque<RawEvent>>,
    apply_failures: Mutex<VecDeque<ErrorKind>>,
}

impl MemoryStore {
    pub fn new(database_id: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            db_name: db_name.into(),
            tables: Mutex::new(BTreeMap::new()),
            events: Mutex::new(VecDeque::new()),
            apply_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Create a table with the given primary key and column types.
    pub fn seed_table(
        &self,
        name: impl Into<String>,
        primary_key: &[&str],
        columns: &[(&str, UnifiedType)],
        rows: Vec<Row>,
    ) {
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        tables.insert(
            name.into(),
            Table {
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                columns: columns
                    .iter()
                    .map(|(name, unified)| (name.to_string(), *unified))
                    .collect(),
                rows,
            },
        );
    }

    /// Current rows of a table, for assertions.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .expect("tables lock poisoned")
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Queue a raw change event for the scripted source to emit.
    pub fn push_raw_event(&self, event: RawEvent) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push_back(event);
    }

    /// Make the next `apply_cdc_event` calls fail with the given kinds.
    pub fn push_apply_failure(&self, kind: ErrorKind) {
        self.apply_failures
            .lock()
            .expect("failures lock poisoned")
            .push_back(kind);
    }

    fn container_uri(&self, table: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.database_id,
            &self.db_name,
            ContainerType::Table,
            table,
        ))
    }

    fn item_uri(&self, table: &str, column: &str) -> ResourceUri {
        ResourceUri::Store(
            StoreUri::container(&self.database_id, &self.db_name, ContainerType::Table, table)
                .with_item(ItemType::Column, column),
        )
    }

    fn with_table<T>(
        &self,
        operation: &'static str,
        table: &str,
        f: impl FnOnce(&mut Table) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        let table = tables
            .get_mut(table)
            .ok_or_else(|| Error::not_found(operation, format!("table '{table}' does not exist")))?;
        f(table)
    }
}

#[derive(Serialize, Deserialize)]
struct MemoryCursor {
    index: usize,
}

#[async_trait::async_trait]
impl SchemaOperator for MemoryStore {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        let mut model = UnifiedModel::new(self.database_id.clone(), self.db_name.clone());
        for (name, table) in tables.iter() {
            model.containers.push(ResourceContainer::real(
                self.container_uri(name),
                name.clone(),
                ContainerType::Table,
            ));
            for (column, unified) in &table.columns {
                let mut item = ResourceItem::new(
                    self.item_uri(name, column),
                    name.clone(),
                    column.clone(),
                    ItemType::Column,
                    format!("{unified:?}").to_lowercase(),
                    *unified,
                );
                if table.primary_key.contains(column) {
                    item = item.with_primary_key();
                }
                model.items.push(item);
            }
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        for container in &model.containers {
            let primary_key: Vec<String> = model
                .primary_key_of(&container.name)
                .iter()
                .map(|c| c.to_string())
                .collect();
            let columns: Vec<(String, UnifiedType)> = model
                .items_of(&container.name)
                .map(|i| (i.name.clone(), i.unified_type))
                .collect();

            match tables.get(&container.name) {
                None => {
                    tables.insert(
                        container.name.clone(),
                        Table {
                            primary_key,
                            columns,
                            rows: Vec::new(),
                        },
                    );
                }
                Some(existing) => {
                    // Re-creation is fine; a different key is a conflict.
                    if existing.primary_key != primary_key {
                        return Err(Error::new(
                            ErrorKind::SchemaConflict,
                            "create_structure",
                            format!(
                                "table '{}' exists with key {:?}, model wants {primary_key:?}",
                                container.name, existing.primary_key,
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        Ok(tables.keys().cloned().collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let model = self.discover_schema().await?;
        let container = model
            .container(table)
            .cloned()
            .ok_or_else(|| Error::not_found("get_table_schema", format!("table '{table}'")))?;
        Ok(ContainerSchema {
            items: model.items_of(table).cloned().collect(),
            container,
        })
    }
}

#[async_trait::async_trait]
impl DataOperator for MemoryStore {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        self.with_table("fetch", table, |t| {
            Ok(t.rows.iter().take(limit as usize).cloned().collect())
        })
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        use_transaction: bool,
    ) -> Result<WriteReport> {
        self.with_table("insert", table, |t| {
            let mut report = WriteReport::default();
            let mut staged = Vec::new();
            for (index, row) in rows.iter().enumerate() {
                let duplicate = !t.primary_key.is_empty()
                    && t.rows
                        .iter()
                        .chain(staged.iter())
                        .any(|existing| key_matches(existing, row, &t.primary_key));
                if duplicate {
                    if use_transaction {
                        // Atomic batch: nothing lands.
                        return Ok(WriteReport {
                            rows_written: 0,
                            row_errors: vec![RowError {
                                index,
                                message: "duplicate primary key".to_string(),
                            }],
                        });
                    }
                    report.row_errors.push(RowError {
                        index,
                        message: "duplicate primary key".to_string(),
                    });
                    continue;
                }
                staged.push(row.clone());
            }
            report.rows_written = staged.len() as u64;
            t.rows.extend(staged);
            Ok(report)
        })
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        if where_columns.is_empty() {
            return Err(Error::missing_key("update", "update needs key columns"));
        }
        self.with_table("update", table, |t| {
            let mut affected = 0;
            for row in rows {
                for existing in t.rows.iter_mut() {
                    let matches = where_columns
                        .iter()
                        .all(|c| existing.get(c) == row.get(c) && row.get(c).is_some());
                    if matches {
                        for (column, value) in row {
                            existing.insert(column.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
            }
            Ok(affected)
        })
    }

    async fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        if key.is_empty() {
            return Err(Error::missing_key("delete", "empty delete predicate"));
        }
        self.with_table("delete", table, |t| {
            let before = t.rows.len();
            t.rows.retain(|existing| {
                !key.iter().all(|(column, value)| existing.get(column) == Some(value))
            });
            Ok((before - t.rows.len()) as u64)
        })
    }

    async fn execute_query(&self, _statement: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(Error::new(
            ErrorKind::UnsupportedOperation,
            "execute_query",
            "the in-memory store has no query language",
        ))
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }
        let start = match &req.cursor {
            Some(cursor) => cursor.decode::<MemoryCursor>("stream")?.index,
            None => 0,
        };
        self.with_table("stream", &req.table, |t| {
            let rows: Vec<Row> = t
                .rows
                .iter()
                .skip(start)
                .take(req.batch_size as usize)
                .map(|row| {
                    if req.columns.is_empty() {
                        row.clone()
                    } else {
                        row.iter()
                            .filter(|(c, _)| req.columns.contains(c))
                            .map(|(c, v)| (c.clone(), v.clone()))
                            .collect()
                    }
                })
                .collect();
            let index = start + rows.len();
            let is_complete = index >= t.rows.len();
            Ok(StreamBatch {
                rows,
                is_complete,
                next_cursor: if is_complete {
                    None
                } else {
                    Some(Cursor::encode("stream", &MemoryCursor { index })?)
                },
            })
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        self.with_table("get_table_row_count", table, |t| Ok(t.rows.len() as u64))
    }
}

#[async_trait::async_trait]
impl MetadataOperator for MemoryStore {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>> {
        let mut meta = Map::new();
        meta.insert("database_name".to_string(), json!(self.db_name));
        meta.insert("table_count".to_string(), json!(self.get_table_count().await?));
        Ok(meta)
    }

    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }

    async fn get_version(&self) -> Result<String> {
        Ok("memory".to_string())
    }

    async fn get_unique_identifier(&self) -> Result<String> {
        Ok(format!("memory:{}", self.database_id))
    }

    async fn get_database_size(&self) -> Result<u64> {
        Ok(0)
    }

    async fn get_table_count(&self) -> Result<u64> {
        Ok(self.tables.lock().expect("tables lock poisoned").len() as u64)
    }

    async fn execute_command(&self, _command: &str) -> Result<Value> {
        Ok(Value::Null)
    }
}

#[async_trait::async_trait]
impl ReplicationOperator for MemoryStore {
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
                "replication requires at least one table",
            ));
        }
        Ok(())
    }

    async fn connect_source(&self, config: ReplicationConfig) -> Result<ReplicationSource> {
        self.check_prerequisites(&config).await?;

        // Drain currently-scripted events into the reader's channel.
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut events = self.events.lock().expect("events lock poisoned");
            while let Some(event) = events.pop_front() {
                let _ = tx.send(event);
            }
        }
        let reader = MemoryShardReader {
            rx,
            skip_through: config.start_position.clone(),
        };
        Ok(ReplicationSource::new(
            config.replication_id.clone(),
            config.database_id.clone(),
            config.tables.clone(),
            config.start_position.clone(),
            vec![Box::new(reader)],
        ))
    }

    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent> {
        serde_json::from_value(raw.payload.clone()).map_err(|err| {
            Error::invalid_data("parse_event", "raw event is not a canonical change event")
                .with_source(err)
        })
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<()> {
        if let Some(kind) = self
            .apply_failures
            .lock()
            .expect("failures lock poisoned")
            .pop_front()
        {
            return Err(Error::new(kind, "apply_cdc_event", "injected failure"));
        }

        let data = transform::strip_metadata(&event.data);
        match event.operation {
            models::CdcOperation::Insert | models::CdcOperation::Update => {
                self.with_table("apply_cdc_event", &event.table_name, |t| {
                    if t.primary_key.is_empty() {
                        t.rows.push(data.clone());
                        return Ok(());
                    }
                    // Upsert by primary key.
                    match t
                        .rows
                        .iter_mut()
                        .find(|existing| key_matches(existing, &data, &t.primary_key))
                    {
                        Some(existing) => *existing = data.clone(),
                        None => t.rows.push(data.clone()),
                    }
                    Ok(())
                })
            }
            models::CdcOperation::Delete => {
                let old = event
                    .old_data
                    .as_ref()
                    .map(transform::strip_metadata)
                    .unwrap_or_default();
                let key = if !old.is_empty() { old } else { data };
                if key.is_empty() {
                    return Err(Error::missing_key(
                        "apply_cdc_event",
                        format!("DELETE for '{}' carries no identifying columns", event.table_name),
                    ));
                }
                self.delete(&event.table_name, &key).await.map(|_| ())
            }
        }
    }
}

fn key_matches(a: &Row, b: &Row, primary_key: &[String]) -> bool {
    primary_key
        .iter()
        .all(|c| a.get(c).is_some() && a.get(c) == b.get(c))
}

struct MemoryShardReader {
    rx: mpsc::UnboundedReceiver<RawEvent>,
    /// When set, drop queued events up to and including this position.
    skip_through: Option<String>,
}

#[async_trait::async_trait]
impl ShardReader for MemoryShardReader {
    fn shard_id(&self) -> &str {
        "0"
    }

    async fn seek(&mut self, position: &str) -> Result<()> {
        self.skip_through = Some(position.to_string());
        Ok(())
    }

    async fn next_batch(&mut self, max_events: usize) -> Result<Vec<RawEvent>> {
        let mut events = Vec::new();
        while events.len() < max_events {
            match self.rx.try_recv() {
                Ok(event) => {
                    // Skip scripted events through the seek position; the
                    // position itself is consumed, not re-emitted.
                    if let Some(skip) = self.skip_through.clone() {
                        if event.position == skip {
                            self.skip_through = None;
                        }
                        continue;
                    }
                    events.push(event);
                }
                Err(_) => break,
            }
        }
        Ok(events)
    }

    async fn ack(&mut self, _position: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn discover_create_discover_round_trips() {
        let source = MemoryStore::new("db-src", "appdb");
        source.seed_table(
            "orders",
            &["id"],
            &[
                ("id", UnifiedType::Int32),
                ("amount", UnifiedType::Decimal),
                ("created_at", UnifiedType::Timestamp),
            ],
            vec![],
        );

        let model = source.discover_schema().await.unwrap();
        assert_eq!(model.containers.len(), 1);
        assert_eq!(model.items.len(), 3);

        let target = MemoryStore::new("db-tgt", "appdb");
        target.create_structure(&model).await.unwrap();
        let redeployed = target.discover_schema().await.unwrap();

        assert_eq!(
            redeployed.containers[0].name,
            model.containers[0].name,
        );
        let names: Vec<_> = redeployed.items_of("orders").map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["id", "amount", "created_at"]);
        assert_eq!(redeployed.primary_key_of("orders"), vec!["id"]);

        // Idempotent re-deploy.
        target.create_structure(&model).await.unwrap();

        // An empty model is a successful no-op.
        target
            .create_structure(&UnifiedModel::new("x", "y"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn streaming_returns_the_same_multiset_as_fetch() {
        let store = MemoryStore::new("db", "appdb");
        let rows: Vec<Row> = (0..10)
            .map(|i| row(json!({"id": i, "name": format!("row-{i}")})))
            .collect();
        store.seed_table("users", &["id"], &[("id", UnifiedType::Int64)], rows);

        let mut streamed = Vec::new();
        let mut cursor = None;
        loop {
            let batch = store
                .stream(&StreamRequest {
                    table: "users".to_string(),
                    batch_size: 3,
                    cursor,
                    columns: Vec::new(),
                })
                .await
                .unwrap();
            streamed.extend(batch.rows);
            if batch.is_complete {
                break;
            }
            cursor = batch.next_cursor;
        }
        assert_eq!(streamed, store.fetch("users", 100).await.unwrap());
    }

    #[tokio::test]
    async fn applying_the_same_event_twice_is_idempotent() {
        let store = MemoryStore::new("db", "appdb");
        store.seed_table("users", &["id"], &[("id", UnifiedType::Int64)], vec![]);

        let mut event = CdcEvent::new(models::CdcOperation::Insert, "users", 0);
        event.data = row(json!({"id": 7, "name": "Ada"}));

        store.apply_cdc_event(&event).await.unwrap();
        store.apply_cdc_event(&event).await.unwrap();
        assert_eq!(store.rows("users"), vec![row(json!({"id": 7, "name": "Ada"}))]);

        let mut delete = CdcEvent::new(models::CdcOperation::Delete, "users", 0);
        delete.old_data = Some(row(json!({"id": 7})));
        store.apply_cdc_event(&delete).await.unwrap();
        store.apply_cdc_event(&delete).await.unwrap();
        assert!(store.rows("users").is_empty());
    }

    #[tokio::test]
    async fn transactional_batches_are_atomic() {
        let store = MemoryStore::new("db", "appdb");
        store.seed_table(
            "users",
            &["id"],
            &[("id", UnifiedType::Int64)],
            vec![row(json!({"id": 1}))],
        );

        let batch = vec![row(json!({"id": 2})), row(json!({"id": 1}))];
        let report = store.insert("users", &batch, true).await.unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.row_errors.len(), 1);
        assert_eq!(store.rows("users").len(), 1);

        // Per-row mode lands the good row and attributes the bad one.
        let report = store.insert("users", &batch, false).await.unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.row_errors[0].index, 1);
        assert_eq!(store.rows("users").len(), 2);
    }
}
