//! Redis adapter: key prefixes as containers, hashes as rows. Redis has
//! no change feed, so every replication call reports the capability gap
//! as a structured error.

use crate::connection::InstanceOperator;
use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::source::{RawEvent, ReplicationSource};
use crate::traits::{
    ContainerSchema, DataOperator, MetadataOperator, ReplicationOperator, RowError, SchemaOperator,
    StreamBatch, StreamRequest, WriteReport,
};
use ::redis::aio::MultiplexedConnection;
use ::redis::{cmd, AsyncCommands};
use models::{
    CdcEvent, CdcMechanism, ConnectionConfig, ContainerType, InstanceConfig, ItemType,
    ReplicationConfig, ResourceContainer, ResourceItem, ResourceUri, Row, StoreType, StoreUri,
    TlsMode, UnifiedModel, UnifiedType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// The reserved row field carrying the key suffix after the container
/// prefix. `users:42` surfaces as row `{key: "42", ...fields}`.
const KEY_FIELD: &str = "key";

/// Keys examined when discovering containers and their field shapes.
const DISCOVER_SCAN_LIMIT: usize = 10_000;

pub struct RedisClient {
    conn: MultiplexedConnection,
    pub(crate) config: ConnectionConfig,
}

impl RedisClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let client = open_client(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            config.database_name.parse().unwrap_or(0),
            config.tls.as_ref().map(|t| t.mode != TlsMode::Disable).unwrap_or(false),
            config.ssl_verify,
        )?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| redis_err("connect", err))?;
        Ok(Self {
            conn,
            config: config.clone(),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| redis_err("ping", err))
    }

    /// Scan keys matching `pattern`, stopping after `limit` keys.
    async fn scan(&self, operation: &'static str, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|err| redis_err(operation, err))?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 || keys.len() >= limit {
                keys.truncate(limit);
                return Ok(keys);
            }
        }
    }

    async fn read_row(&self, operation: &'static str, table: &str, key: &str) -> Result<Row> {
        let mut conn = self.conn();
        let fields: BTreeMap<String, String> = conn
            .hgetall(format!("{table}:{key}"))
            .await
            .map_err(|err| redis_err(operation, err))?;

        let mut row = Map::new();
        row.insert(KEY_FIELD.to_string(), json!(key));
        for (field, value) in fields {
            // Values were written as JSON text where non-string.
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
            row.insert(field, parsed);
        }
        Ok(row)
    }

    async fn write_row(&self, operation: &'static str, table: &str, row: &Row) -> Result<()> {
        let key = row.get(KEY_FIELD).and_then(Value::as_str).ok_or_else(|| {
            Error::invalid_data(
                operation,
                format!("row for '{table}' needs a string '{KEY_FIELD}' field"),
            )
            .with_store(StoreType::Redis)
        })?;

        let mut pipeline = cmd("HSET");
        pipeline.arg(format!("{table}:{key}"));
        let mut has_fields = false;
        for (field, value) in row {
            if field == KEY_FIELD {
                continue;
            }
            has_fields = true;
            pipeline.arg(field);
            match value {
                Value::String(s) => pipeline.arg(s),
                other => pipeline.arg(other.to_string()),
            };
        }
        if !has_fields {
            return Ok(());
        }
        let mut conn = self.conn();
        pipeline
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| redis_err(operation, err))
    }
}

#[derive(Serialize, Deserialize)]
struct RedisCursor {
    scan: u64,
}

#[async_trait::async_trait]
impl DataOperator for RedisClient {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        let keys = self
            .scan("fetch", &format!("{table}:*"), limit as usize)
            .await?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let suffix = key.splitn(2, ':').nth(1).unwrap_or(&key).to_string();
            rows.push(self.read_row("fetch", table, &suffix).await?);
        }
        Ok(rows)
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        _use_transaction: bool,
    ) -> Result<WriteReport> {
        // HSET is a put: re-inserting a key converges on the same hash.
        let mut report = WriteReport::default();
        for (index, row) in rows.iter().enumerate() {
            match self.write_row("insert", table, row).await {
                Ok(()) => report.rows_written += 1,
                Err(err) => report.row_errors.push(RowError {
                    index,
                    message: err.to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        if where_columns != [KEY_FIELD.to_string()] {
            return Err(Error::invalid_data(
                "update",
                format!("redis rows are addressed only by '{KEY_FIELD}'"),
            )
            .with_store(StoreType::Redis));
        }
        for row in rows {
            self.write_row("update", table, row).await?;
        }
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        let suffix = key.get(KEY_FIELD).and_then(Value::as_str).ok_or_else(|| {
            Error::missing_key("delete", format!("delete for '{table}' needs '{KEY_FIELD}'"))
                .with_store(StoreType::Redis)
        })?;
        let mut conn = self.conn();
        let removed: u64 = conn
            .del(format!("{table}:{suffix}"))
            .await
            .map_err(|err| redis_err("delete", err))?;
        Ok(removed)
    }

    async fn execute_query(&self, _statement: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(Error::unsupported(
            StoreType::Redis,
            "execute_query",
            "no SQL surface; use execute_command with a native command",
        ))
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }
        let scan_from = match &req.cursor {
            Some(cursor) => cursor.decode::<RedisCursor>("stream")?.scan,
            None => 0,
        };

        let mut conn = self.conn();
        let (next, keys): (u64, Vec<String>) = cmd("SCAN")
            .arg(scan_from)
            .arg("MATCH")
            .arg(format!("{}:*", req.table))
            .arg("COUNT")
            .arg(req.batch_size)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_err("stream", err))?;

        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let suffix = key.splitn(2, ':').nth(1).unwrap_or(&key).to_string();
            let mut row = self.read_row("stream", &req.table, &suffix).await?;
            if !req.columns.is_empty() {
                row.retain(|field, _| field == KEY_FIELD || req.columns.contains(field));
            }
            rows.push(row);
        }

        let is_complete = next == 0;
        Ok(StreamBatch {
            rows,
            is_complete,
            next_cursor: if is_complete {
                None
            } else {
                Some(Cursor::encode("stream", &RedisCursor { scan: next })?)
            },
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        // Bounded scan; an estimate for large keyspaces.
        let keys = self
            .scan("get_table_row_count", &format!("{table}:*"), DISCOVER_SCAN_LIMIT)
            .await?;
        Ok(keys.len() as u64)
    }
}

#[async_trait::async_trait]
impl SchemaOperator for RedisClient {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let mut model = UnifiedModel::new(
            self.config.connection_id.clone(),
            self.config.database_name.clone(),
        );

        let keys = self.scan("discover_schema", "*", DISCOVER_SCAN_LIMIT).await?;
        let mut prefixes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            if let Some((prefix, suffix)) = key.split_once(':') {
                prefixes
                    .entry(prefix.to_string())
                    .or_default()
                    .push(suffix.to_string());
            }
        }

        for (prefix, suffixes) in prefixes {
            model.containers.push(ResourceContainer::real(
                self.container_uri(&prefix),
                prefix.clone(),
                ContainerType::Table,
            ));

            let mut key_item = ResourceItem::new(
                self.item_uri(&prefix, KEY_FIELD),
                prefix.clone(),
                KEY_FIELD,
                ItemType::Property,
                "string",
                UnifiedType::String,
            )
            .with_primary_key();
            key_item.unique = true;
            model.items.push(key_item);

            // Sample a handful of hashes to learn field names.
            let mut fields: BTreeMap<String, UnifiedType> = BTreeMap::new();
            for suffix in suffixes.iter().take(20) {
                let row = self.read_row("discover_schema", &prefix, suffix).await?;
                for (field, value) in row {
                    if field == KEY_FIELD {
                        continue;
                    }
                    fields.entry(field).or_insert(match value {
                        Value::Number(_) => UnifiedType::Float64,
                        Value::Bool(_) => UnifiedType::Boolean,
                        Value::Array(_) => UnifiedType::Array,
                        Value::Object(_) => UnifiedType::Object,
                        _ => UnifiedType::String,
                    });
                }
            }
            for (field, unified) in fields {
                model.items.push(ResourceItem::new(
                    self.item_uri(&prefix, &field),
                    prefix.clone(),
                    field.clone(),
                    ItemType::Property,
                    "hash-field",
                    unified,
                ));
            }
        }
        Ok(model)
    }

    async fn create_structure(&self, _model: &UnifiedModel) -> Result<()> {
        // Keyspaces materialize on first write; deploying a model is a
        // successful no-op.
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let keys = self.scan("list_tables", "*", DISCOVER_SCAN_LIMIT).await?;
        let mut prefixes: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.split_once(':').map(|(p, _)| p.to_string()))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        Ok(prefixes)
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let model = self.discover_schema().await?;
        let container = model.container(table).cloned().ok_or_else(|| {
            Error::not_found("get_table_schema", format!("no keys under prefix '{table}:'"))
                .with_store(StoreType::Redis)
        })?;
        Ok(ContainerSchema {
            items: model.items_of(table).cloned().collect(),
            container,
        })
    }
}

#[async_trait::async_trait]
impl MetadataOperator for RedisClient {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>> {
        let mut meta = Map::new();
        meta.insert("database_name".to_string(), json!(self.config.database_name));
        meta.insert("version".to_string(), json!(self.get_version().await?));
        meta.insert("key_count".to_string(), json!(self.dbsize().await?));
        Ok(meta)
    }

    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>> {
        let info = self.info("collect_instance_metadata").await?;
        let mut meta = Map::new();
        for field in ["redis_version", "redis_mode", "os", "run_id", "used_memory"] {
            if let Some(value) = info.get(field) {
                meta.insert(field.to_string(), json!(value));
            }
        }
        Ok(meta)
    }

    async fn get_version(&self) -> Result<String> {
        let info = self.info("get_version").await?;
        info.get("redis_version").cloned().ok_or_else(|| {
            Error::invalid_data("get_version", "INFO reply lacks redis_version")
                .with_store(StoreType::Redis)
        })
    }

    async fn get_unique_identifier(&self) -> Result<String> {
        let info = self.info("get_unique_identifier").await?;
        info.get("run_id").cloned().ok_or_else(|| {
            Error::invalid_data("get_unique_identifier", "INFO reply lacks run_id")
                .with_store(StoreType::Redis)
        })
    }

    async fn get_database_size(&self) -> Result<u64> {
        let info = self.info("get_database_size").await?;
        Ok(info
            .get("used_memory")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn get_table_count(&self) -> Result<u64> {
        Ok(self.list_tables().await?.len() as u64)
    }

    async fn execute_command(&self, command: &str) -> Result<Value> {
        let mut parts = command.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(Error::invalid_data("execute_command", "empty command"));
        };
        let mut invocation = cmd(name);
        for arg in parts {
            invocation.arg(arg);
        }
        let mut conn = self.conn();
        let reply: ::redis::Value = invocation
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_err("execute_command", err))?;
        Ok(redis_value_to_json(reply))
    }
}

#[async_trait::async_trait]
impl ReplicationOperator for RedisClient {
    fn is_supported(&self) -> bool {
        false
    }

    fn supported_mechanisms(&self) -> &'static [CdcMechanism] {
        &[]
    }

    async fn check_prerequisites(&self, _config: &ReplicationConfig) -> Result<()> {
        Err(Error::unsupported(
            StoreType::Redis,
            "check_prerequisites",
            "redis exposes no change feed",
        ))
    }

    async fn connect_source(&self, _config: ReplicationConfig) -> Result<ReplicationSource> {
        Err(Error::unsupported(
            StoreType::Redis,
            "connect_source",
            "redis exposes no change feed",
        ))
    }

    fn parse_event(&self, _raw: &RawEvent) -> Result<CdcEvent> {
        Err(Error::unsupported(
            StoreType::Redis,
            "parse_event",
            "redis exposes no change feed",
        ))
    }

    async fn apply_cdc_event(&self, _event: &CdcEvent) -> Result<()> {
        Err(Error::unsupported(
            StoreType::Redis,
            "apply_cdc_event",
            "redis exposes no change feed",
        ))
    }
}

impl RedisClient {
    fn container_uri(&self, prefix: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.config.connection_id,
            &self.config.database_name,
            ContainerType::Table,
            prefix,
        ))
    }

    fn item_uri(&self, prefix: &str, field: &str) -> ResourceUri {
        ResourceUri::Store(
            StoreUri::container(
                &self.config.connection_id,
                &self.config.database_name,
                ContainerType::Table,
                prefix,
            )
            .with_item(ItemType::Property, field),
        )
    }

    async fn dbsize(&self) -> Result<u64> {
        let mut conn = self.conn();
        cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_err("collect_database_metadata", err))
    }

    async fn info(&self, operation: &'static str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.conn();
        let text: String = cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_err(operation, err))?;
        Ok(parse_info(&text))
    }
}

pub struct RedisInstance {
    client: ::redis::Client,
    conn: MultiplexedConnection,
}

impl RedisInstance {
    pub async fn connect(config: &InstanceConfig) -> Result<Self> {
        let client = open_client(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            0,
            config.tls.as_ref().map(|t| t.mode != TlsMode::Disable).unwrap_or(false),
            config.ssl_verify,
        )?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| redis_err("connect_instance", err))?;
        Ok(Self { client, conn })
    }
}

#[async_trait::async_trait]
impl InstanceOperator for RedisInstance {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| redis_err("ping", err))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = cmd("CONFIG")
            .arg("GET")
            .arg("databases")
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_err("list_databases", err))?;
        let count: u64 = reply
            .last()
            .and_then(|v| v.parse().ok())
            .unwrap_or(16);
        Ok((0..count).map(|i| i.to_string()).collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        // Logical databases are fixed numbered slots.
        let _: u64 = name.parse().map_err(|_| {
            Error::configuration("create_database", "redis databases are numeric indexes")
        })?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let index: u64 = name.parse().map_err(|_| {
            Error::configuration("drop_database", "redis databases are numeric indexes")
        })?;
        // A dedicated connection, so SELECT never leaks into shared use.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| redis_err("drop_database", err))?;
        cmd("SELECT")
            .arg(index)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| redis_err("drop_database", err))?;
        cmd("FLUSHDB")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| redis_err("drop_database", err))
    }

    async fn close(&self) {}
}

fn open_client(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    db: i64,
    tls: bool,
    ssl_verify: bool,
) -> Result<::redis::Client> {
    let addr = if tls {
        ::redis::ConnectionAddr::TcpTls {
            host: host.to_string(),
            port,
            insecure: !ssl_verify,
            tls_params: None,
        }
    } else {
        ::redis::ConnectionAddr::Tcp(host.to_string(), port)
    };
    let info = ::redis::ConnectionInfo {
        addr,
        redis: ::redis::RedisConnectionInfo {
            db,
            username: if username.is_empty() {
                None
            } else {
                Some(username.to_string())
            },
            password: if password.is_empty() {
                None
            } else {
                Some(password.to_string())
            },
            ..Default::default()
        },
    };
    ::redis::Client::open(info).map_err(|err| redis_err("connect", err))
}

pub(crate) fn redis_err(operation: &'static str, err: ::redis::RedisError) -> Error {
    let kind = match err.kind() {
        ::redis::ErrorKind::AuthenticationFailed => ErrorKind::Authentication,
        ::redis::ErrorKind::IoError | ::redis::ErrorKind::ClusterDown => ErrorKind::Transient,
        ::redis::ErrorKind::TypeError => ErrorKind::InvalidData,
        ::redis::ErrorKind::InvalidClientConfig => ErrorKind::Configuration,
        _ => ErrorKind::Connection,
    };
    Error::new(kind, operation, err.to_string())
        .with_store(StoreType::Redis)
        .with_source(err)
}

fn redis_value_to_json(value: ::redis::Value) -> Value {
    match value {
        ::redis::Value::Nil => Value::Null,
        ::redis::Value::Int(v) => json!(v),
        ::redis::Value::Data(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(err) => Value::String(base64::encode(err.into_bytes())),
        },
        ::redis::Value::Bulk(values) => {
            Value::Array(values.into_iter().map(redis_value_to_json).collect())
        }
        ::redis::Value::Status(status) => Value::String(status),
        ::redis::Value::Okay => Value::String("OK".to_string()),
    }
}

fn parse_info(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn info_replies_parse_into_fields() {
        let text = "# Server\r\nredis_version:7.2.4\r\nrun_id:abc123\r\n\r\nused_memory:1024\r\n";
        let info = parse_info(text);
        assert_eq!(info.get("redis_version").map(String::as_str), Some("7.2.4"));
        assert_eq!(info.get("run_id").map(String::as_str), Some("abc123"));
        assert_eq!(info.get("used_memory").map(String::as_str), Some("1024"));
    }

    #[test]
    fn replies_convert_to_json() {
        let reply = ::redis::Value::Bulk(vec![
            ::redis::Value::Data(b"users:1".to_vec()),
            ::redis::Value::Int(3),
            ::redis::Value::Nil,
        ]);
        assert_eq!(redis_value_to_json(reply), json!(["users:1", 3, null]));
    }
}
