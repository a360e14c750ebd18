use super::{pg_err, qualified, quote_ident, PostgresClient};
use crate::error::{Error, ErrorKind, Result};
use crate::source::{RawEvent, ReplicationSource, ShardReader};
use crate::traits::{DataOperator, ReplicationOperator};
use models::{CdcEvent, CdcMechanism, CdcOperation, ReplicationConfig, StoreType};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

const MECHANISMS: &[CdcMechanism] = &[CdcMechanism::LogicalReplication];

/// The logical decoding output plugin this adapter consumes.
const PLUGIN: &str = "wal2json";

#[async_trait::async_trait]
impl ReplicationOperator for PostgresClient {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> &'static [CdcMechanism] {
        MECHANISMS
    }

    async fn check_prerequisites(&self, config: &ReplicationConfig) -> Result<()> {
        let wal_level = self
            .client
            .query_one("SHOW wal_level", &[])
            .await
            .map_err(|err| pg_err("check_prerequisites", err))?
            .get::<_, String>(0);
        if wal_level != "logical" {
            return Err(Error::configuration(
                "check_prerequisites",
                format!("wal_level is '{wal_level}', logical replication needs 'logical'"),
            )
            .with_store(StoreType::Postgres));
        }

        let can_replicate = self
            .client
            .query_one(
                "SELECT rolreplication OR rolsuper FROM pg_roles WHERE rolname = current_user",
                &[],
            )
            .await
            .map_err(|err| pg_err("check_prerequisites", err))?
            .get::<_, bool>(0);
        if !can_replicate {
            return Err(Error::configuration(
                "check_prerequisites",
                "current role lacks the REPLICATION attribute",
            )
            .with_store(StoreType::Postgres));
        }

        if config.tables.is_empty() {
            return Err(Error::configuration(
                "check_prerequisites",
                "replication requires at least one table",
            ));
        }
        for table in &config.tables {
            self.check_table_cdc_ready(table).await?;
        }
        Ok(())
    }

    async fn connect_source(&self, config: ReplicationConfig) -> Result<ReplicationSource> {
        self.check_prerequisites(&config).await?;

        let slot = config.slot();
        let publication = config.publication();

        let slot_exists = !self
            .client
            .query(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await
            .map_err(|err| pg_err("connect_source", err))?
            .is_empty();
        if !slot_exists {
            self.client
                .query(
                    "SELECT pg_create_logical_replication_slot($1, $2)",
                    &[&slot, &PLUGIN],
                )
                .await
                .map_err(|err| pg_err("connect_source", err))?;
            tracing::info!(slot = %slot, "created logical replication slot");
        }

        // The publication scopes the captured table set; wal2json itself
        // filters via add-tables, pgoutput consumers use the publication.
        let publication_exists = !self
            .client
            .query(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&publication],
            )
            .await
            .map_err(|err| pg_err("connect_source", err))?
            .is_empty();
        if !publication_exists {
            let tables = config
                .tables
                .iter()
                .map(|t| qualified(t))
                .collect::<Vec<_>>()
                .join(", ");
            self.client
                .execute(
                    &format!("CREATE PUBLICATION {} FOR TABLE {tables}", quote_ident(&publication)),
                    &[],
                )
                .await
                .map_err(|err| pg_err("connect_source", err))?;
        }

        // The reader gets its own session so slot polling never contends
        // with this connection's data operations.
        let (client, conn_task) = self.open_sibling().await?;
        let mut reader = PgShardReader {
            client,
            conn_task,
            slot,
            tables: config.tables.iter().map(|t| format!("public.{t}")).collect(),
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
        let change = raw
            .payload
            .get("change")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                Error::invalid_data("parse_event", "raw event has no wal2json change object")
                    .with_store(StoreType::Postgres)
            })?;

        let action = change.get("action").and_then(Value::as_str).unwrap_or("");
        let operation = match action {
            "I" => CdcOperation::Insert,
            "U" => CdcOperation::Update,
            "D" => CdcOperation::Delete,
            other => {
                return Err(Error::invalid_data(
                    "parse_event",
                    format!("unhandled wal2json action '{other}'"),
                )
                .with_store(StoreType::Postgres));
            }
        };
        let table = change
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::invalid_data("parse_event", "wal2json change names no table")
                    .with_store(StoreType::Postgres)
            })?;

        let mut event = CdcEvent::new(operation, table, parse_pg_timestamp(change));
        event.schema_name = change
            .get("schema")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.data = columns_to_map(change.get("columns"));
        let old = columns_to_map(change.get("identity"));
        if !old.is_empty() {
            event.old_data = Some(old);
        }
        event.lsn = raw
            .payload
            .get("lsn")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.transaction_id = raw
            .payload
            .get("xid")
            .and_then(Value::as_str)
            .map(str::to_string);
        event
            .metadata
            .insert("message_type".to_string(), json!("wal2json"));
        Ok(event)
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<()> {
        let table = &event.table_name;
        let data = transform::strip_metadata(&event.data);
        let pk = self.primary_key_columns(table).await?;

        match event.operation {
            CdcOperation::Insert | CdcOperation::Update => {
                if data.is_empty() {
                    return Err(Error::invalid_data(
                        "apply_cdc_event",
                        format!("{} event for '{table}' carries no row image", event.operation),
                    )
                    .with_store(StoreType::Postgres));
                }
                if !pk.is_empty() {
                    return self.upsert(table, &pk, &data).await;
                }
                match event.operation {
                    CdcOperation::Insert => {
                        self.insert(table, &[data], false).await?;
                        Ok(())
                    }
                    _ => {
                        // Keyless table: replace the old image wholesale.
                        let old =
                            transform::strip_metadata(&event.old_data.clone().unwrap_or_default());
                        if old.is_empty() {
                            return Err(Error::missing_key(
                                "apply_cdc_event",
                                format!("UPDATE of keyless table '{table}' needs old_data"),
                            )
                            .with_store(StoreType::Postgres));
                        }
                        self.delete(table, &old).await?;
                        self.insert(table, &[data], false).await?;
                        Ok(())
                    }
                }
            }
            CdcOperation::Delete => {
                let key = delete_key(event, &pk)?;
                self.delete(table, &key).await?;
                Ok(())
            }
        }
    }
}

impl PostgresClient {
    async fn check_table_cdc_ready(&self, table: &str) -> Result<()> {
        let row = self
            .client
            .query_opt(
                "SELECT relreplident::text FROM pg_class WHERE oid = $1::regclass",
                &[&qualified(table)],
            )
            .await
            .map_err(|err| pg_err("check_prerequisites", err))?;
        let replident = row
            .map(|r| r.get::<_, String>(0))
            .ok_or_else(|| {
                Error::configuration(
                    "check_prerequisites",
                    format!("replicated table '{table}' does not exist"),
                )
                .with_store(StoreType::Postgres)
            })?;

        match replident.as_str() {
            "f" | "i" => Ok(()),
            "d" => {
                if self.primary_key_columns(table).await?.is_empty() {
                    Err(Error::configuration(
                        "check_prerequisites",
                        format!(
                            "table '{table}' has default replica identity but no primary key; \
                             old images of UPDATE/DELETE would be empty",
                        ),
                    )
                    .with_store(StoreType::Postgres))
                } else {
                    Ok(())
                }
            }
            _ => Err(Error::configuration(
                "check_prerequisites",
                format!("table '{table}' has replica identity NOTHING"),
            )
            .with_store(StoreType::Postgres)),
        }
    }

    async fn upsert(&self, table: &str, pk: &[String], data: &Map<String, Value>) -> Result<()> {
        let relation = qualified(table);
        let conflict = pk
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = data
            .keys()
            .filter(|c| !pk.contains(c))
            .map(|c| format!("{c} = EXCLUDED.{c}", c = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let resolution = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {updates}")
        };
        let sql = format!(
            "INSERT INTO {relation} \
             SELECT * FROM json_populate_record(NULL::{relation}, $1::json) \
             ON CONFLICT ({conflict}) {resolution}",
        );
        self.client
            .execute(&sql, &[&Value::Object(data.clone())])
            .await
            .map_err(|err| pg_err("apply_cdc_event", err))?;
        Ok(())
    }
}

/// The delete predicate: old_data when present, else the primary-key
/// columns of the new image, else `MissingKey`.
pub(crate) fn delete_key(event: &CdcEvent, pk: &[String]) -> Result<Map<String, Value>> {
    if let Some(old) = &event.old_data {
        let old = transform::strip_metadata(old);
        if !old.is_empty() {
            return Ok(old);
        }
    }
    let from_data: Map<String, Value> = event
        .data
        .iter()
        .filter(|(name, _)| pk.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if from_data.is_empty() {
        return Err(Error::missing_key(
            "apply_cdc_event",
            format!("DELETE for '{}' carries no identifying columns", event.table_name),
        ));
    }
    Ok(from_data)
}

struct PgShardReader {
    client: tokio_postgres::Client,
    conn_task: JoinHandle<()>,
    slot: String,
    /// schema-qualified names for wal2json's add-tables filter.
    tables: Vec<String>,
}

#[async_trait::async_trait]
impl ShardReader for PgShardReader {
    fn shard_id(&self) -> &str {
        "0"
    }

    async fn seek(&mut self, position: &str) -> Result<()> {
        // pg_replication_slot_advance only moves forward; an older
        // target leaves the slot where it is.
        self.client
            .query(
                "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                &[&self.slot, &position],
            )
            .await
            .map_err(|err| pg_err("seek", err))?;
        Ok(())
    }

    async fn next_batch(&mut self, max_events: usize) -> Result<Vec<RawEvent>> {
        let rows = self
            .client
            .query(
                "SELECT lsn::text, xid::text, data \
                 FROM pg_logical_slot_peek_changes($1, NULL, $2, \
                      'format-version', '2', 'include-timestamp', 'true', 'add-tables', $3)",
                &[&self.slot, &(max_events as i32), &self.tables.join(",")],
            )
            .await
            .map_err(|err| pg_err("next_batch", err))?;

        let mut events = Vec::new();
        for row in rows {
            let lsn: String = row.get(0);
            let xid: String = row.get(1);
            let data: String = row.get(2);

            let change: Value = match serde_json::from_str(&data) {
                Ok(change) => change,
                Err(err) => {
                    tracing::warn!(error = %err, lsn = %lsn, "skipping undecodable wal2json record");
                    continue;
                }
            };
            // Transaction boundary records carry no tuple.
            match change.get("action").and_then(Value::as_str) {
                Some("I" | "U" | "D") => {}
                _ => continue,
            }
            events.push(RawEvent {
                shard_id: "0".to_string(),
                position: lsn.clone(),
                payload: json!({ "lsn": lsn, "xid": xid, "change": change }),
            });
        }
        Ok(events)
    }

    async fn ack(&mut self, position: &str) -> Result<()> {
        self.client
            .query(
                "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                &[&self.slot, &position],
            )
            .await
            .map_err(|err| pg_err("ack", err))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.conn_task.abort();
        Ok(())
    }
}

fn columns_to_map(columns: Option<&Value>) -> Map<String, Value> {
    let mut map = Map::new();
    let Some(columns) = columns.and_then(Value::as_array) else {
        return map;
    };
    for column in columns {
        let (Some(name), Some(value)) = (
            column.get("name").and_then(Value::as_str),
            column.get("value"),
        ) else {
            continue;
        };
        map.insert(name.to_string(), value.clone());
    }
    map
}

fn parse_pg_timestamp(change: &Map<String, Value>) -> i64 {
    let Some(ts) = change.get("timestamp").and_then(Value::as_str) else {
        return 0;
    };
    chrono::DateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wal2json_columns_become_row_maps() {
        let change = json!({
            "action": "U",
            "schema": "public",
            "table": "users",
            "columns": [
                {"name": "id", "type": "integer", "value": 7},
                {"name": "email", "type": "text", "value": "a@b.c"},
            ],
            "identity": [
                {"name": "id", "type": "integer", "value": 7},
            ],
        });
        let data = columns_to_map(change.get("columns"));
        assert_eq!(Value::Object(data), json!({"id": 7, "email": "a@b.c"}));

        let old = columns_to_map(change.get("identity"));
        assert_eq!(Value::Object(old), json!({"id": 7}));
    }

    #[test]
    fn delete_key_prefers_old_data() {
        let mut event = CdcEvent::new(CdcOperation::Delete, "users", 0);
        event.old_data = Some(
            json!({"id": 7, "sequence_number": "S9"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let key = delete_key(&event, &[]).unwrap();
        // Metadata never participates in the predicate.
        assert_eq!(Value::Object(key), json!({"id": 7}));

        // Without old_data, fall back to the primary key of the image.
        event.old_data = None;
        event.data = json!({"id": 8, "name": "Ada"}).as_object().unwrap().clone();
        let key = delete_key(&event, &["id".to_string()]).unwrap();
        assert_eq!(Value::Object(key), json!({"id": 8}));

        // Nothing identifying at all.
        event.data = Map::new();
        let err = delete_key(&event, &["id".to_string()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingKey);
    }

    #[test]
    fn timestamps_parse_from_wal2json() {
        let change = json!({"timestamp": "2023-05-01 10:00:00.5+00"})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(parse_pg_timestamp(&change), 1_682_935_200);
        assert_eq!(parse_pg_timestamp(&Map::new()), 0);
    }
}
