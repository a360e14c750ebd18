use super::{pg_err, qualified, quote_ident, values, PostgresClient};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::traits::{DataOperator, RowError, StreamBatch, StreamRequest, WriteReport};
use models::Row;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyset or offset position within one table scan.
#[derive(Serialize, Deserialize)]
struct PgCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keys: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

impl PostgresClient {
    /// Primary-key column names of a table, in index order.
    pub(crate) async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = $1::regclass AND i.indisprimary \
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&qualified(table)],
            )
            .await
            .map_err(|err| pg_err("primary_key_columns", err))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn query_json(&self, operation: &'static str, sql: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> Result<Vec<Row>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(|err| pg_err(operation, err))?;

        rows.iter()
            .map(|row| {
                let value: Value = row.get(0);
                match value {
                    Value::Object(map) => Ok(map),
                    other => Err(Error::invalid_data(
                        operation,
                        format!("expected a row object, got {other}"),
                    )),
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DataOperator for PostgresClient {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT row_to_json(t)::jsonb FROM {} AS t LIMIT {limit}",
            qualified(table),
        );
        self.query_json("fetch", &sql, &[]).await
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        use_transaction: bool,
    ) -> Result<WriteReport> {
        if rows.is_empty() {
            return Ok(WriteReport::default());
        }
        let relation = qualified(table);

        if use_transaction {
            // A single multi-row INSERT is one statement, hence atomic.
            let sql = format!(
                "INSERT INTO {relation} SELECT * FROM json_populate_recordset(NULL::{relation}, $1::json)",
            );
            let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
            let written = self
                .client
                .execute(&sql, &[&payload])
                .await
                .map_err(|err| pg_err("insert", err))?;
            return Ok(WriteReport {
                rows_written: written,
                row_errors: Vec::new(),
            });
        }

        // Row-at-a-time, attributing each failure to its row index.
        let sql = format!(
            "INSERT INTO {relation} SELECT * FROM json_populate_record(NULL::{relation}, $1::json)",
        );
        let mut report = WriteReport::default();
        for (index, row) in rows.iter().enumerate() {
            let payload = Value::Object(row.clone());
            match self.client.execute(&sql, &[&payload]).await {
                Ok(n) => report.rows_written += n,
                Err(err) => report.row_errors.push(RowError {
                    index,
                    message: pg_err("insert", err).to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        if where_columns.is_empty() {
            return Err(Error::missing_key(
                "update",
                "update requires at least one key column",
            ));
        }
        let relation = qualified(table);
        let mut affected = 0;

        for row in rows {
            let (keys, values): (Map<_, _>, Map<_, _>) = row
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .partition(|(k, _)| where_columns.contains(k));

            if keys.len() != where_columns.len() {
                return Err(Error::missing_key(
                    "update",
                    format!("row is missing key columns for {table}"),
                ));
            }
            let assignments = values
                .keys()
                .map(|c| format!("{c} = r.{c}", c = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let predicate = keys
                .keys()
                .map(|c| format!("t.{c} = k.{c}", c = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!(
                "UPDATE {relation} AS t SET {assignments} \
                 FROM json_populate_record(NULL::{relation}, $1::json) AS r, \
                      json_populate_record(NULL::{relation}, $2::json) AS k \
                 WHERE {predicate}",
            );
            affected += self
                .client
                .execute(&sql, &[&Value::Object(values), &Value::Object(keys)])
                .await
                .map_err(|err| pg_err("update", err))?;
        }
        Ok(affected)
    }

    async fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        if key.is_empty() {
            return Err(Error::missing_key("delete", "empty delete predicate"));
        }
        let relation = qualified(table);
        let predicate = key
            .keys()
            .map(|c| format!("t.{c} = k.{c}", c = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "DELETE FROM {relation} AS t \
             USING json_populate_record(NULL::{relation}, $1::json) AS k \
             WHERE {predicate}",
        );
        self.client
            .execute(&sql, &[&Value::Object(key.clone())])
            .await
            .map_err(|err| pg_err("delete", err))
    }

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let head = statement.trim_start().to_ascii_lowercase();
        let is_query = head.starts_with("select") || head.starts_with("with");

        let stmt = self
            .client
            .prepare(statement)
            .await
            .map_err(|err| pg_err("execute_query", err))?;
        let bound = values::bind_params("execute_query", stmt.params(), params)?;
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            bound.iter().map(|b| b.as_ref() as _).collect();

        if !is_query {
            self.client
                .execute(&stmt, &refs)
                .await
                .map_err(|err| pg_err("execute_query", err))?;
            return Ok(Vec::new());
        }

        // Re-wrap queries so every result row arrives as one JSON value,
        // typed by the server.
        let wrapped = format!("SELECT row_to_json(q)::jsonb FROM ({statement}) AS q");
        let stmt = self
            .client
            .prepare(&wrapped)
            .await
            .map_err(|err| pg_err("execute_query", err))?;
        let rows = self
            .client
            .query(&stmt, &refs)
            .await
            .map_err(|err| pg_err("execute_query", err))?;
        rows.iter()
            .map(|row| {
                let value: Value = row.get(0);
                match value {
                    Value::Object(map) => Ok(map),
                    other => Err(Error::invalid_data(
                        "execute_query",
                        format!("expected a row object, got {other}"),
                    )),
                }
            })
            .collect()
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }
        let relation = qualified(&req.table);
        let projection = if req.columns.is_empty() {
            "t.*".to_string()
        } else {
            req.columns
                .iter()
                .map(|c| format!("t.{}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let state = match &req.cursor {
            Some(cursor) => Some(cursor.decode::<PgCursor>("stream")?),
            None => None,
        };
        let pk = self.primary_key_columns(&req.table).await?;

        let (rows, next) = if pk.is_empty() {
            // No primary key: fall back to offset pagination, which this
            // adapter advertises.
            let offset = state.and_then(|s| s.offset).unwrap_or(0);
            let sql = format!(
                "SELECT row_to_json(s)::jsonb FROM (\
                   SELECT {projection} FROM {relation} AS t \
                   ORDER BY t.ctid LIMIT {limit} OFFSET {offset}\
                 ) AS s",
                limit = req.batch_size,
            );
            let rows = self.query_json("stream", &sql, &[]).await?;
            let next = PgCursor {
                keys: None,
                offset: Some(offset + rows.len() as u64),
            };
            (rows, next)
        } else {
            let order = pk
                .iter()
                .map(|c| format!("t.{}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let last_keys = state.and_then(|s| s.keys);

            let rows = match &last_keys {
                None => {
                    let sql = format!(
                        "SELECT row_to_json(s)::jsonb FROM (\
                           SELECT {projection} FROM {relation} AS t \
                           ORDER BY {order} LIMIT {limit}\
                         ) AS s",
                        limit = req.batch_size,
                    );
                    self.query_json("stream", &sql, &[]).await?
                }
                Some(keys) => {
                    let t_row = pk
                        .iter()
                        .map(|c| format!("t.{}", quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let k_row = pk
                        .iter()
                        .map(|c| format!("k.{}", quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "SELECT row_to_json(s)::jsonb FROM (\
                           SELECT {projection} \
                           FROM {relation} AS t, json_populate_record(NULL::{relation}, $1::json) AS k \
                           WHERE ROW({t_row}) > ROW({k_row}) \
                           ORDER BY {order} LIMIT {limit}\
                         ) AS s",
                        limit = req.batch_size,
                    );
                    self.query_json("stream", &sql, &[&Value::Object(keys.clone())])
                        .await?
                }
            };

            // The next cursor carries the key columns of the last row;
            // a projection must therefore include every key column.
            let next_keys = match rows.last() {
                Some(last) if pk.iter().all(|c| last.contains_key(c)) => {
                    let mut keys = Map::new();
                    for c in &pk {
                        keys.insert(c.clone(), last[c].clone());
                    }
                    Some(keys)
                }
                Some(_) => {
                    return Err(Error::configuration(
                        "stream",
                        "projection must include every primary-key column",
                    ));
                }
                None => last_keys,
            };
            (rows, PgCursor { keys: next_keys, offset: None })
        };

        let is_complete = rows.len() < req.batch_size as usize;
        Ok(StreamBatch {
            next_cursor: if is_complete {
                None
            } else {
                Some(Cursor::encode("stream", &next)?)
            },
            rows,
            is_complete,
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        // Planner statistics first; exact count only when unanalyzed.
        let estimate = self
            .client
            .query_one(
                "SELECT reltuples::bigint FROM pg_class WHERE oid = $1::regclass",
                &[&qualified(table)],
            )
            .await
            .map_err(|err| pg_err("get_table_row_count", err))?
            .get::<_, i64>(0);
        if estimate >= 0 {
            return Ok(estimate as u64);
        }
        let exact = self
            .client
            .query_one(&format!("SELECT count(*) FROM {}", qualified(table)), &[])
            .await
            .map_err(|err| pg_err("get_table_row_count", err))?
            .get::<_, i64>(0);
        Ok(exact as u64)
    }
}
