use super::values::{item_to_row, json_to_attribute, row_to_item};
use super::{dyn_err, DynamoClient};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::traits::{DataOperator, RowError, StreamBatch, StreamRequest, WriteReport};
use aws_sdk_dynamodb::types::AttributeValue;
use models::{Row, StoreType};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[async_trait::async_trait]
impl DataOperator for DynamoClient {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        let scanned = self
            .client
            .scan()
            .table_name(table)
            .limit(limit as i32)
            .send()
            .await
            .map_err(|err| dyn_err("fetch", err))?;
        Ok(scanned.items().iter().map(item_to_row).collect())
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        _use_transaction: bool,
    ) -> Result<WriteReport> {
        // put_item replaces whole items by key, so re-inserting a row is
        // naturally idempotent; rows are written one at a time with
        // errors attributed by index.
        let mut report = WriteReport::default();
        for (index, row) in rows.iter().enumerate() {
            let outcome = self
                .client
                .put_item()
                .table_name(table)
                .set_item(Some(row_to_item(row)))
                .send()
                .await;
            match outcome {
                Ok(_) => report.rows_written += 1,
                Err(err) => report.row_errors.push(RowError {
                    index,
                    message: dyn_err("insert", err).to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        let key_names = self.key_attributes(table).await?;
        if !where_columns.iter().all(|c| key_names.contains(c)) {
            return Err(Error::invalid_data(
                "update",
                "dynamodb updates address items by their table keys",
            )
            .with_store(StoreType::Dynamodb));
        }
        // Items are replaced wholesale; a partial update reads as a put
        // of the new image.
        let report = self.insert(table, rows, false).await?;
        if let Some(first) = report.row_errors.first() {
            return Err(Error::invalid_data("update", first.message.clone())
                .with_store(StoreType::Dynamodb));
        }
        Ok(report.rows_written)
    }

    async fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        if key.is_empty() {
            return Err(Error::missing_key("delete", "empty delete predicate"));
        }
        let key_names = self.key_attributes(table).await?;
        let mut item_key: HashMap<String, AttributeValue> = HashMap::new();
        for name in &key_names {
            let value = key.get(name).ok_or_else(|| {
                Error::missing_key(
                    "delete",
                    format!("delete for '{table}' is missing key attribute '{name}'"),
                )
                .with_store(StoreType::Dynamodb)
            })?;
            item_key.insert(name.clone(), json_to_attribute(value));
        }
        self.client
            .delete_item()
            .table_name(table)
            .set_key(Some(item_key))
            .send()
            .await
            .map_err(|err| dyn_err("delete", err))?;
        Ok(1)
    }

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let parameters = if params.is_empty() {
            None
        } else {
            Some(params.iter().map(json_to_attribute).collect())
        };
        let executed = self
            .client
            .execute_statement()
            .statement(statement)
            .set_parameters(parameters)
            .send()
            .await
            .map_err(|err| dyn_err("execute_query", err))?;
        Ok(executed.items().iter().map(item_to_row).collect())
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }

        let start_key = match &req.cursor {
            None => None,
            Some(cursor) => {
                let state: Map<String, Value> = cursor.decode("stream")?;
                Some(
                    state
                        .iter()
                        .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                        .collect::<HashMap<_, _>>(),
                )
            }
        };
        let projection = if req.columns.is_empty() {
            None
        } else {
            Some(req.columns.join(", "))
        };

        let scanned = self
            .client
            .scan()
            .table_name(&req.table)
            .limit(req.batch_size as i32)
            .set_exclusive_start_key(start_key)
            .set_projection_expression(projection)
            .send()
            .await
            .map_err(|err| dyn_err("stream", err))?;

        let rows: Vec<Row> = scanned.items().iter().map(item_to_row).collect();
        let next_cursor = match scanned.last_evaluated_key() {
            Some(key) => Some(Cursor::encode("stream", &item_to_row(key))?),
            None => None,
        };
        Ok(StreamBatch {
            is_complete: next_cursor.is_none(),
            rows,
            next_cursor,
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        let described = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|err| dyn_err("get_table_row_count", err))?;
        Ok(described
            .table()
            .and_then(|t| t.item_count())
            .unwrap_or(0) as u64)
    }
}
