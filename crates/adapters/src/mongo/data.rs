use super::{document_to_map, map_to_document, mongo_err, MongoClient};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::traits::{DataOperator, RowError, StreamBatch, StreamRequest, WriteReport};
use ::mongodb::bson::{doc, Bson, Document};
use ::mongodb::error::ErrorKind as MongoKind;
use ::mongodb::options::{FindOptions, InsertManyOptions};
use futures::TryStreamExt;
use models::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize)]
struct MongoCursor {
    /// Extended-JSON `_id` of the last document served.
    last_id: Value,
}

#[async_trait::async_trait]
impl DataOperator for MongoClient {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>> {
        let options = FindOptions::builder().limit(limit as i64).build();
        let documents: Vec<Document> = self
            .collection(table)
            .find(None, options)
            .await
            .map_err(|err| mongo_err("fetch", err))?
            .try_collect()
            .await
            .map_err(|err| mongo_err("fetch", err))?;
        documents
            .iter()
            .map(|d| document_to_map("fetch", d))
            .collect()
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
        let documents = rows
            .iter()
            .map(|row| map_to_document("insert", row))
            .collect::<Result<Vec<_>>>()?;

        if use_transaction {
            let mut session = self
                .client
                .start_session(None)
                .await
                .map_err(|err| mongo_err("insert", err))?;
            session
                .start_transaction(None)
                .await
                .map_err(|err| mongo_err("insert", err))?;
            let outcome = self
                .collection(table)
                .insert_many_with_session(documents.clone(), None, &mut session)
                .await;
            match outcome {
                Ok(result) => {
                    session
                        .commit_transaction()
                        .await
                        .map_err(|err| mongo_err("insert", err))?;
                    return Ok(WriteReport {
                        rows_written: result.inserted_ids.len() as u64,
                        row_errors: Vec::new(),
                    });
                }
                Err(err) => {
                    let _ = session.abort_transaction().await;
                    return Err(mongo_err("insert", err));
                }
            }
        }

        // Unordered bulk write keeps going past bad documents and
        // reports each failure with its index.
        let options = InsertManyOptions::builder().ordered(false).build();
        match self.collection(table).insert_many(documents, options).await {
            Ok(result) => Ok(WriteReport {
                rows_written: result.inserted_ids.len() as u64,
                row_errors: Vec::new(),
            }),
            Err(err) => match err.kind.as_ref() {
                MongoKind::BulkWrite(failure) => {
                    let row_errors: Vec<RowError> = failure
                        .write_errors
                        .iter()
                        .flatten()
                        .map(|e| RowError {
                            index: e.index,
                            message: e.message.clone(),
                        })
                        .collect();
                    Ok(WriteReport {
                        rows_written: rows.len() as u64 - row_errors.len() as u64,
                        row_errors,
                    })
                }
                _ => Err(mongo_err("insert", err)),
            },
        }
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        if where_columns.is_empty() {
            return Err(Error::missing_key(
                "update",
                "update requires at least one key column",
            ));
        }
        let mut affected = 0;

        for row in rows {
            let document = map_to_document("update", row)?;
            let mut filter = Document::new();
            let mut updates = Document::new();
            for (key, value) in document {
                if where_columns.contains(&key) {
                    filter.insert(key, value);
                } else {
                    updates.insert(key, value);
                }
            }
            if filter.len() != where_columns.len() {
                return Err(Error::missing_key(
                    "update",
                    format!("row is missing key columns for {table}"),
                ));
            }
            let result = self
                .collection(table)
                .update_many(filter, doc! { "$set": updates }, None)
                .await
                .map_err(|err| mongo_err("update", err))?;
            affected += result.modified_count;
        }
        Ok(affected)
    }

    async fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        if key.is_empty() {
            return Err(Error::missing_key("delete", "empty delete predicate"));
        }
        let filter = map_to_document("delete", key)?;
        let result = self
            .collection(table)
            .delete_many(filter, None)
            .await
            .map_err(|err| mongo_err("delete", err))?;
        Ok(result.deleted_count)
    }

    async fn execute_query(&self, _statement: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(Error::unsupported(
            models::StoreType::Mongodb,
            "execute_query",
            "no SQL surface; use execute_command with a database command",
        ))
    }

    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch> {
        if req.batch_size == 0 {
            return Err(Error::configuration("stream", "batch_size must be positive"));
        }

        let filter = match &req.cursor {
            None => None,
            Some(cursor) => {
                let state: MongoCursor = cursor.decode("stream")?;
                let last = Bson::try_from(state.last_id).map_err(|err| {
                    Error::invalid_data("stream", "cursor does not hold a BSON id").with_source(err)
                })?;
                Some(doc! { "_id": { "$gt": last } })
            }
        };
        let projection = if req.columns.is_empty() {
            None
        } else {
            let mut projection = Document::new();
            for column in &req.columns {
                projection.insert(column.clone(), 1);
            }
            // `_id` keeps the stream resumable regardless of projection.
            projection.insert("_id", 1);
            Some(projection)
        };
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(req.batch_size as i64)
            .projection(projection)
            .build();

        let documents: Vec<Document> = self
            .collection(&req.table)
            .find(filter, options)
            .await
            .map_err(|err| mongo_err("stream", err))?
            .try_collect()
            .await
            .map_err(|err| mongo_err("stream", err))?;

        let next_cursor = match documents.last().and_then(|d| d.get("_id")) {
            Some(id) => {
                let last_id = serde_json::to_value(id).map_err(|err| {
                    Error::invalid_data("stream", "last _id is not JSON-representable")
                        .with_source(err)
                })?;
                Some(Cursor::encode("stream", &MongoCursor { last_id })?)
            }
            None => None,
        };

        let rows = documents
            .iter()
            .map(|d| document_to_map("stream", d))
            .collect::<Result<Vec<_>>>()?;
        let is_complete = rows.len() < req.batch_size as usize;
        Ok(StreamBatch {
            next_cursor: if is_complete { None } else { next_cursor },
            rows,
            is_complete,
        })
    }

    async fn get_table_row_count(&self, table: &str) -> Result<u64> {
        self.collection(table)
            .estimated_document_count(None)
            .await
            .map_err(|err| mongo_err("get_table_row_count", err))
    }
}
