use super::{pg_err, PostgresClient};
use crate::error::Result;
use crate::traits::MetadataOperator;
use serde_json::{json, Map, Value};

#[async_trait::async_trait]
impl MetadataOperator for PostgresClient {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>> {
        let mut meta = Map::new();
        meta.insert("database_name".to_string(), json!(self.config.database_name));
        meta.insert("version".to_string(), json!(self.get_version().await?));
        meta.insert("size_bytes".to_string(), json!(self.get_database_size().await?));
        meta.insert("table_count".to_string(), json!(self.get_table_count().await?));
        Ok(meta)
    }

    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>> {
        let mut meta = Map::new();
        meta.insert("version".to_string(), json!(self.get_version().await?));
        meta.insert(
            "identifier".to_string(),
            json!(self.get_unique_identifier().await?),
        );

        let row = self
            .client
            .query_one(
                "SELECT current_setting('max_connections')::bigint, \
                        (SELECT count(*) FROM pg_stat_activity)",
                &[],
            )
            .await
            .map_err(|err| pg_err("collect_instance_metadata", err))?;
        meta.insert("max_connections".to_string(), json!(row.get::<_, i64>(0)));
        meta.insert("active_connections".to_string(), json!(row.get::<_, i64>(1)));
        Ok(meta)
    }

    async fn get_version(&self) -> Result<String> {
        let row = self
            .client
            .query_one("SHOW server_version", &[])
            .await
            .map_err(|err| pg_err("get_version", err))?;
        Ok(row.get::<_, String>(0))
    }

    async fn get_unique_identifier(&self) -> Result<String> {
        let row = self
            .client
            .query_one("SELECT system_identifier::text FROM pg_control_system()", &[])
            .await
            .map_err(|err| pg_err("get_unique_identifier", err))?;
        Ok(row.get::<_, String>(0))
    }

    async fn get_database_size(&self) -> Result<u64> {
        let row = self
            .client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await
            .map_err(|err| pg_err("get_database_size", err))?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn get_table_count(&self) -> Result<u64> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
                &[],
            )
            .await
            .map_err(|err| pg_err("get_table_count", err))?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn execute_command(&self, command: &str) -> Result<Value> {
        let messages = self
            .client
            .simple_query(command)
            .await
            .map_err(|err| pg_err("execute_command", err))?;

        let mut rows = Vec::new();
        let mut affected = 0;
        for message in messages {
            match message {
                tokio_postgres::SimpleQueryMessage::Row(row) => {
                    let mut object = Map::new();
                    for (index, column) in row.columns().iter().enumerate() {
                        object.insert(
                            column.name().to_string(),
                            row.get(index).map(|v| json!(v)).unwrap_or(Value::Null),
                        );
                    }
                    rows.push(Value::Object(object));
                }
                tokio_postgres::SimpleQueryMessage::CommandComplete(n) => affected += n,
                _ => {}
            }
        }
        Ok(json!({ "rows": rows, "rows_affected": affected }))
    }
}
