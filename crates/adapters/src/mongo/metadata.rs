use super::{document_to_map, mongo_err, MongoClient};
use crate::error::{Error, Result};
use crate::traits::MetadataOperator;
use ::mongodb::bson::{doc, Bson, Document};
use serde_json::{json, Map, Value};

#[async_trait::async_trait]
impl MetadataOperator for MongoClient {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>> {
        let stats = self
            .database()
            .run_command(doc! { "dbStats": 1 }, None)
            .await
            .map_err(|err| mongo_err("collect_database_metadata", err))?;

        let mut meta = Map::new();
        meta.insert("database_name".to_string(), json!(self.config.database_name));
        meta.insert("version".to_string(), json!(self.get_version().await?));
        meta.insert(
            "size_bytes".to_string(),
            json!(read_number(&stats, "dataSize")),
        );
        meta.insert(
            "collection_count".to_string(),
            json!(read_number(&stats, "collections")),
        );
        meta.insert(
            "object_count".to_string(),
            json!(read_number(&stats, "objects")),
        );
        Ok(meta)
    }

    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>> {
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(|err| mongo_err("collect_instance_metadata", err))?;

        let mut meta = Map::new();
        meta.insert("version".to_string(), json!(self.get_version().await?));
        if let Ok(set_name) = hello.get_str("setName") {
            meta.insert("replica_set".to_string(), json!(set_name));
        }
        if let Ok(me) = hello.get_str("me") {
            meta.insert("member".to_string(), json!(me));
        }
        Ok(meta)
    }

    async fn get_version(&self) -> Result<String> {
        let info = self
            .client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 }, None)
            .await
            .map_err(|err| mongo_err("get_version", err))?;
        info.get_str("version")
            .map(str::to_string)
            .map_err(|err| Error::invalid_data("get_version", "buildInfo has no version").with_source(err))
    }

    async fn get_unique_identifier(&self) -> Result<String> {
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(|err| mongo_err("get_unique_identifier", err))?;

        // Replica sets are identified by set name; standalone servers by
        // their advertised address.
        if let Ok(set_name) = hello.get_str("setName") {
            return Ok(format!("rs:{set_name}"));
        }
        Ok(format!(
            "host:{}:{}",
            self.config.host, self.config.port,
        ))
    }

    async fn get_database_size(&self) -> Result<u64> {
        let stats = self
            .database()
            .run_command(doc! { "dbStats": 1 }, None)
            .await
            .map_err(|err| mongo_err("get_database_size", err))?;
        Ok(read_number(&stats, "dataSize"))
    }

    async fn get_table_count(&self) -> Result<u64> {
        let stats = self
            .database()
            .run_command(doc! { "dbStats": 1 }, None)
            .await
            .map_err(|err| mongo_err("get_table_count", err))?;
        Ok(read_number(&stats, "collections"))
    }

    async fn execute_command(&self, command: &str) -> Result<Value> {
        let parsed: Value = serde_json::from_str(command).map_err(|err| {
            Error::invalid_data("execute_command", "command must be a JSON database command")
                .with_source(err)
        })?;
        let Value::Object(map) = parsed else {
            return Err(Error::invalid_data(
                "execute_command",
                "command must be a JSON object",
            ));
        };
        let document = super::map_to_document("execute_command", &map)?;
        let reply = self
            .database()
            .run_command(document, None)
            .await
            .map_err(|err| mongo_err("execute_command", err))?;
        Ok(Value::Object(document_to_map("execute_command", &reply)?))
    }
}

// dbStats counters arrive as int32, int64 or double depending on server
// version.
fn read_number(document: &Document, key: &str) -> u64 {
    match document.get(key) {
        Some(Bson::Int32(v)) => *v as u64,
        Some(Bson::Int64(v)) => *v as u64,
        Some(Bson::Double(v)) => *v as u64,
        _ => 0,
    }
}
