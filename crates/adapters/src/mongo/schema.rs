use super::{mongo_err, MongoClient};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{ContainerSchema, SchemaOperator};
use ::mongodb::bson::{Bson, Document};
use ::mongodb::options::FindOptions;
use ::mongodb::IndexModel;
use futures::TryStreamExt;
use models::{
    ContainerType, ItemType, ResourceContainer, ResourceItem, ResourceUri, SecondaryIndex,
    StoreUri, UnifiedModel, UnifiedType,
};
use std::collections::BTreeMap;

/// Documents examined per collection when inferring item shapes.
const SAMPLE_SIZE: i64 = 100;

#[async_trait::async_trait]
impl SchemaOperator for MongoClient {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let mut model = UnifiedModel::new(
            self.config.connection_id.clone(),
            self.config.database_name.clone(),
        );

        let mut names = self
            .database()
            .list_collection_names(None)
            .await
            .map_err(|err| mongo_err("discover_schema", err))?;
        names.sort();

        for name in names {
            model.containers.push(ResourceContainer::real(
                self.container_uri(&name),
                name.clone(),
                ContainerType::Collection,
            ));

            let (items, indexes) = self.describe_collection(&name).await?;
            model.items.extend(items);
            model.indexes.extend(indexes);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        let existing = self
            .database()
            .list_collection_names(None)
            .await
            .map_err(|err| mongo_err("create_structure", err))?;

        for container in &model.containers {
            if container.container_type != ContainerType::Collection
                && container.container_type != ContainerType::Table
            {
                continue;
            }
            if !existing.contains(&container.name) {
                if let Err(err) = self.database().create_collection(&container.name, None).await {
                    let err = mongo_err("create_structure", err);
                    // Lost race with a concurrent creator is fine.
                    if err.kind != ErrorKind::SchemaConflict {
                        return Err(err);
                    }
                }
            }

            for index in model.indexes.iter().filter(|i| i.container_name == container.name) {
                let mut keys = Document::new();
                for column in &index.columns {
                    keys.insert(column.clone(), 1);
                }
                let index_model = IndexModel::builder()
                    .keys(keys)
                    .options(
                        ::mongodb::options::IndexOptions::builder()
                            .name(index.name.clone())
                            .unique(index.unique)
                            .build(),
                    )
                    .build();
                self.collection(&container.name)
                    .create_index(index_model, None)
                    .await
                    .map_err(|err| mongo_err("create_structure", err))?;
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = self
            .database()
            .list_collection_names(None)
            .await
            .map_err(|err| mongo_err("list_tables", err))?;
        names.sort();
        Ok(names)
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let existing = self
            .database()
            .list_collection_names(None)
            .await
            .map_err(|err| mongo_err("get_table_schema", err))?;
        if !existing.iter().any(|name| name == table) {
            return Err(Error::not_found(
                "get_table_schema",
                format!("collection '{table}' does not exist"),
            )
            .with_store(models::StoreType::Mongodb));
        }
        let (items, _) = self.describe_collection(table).await?;
        Ok(ContainerSchema {
            container: ResourceContainer::real(
                self.container_uri(table),
                table,
                ContainerType::Collection,
            ),
            items,
        })
    }
}

impl MongoClient {
    fn container_uri(&self, name: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.config.connection_id,
            &self.config.database_name,
            ContainerType::Collection,
            name,
        ))
    }

    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<(Vec<ResourceItem>, Vec<SecondaryIndex>)> {
        let options = FindOptions::builder().limit(SAMPLE_SIZE).build();
        let documents: Vec<Document> = self
            .collection(name)
            .find(None, options)
            .await
            .map_err(|err| mongo_err("discover_schema", err))?
            .try_collect()
            .await
            .map_err(|err| mongo_err("discover_schema", err))?;

        // Field name -> (bson type name, unified type, appearances).
        let mut fields: BTreeMap<String, (String, UnifiedType, usize)> = BTreeMap::new();
        for document in &documents {
            for (field, value) in document {
                let entry = fields.entry(field.clone()).or_insert_with(|| {
                    (bson_type_name(value).to_string(), unified_type(value), 0)
                });
                entry.2 += 1;
            }
        }

        let mut items = Vec::new();
        for (field, (native, unified, seen)) in fields {
            let uri = ResourceUri::Store(
                StoreUri::container(
                    &self.config.connection_id,
                    &self.config.database_name,
                    ContainerType::Collection,
                    name,
                )
                .with_item(ItemType::Field, &field),
            );
            let mut item = ResourceItem::new(uri, name, &field, ItemType::Field, native, unified);
            item.nullable = seen < documents.len();
            if field == "_id" {
                item = item.with_primary_key();
            }
            items.push(item);
        }

        let mut indexes = Vec::new();
        let models: Vec<IndexModel> = self
            .collection(name)
            .list_indexes(None)
            .await
            .map_err(|err| mongo_err("discover_schema", err))?
            .try_collect()
            .await
            .map_err(|err| mongo_err("discover_schema", err))?;
        for index in models {
            let index_name = index
                .options
                .as_ref()
                .and_then(|o| o.name.clone())
                .unwrap_or_default();
            if index_name == "_id_" {
                continue;
            }
            let columns: Vec<String> = index.keys.keys().cloned().collect();
            for column in &columns {
                if let Some(item) = items.iter_mut().find(|i| &i.name == column) {
                    item.indexed = true;
                }
            }
            indexes.push(SecondaryIndex {
                container_name: name.to_string(),
                name: index_name,
                columns,
                unique: index
                    .options
                    .as_ref()
                    .and_then(|o| o.unique)
                    .unwrap_or(false),
            });
        }
        Ok((items, indexes))
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Timestamp(_) => "timestamp",
        Bson::DateTime(_) => "date",
        Bson::ObjectId(_) => "objectId",
        Bson::Binary(_) => "binData",
        Bson::Decimal128(_) => "decimal",
        _ => "unknown",
    }
}

fn unified_type(value: &Bson) -> UnifiedType {
    match value {
        Bson::Double(_) => UnifiedType::Float64,
        Bson::String(_) => UnifiedType::String,
        Bson::Array(_) => UnifiedType::Array,
        Bson::Document(_) => UnifiedType::Object,
        Bson::Boolean(_) => UnifiedType::Boolean,
        Bson::Int32(_) => UnifiedType::Int32,
        Bson::Int64(_) => UnifiedType::Int64,
        Bson::Timestamp(_) | Bson::DateTime(_) => UnifiedType::Timestamp,
        Bson::ObjectId(_) => UnifiedType::String,
        Bson::Binary(_) => UnifiedType::Bytes,
        Bson::Decimal128(_) => UnifiedType::Decimal,
        _ => UnifiedType::Unknown,
    }
}
