use super::{dyn_err, values::attribute_to_json, DynamoClient};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{ContainerSchema, SchemaOperator};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
};
use models::{
    ContainerType, ItemType, ResourceContainer, ResourceItem, ResourceUri, SecondaryIndex,
    StoreType, StoreUri, UnifiedModel, UnifiedType,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Items sampled per table when inferring non-key attributes.
const SAMPLE_LIMIT: i32 = 100;

#[async_trait::async_trait]
impl SchemaOperator for DynamoClient {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let mut model = UnifiedModel::new(
            self.config.connection_id.clone(),
            self.config.database_name.clone(),
        );

        for table in self.table_names().await? {
            let described = self
                .client
                .describe_table()
                .table_name(&table)
                .send()
                .await
                .map_err(|err| dyn_err("discover_schema", err))?;
            let Some(description) = described.table() else {
                continue;
            };

            model.containers.push(ResourceContainer::real(
                self.container_uri(&table),
                table.clone(),
                ContainerType::Table,
            ));

            let key_names: Vec<&str> = description
                .key_schema()
                .iter()
                .map(|k| k.attribute_name())
                .collect();
            let defined_types: BTreeMap<&str, &ScalarAttributeType> = description
                .attribute_definitions()
                .iter()
                .map(|d| (d.attribute_name(), d.attribute_type()))
                .collect();

            // Key attributes come from the table definition; the rest of
            // the shape is inferred from a bounded sample.
            let mut seen = Vec::new();
            for key in &key_names {
                let unified = match defined_types.get(key) {
                    Some(ScalarAttributeType::N) => UnifiedType::Float64,
                    Some(ScalarAttributeType::B) => UnifiedType::Bytes,
                    _ => UnifiedType::String,
                };
                let native = match defined_types.get(key) {
                    Some(t) => t.as_str().to_string(),
                    None => "S".to_string(),
                };
                model.items.push(
                    ResourceItem::new(
                        self.item_uri(&table, key),
                        table.clone(),
                        *key,
                        ItemType::Column,
                        native,
                        unified,
                    )
                    .with_primary_key(),
                );
                seen.push(key.to_string());
            }

            let scanned = self
                .client
                .scan()
                .table_name(&table)
                .limit(SAMPLE_LIMIT)
                .send()
                .await
                .map_err(|err| dyn_err("discover_schema", err))?;
            let mut sampled: BTreeMap<String, UnifiedType> = BTreeMap::new();
            for item in scanned.items() {
                for (attribute, value) in item {
                    if seen.contains(attribute) || sampled.contains_key(attribute) {
                        continue;
                    }
                    sampled.insert(attribute.clone(), infer_type(&attribute_to_json(value)));
                }
            }
            for (attribute, unified) in sampled {
                model.items.push(ResourceItem::new(
                    self.item_uri(&table, &attribute),
                    table.clone(),
                    attribute.clone(),
                    ItemType::Column,
                    "inferred",
                    unified,
                ));
            }

            for gsi in description.global_secondary_indexes() {
                model.indexes.push(SecondaryIndex {
                    container_name: table.clone(),
                    name: gsi.index_name().unwrap_or_default().to_string(),
                    columns: gsi
                        .key_schema()
                        .iter()
                        .map(|k| k.attribute_name().to_string())
                        .collect(),
                    unique: false,
                });
            }
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        let existing = self.table_names().await?;

        for container in &model.containers {
            if container.container_type != ContainerType::Table {
                continue;
            }
            let keys: Vec<_> = model
                .items_of(&container.name)
                .filter(|i| i.primary_key)
                .collect();
            if keys.is_empty() {
                return Err(Error::configuration(
                    "create_structure",
                    format!("table '{}' needs at least a hash key", container.name),
                )
                .with_store(StoreType::Dynamodb));
            }

            if existing.contains(&container.name) {
                // Additive and idempotent: an existing table passes when
                // its key schema agrees with the model.
                let current = self.key_attributes(&container.name).await?;
                let wanted: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
                if current != wanted {
                    return Err(Error::new(
                        ErrorKind::SchemaConflict,
                        "create_structure",
                        format!(
                            "table '{}' exists with keys {current:?}, model wants {wanted:?}",
                            container.name,
                        ),
                    )
                    .with_store(StoreType::Dynamodb));
                }
                continue;
            }

            let mut request = self
                .client
                .create_table()
                .table_name(&container.name)
                .billing_mode(BillingMode::PayPerRequest);
            for (position, key) in keys.iter().take(2).enumerate() {
                let key_type = if position == 0 {
                    KeyType::Hash
                } else {
                    KeyType::Range
                };
                request = request
                    .key_schema(
                        KeySchemaElement::builder()
                            .attribute_name(&key.name)
                            .key_type(key_type)
                            .build()
                            .map_err(|err| {
                                Error::configuration("create_structure", err.to_string())
                            })?,
                    )
                    .attribute_definitions(
                        AttributeDefinition::builder()
                            .attribute_name(&key.name)
                            .attribute_type(scalar_type(key.unified_type))
                            .build()
                            .map_err(|err| {
                                Error::configuration("create_structure", err.to_string())
                            })?,
                    );
            }
            if let Err(err) = request.send().await {
                let err = dyn_err("create_structure", err);
                // Lost race with a concurrent creator is fine.
                if err.kind != ErrorKind::SchemaConflict {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = self.table_names().await?;
        names.sort();
        Ok(names)
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let model = self.discover_schema().await?;
        let container = model.container(table).cloned().ok_or_else(|| {
            Error::not_found("get_table_schema", format!("table '{table}' does not exist"))
                .with_store(StoreType::Dynamodb)
        })?;
        Ok(ContainerSchema {
            items: model.items_of(table).cloned().collect(),
            container,
        })
    }
}

impl DynamoClient {
    fn container_uri(&self, table: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.config.connection_id,
            &self.config.database_name,
            ContainerType::Table,
            table,
        ))
    }

    fn item_uri(&self, table: &str, attribute: &str) -> ResourceUri {
        ResourceUri::Store(
            StoreUri::container(
                &self.config.connection_id,
                &self.config.database_name,
                ContainerType::Table,
                table,
            )
            .with_item(ItemType::Column, attribute),
        )
    }
}

fn infer_type(value: &Value) -> UnifiedType {
    match value {
        Value::Bool(_) => UnifiedType::Boolean,
        Value::Number(n) if n.is_i64() => UnifiedType::Int64,
        Value::Number(_) => UnifiedType::Float64,
        Value::String(_) => UnifiedType::String,
        Value::Array(_) => UnifiedType::Array,
        Value::Object(_) => UnifiedType::Object,
        Value::Null => UnifiedType::Unknown,
    }
}

fn scalar_type(unified: UnifiedType) -> ScalarAttributeType {
    match unified {
        UnifiedType::Int16
        | UnifiedType::Int32
        | UnifiedType::Int64
        | UnifiedType::Float32
        | UnifiedType::Float64
        | UnifiedType::Decimal => ScalarAttributeType::N,
        UnifiedType::Bytes => ScalarAttributeType::B,
        _ => ScalarAttributeType::S,
    }
}
