use super::{pg_err, quote_ident, PostgresClient};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{ContainerSchema, SchemaOperator};
use models::{
    Constraint, ConstraintKind, ContainerType, ItemType, ResourceContainer, ResourceItem,
    ResourceUri, SecondaryIndex, StoreUri, UnifiedModel, UnifiedType,
};

const DISCOVER_COLUMNS: &str = "\
    SELECT c.table_name, c.column_name, c.udt_name, c.data_type, \
           c.is_nullable = 'YES' AS nullable, c.column_default, \
           c.character_maximum_length, c.numeric_precision, c.numeric_scale \
    FROM information_schema.columns c \
    JOIN information_schema.tables t \
      ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
    WHERE c.table_schema = 'public' \
    ORDER BY c.table_name, c.ordinal_position";

const DISCOVER_KEY_COLUMNS: &str = "\
    SELECT tc.table_name, tc.constraint_type, tc.constraint_name, kcu.column_name \
    FROM information_schema.table_constraints tc \
    JOIN information_schema.key_column_usage kcu \
      ON kcu.constraint_name = tc.constraint_name \
     AND kcu.table_schema = tc.table_schema \
    WHERE tc.table_schema = 'public' \
      AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') \
    ORDER BY tc.table_name, kcu.ordinal_position";

const DISCOVER_INDEXES: &str = "\
    SELECT t.relname AS table_name, i.relname AS index_name, ix.indisunique, a.attname \
    FROM pg_class t \
    JOIN pg_index ix ON t.oid = ix.indrelid \
    JOIN pg_class i ON i.oid = ix.indexrelid \
    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
    JOIN pg_namespace n ON n.oid = t.relnamespace \
    WHERE n.nspname = 'public' AND NOT ix.indisprimary \
    ORDER BY t.relname, i.relname, array_position(ix.indkey, a.attnum)";

#[async_trait::async_trait]
impl SchemaOperator for PostgresClient {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        let mut model = UnifiedModel::new(
            self.config.connection_id.clone(),
            self.config.database_name.clone(),
        );

        let tables = self
            .client
            .query(
                "SELECT table_name, table_type FROM information_schema.tables \
                 WHERE table_schema = 'public' ORDER BY table_name",
                &[],
            )
            .await
            .map_err(|err| pg_err("discover_schema", err))?;

        for row in &tables {
            let name: String = row.get(0);
            let table_type: String = row.get(1);
            let container_type = match table_type.as_str() {
                "VIEW" => ContainerType::View,
                _ => ContainerType::Table,
            };
            model.containers.push(ResourceContainer::real(
                self.container_uri(container_type, &name),
                name,
                container_type,
            ));
        }

        let matviews = self
            .client
            .query("SELECT matviewname FROM pg_matviews WHERE schemaname = 'public'", &[])
            .await
            .map_err(|err| pg_err("discover_schema", err))?;
        for row in &matviews {
            let name: String = row.get(0);
            model.containers.push(ResourceContainer::real(
                self.container_uri(ContainerType::MaterializedView, &name),
                name,
                ContainerType::MaterializedView,
            ));
        }

        let columns = self
            .client
            .query(DISCOVER_COLUMNS, &[])
            .await
            .map_err(|err| pg_err("discover_schema", err))?;
        for row in &columns {
            let table: String = row.get(0);
            let column: String = row.get(1);
            let udt: String = row.get(2);
            let data_type: String = row.get(3);
            let nullable: bool = row.get(4);
            let default: Option<String> = row.get(5);
            let length: Option<i32> = row.get(6);
            let precision: Option<i32> = row.get(7);
            let scale: Option<i32> = row.get(8);

            let container_type = model
                .container(&table)
                .map(|c| c.container_type)
                .unwrap_or(ContainerType::Table);
            let mut item = ResourceItem::new(
                self.item_uri(container_type, &table, &column),
                table,
                column,
                ItemType::Column,
                udt.clone(),
                unified_type(&udt, &data_type),
            );
            item.nullable = nullable;
            item.default_value = default.map(serde_json::Value::String);
            item.length = length.map(|v| v as u32);
            item.precision = precision.map(|v| v as u32);
            item.scale = scale.map(|v| v as u32);
            model.items.push(item);
        }

        let keys = self
            .client
            .query(DISCOVER_KEY_COLUMNS, &[])
            .await
            .map_err(|err| pg_err("discover_schema", err))?;
        for row in &keys {
            let table: String = row.get(0);
            let constraint_type: String = row.get(1);
            let constraint_name: String = row.get(2);
            let column: String = row.get(3);

            if let Some(item) = model
                .items
                .iter_mut()
                .find(|i| i.container_name == table && i.name == column)
            {
                match constraint_type.as_str() {
                    "PRIMARY KEY" => {
                        item.primary_key = true;
                        item.nullable = false;
                    }
                    _ => item.unique = true,
                }
            }

            let kind = match constraint_type.as_str() {
                "PRIMARY KEY" => ConstraintKind::PrimaryKey,
                _ => ConstraintKind::Unique,
            };
            match model
                .constraints
                .iter_mut()
                .find(|c| c.name == constraint_name && c.container_name == table)
            {
                Some(constraint) => constraint.columns.push(column),
                None => model.constraints.push(Constraint {
                    kind,
                    container_name: table,
                    name: constraint_name,
                    columns: vec![column],
                    references: None,
                    expression: None,
                }),
            }
        }

        let indexes = self
            .client
            .query(DISCOVER_INDEXES, &[])
            .await
            .map_err(|err| pg_err("discover_schema", err))?;
        for row in &indexes {
            let table: String = row.get(0);
            let index: String = row.get(1);
            let unique: bool = row.get(2);
            let column: String = row.get(3);

            if let Some(item) = model
                .items
                .iter_mut()
                .find(|i| i.container_name == table && i.name == column)
            {
                item.indexed = true;
            }
            match model
                .indexes
                .iter_mut()
                .find(|i| i.name == index && i.container_name == table)
            {
                Some(existing) => existing.columns.push(column),
                None => model.indexes.push(SecondaryIndex {
                    container_name: table,
                    name: index,
                    columns: vec![column],
                    unique,
                }),
            }
        }

        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        for container in &model.containers {
            if container.container_type != ContainerType::Table {
                // Views and materialized views are derived objects; only
                // base tables are deployed.
                continue;
            }
            let items: Vec<_> = model.items_of(&container.name).collect();
            if items.is_empty() {
                continue;
            }

            let existing = self.existing_columns(&container.name).await?;
            if existing.is_empty() {
                let columns = items
                    .iter()
                    .map(|i| column_ddl(i))
                    .collect::<Vec<_>>()
                    .join(", ");
                let pk: Vec<_> = items
                    .iter()
                    .filter(|i| i.primary_key)
                    .map(|i| quote_ident(&i.name))
                    .collect();
                let pk_clause = if pk.is_empty() {
                    String::new()
                } else {
                    format!(", PRIMARY KEY ({})", pk.join(", "))
                };
                let sql = format!(
                    "CREATE TABLE IF NOT EXISTS {} ({columns}{pk_clause})",
                    quote_ident(&container.name),
                );
                self.client
                    .execute(&sql, &[])
                    .await
                    .map_err(|err| pg_err("create_structure", err))?;
                continue;
            }

            // The container exists: adding columns is fine, changing the
            // type of an existing one is a conflict.
            for item in items {
                match existing.iter().find(|(name, _)| name == &item.name) {
                    None => {
                        let sql = format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote_ident(&container.name),
                            column_ddl(item),
                        );
                        self.client
                            .execute(&sql, &[])
                            .await
                            .map_err(|err| pg_err("create_structure", err))?;
                    }
                    Some((_, existing_udt)) => {
                        let wanted = pg_type(item);
                        if !equivalent_type(existing_udt, &wanted) {
                            return Err(Error::new(
                                ErrorKind::SchemaConflict,
                                "create_structure",
                                format!(
                                    "column {}.{} exists as {existing_udt}, model wants {wanted}",
                                    container.name, item.name,
                                ),
                            )
                            .with_store(models::StoreType::Postgres));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await
            .map_err(|err| pg_err("list_tables", err))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema> {
        let model = self.discover_schema().await?;
        let container = model
            .container(table)
            .cloned()
            .ok_or_else(|| {
                Error::not_found("get_table_schema", format!("table '{table}' does not exist"))
                    .with_store(models::StoreType::Postgres)
            })?;
        let items = model.items_of(table).cloned().collect();
        Ok(ContainerSchema { container, items })
    }
}

impl PostgresClient {
    fn container_uri(&self, container_type: ContainerType, name: &str) -> ResourceUri {
        ResourceUri::Store(StoreUri::container(
            &self.config.connection_id,
            &self.config.database_name,
            container_type,
            name,
        ))
    }

    fn item_uri(&self, container_type: ContainerType, table: &str, column: &str) -> ResourceUri {
        ResourceUri::Store(
            StoreUri::container(
                &self.config.connection_id,
                &self.config.database_name,
                container_type,
                table,
            )
            .with_item(ItemType::Column, column),
        )
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, udt_name FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1",
                &[&table],
            )
            .await
            .map_err(|err| pg_err("create_structure", err))?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }
}

fn unified_type(udt: &str, data_type: &str) -> UnifiedType {
    match udt {
        "bool" => UnifiedType::Boolean,
        "int2" => UnifiedType::Int16,
        "int4" => UnifiedType::Int32,
        "int8" => UnifiedType::Int64,
        "float4" => UnifiedType::Float32,
        "float8" => UnifiedType::Float64,
        "numeric" => UnifiedType::Decimal,
        "text" | "varchar" | "bpchar" | "name" => UnifiedType::String,
        "bytea" => UnifiedType::Bytes,
        "date" => UnifiedType::Date,
        "time" | "timetz" => UnifiedType::Time,
        "timestamp" | "timestamptz" => UnifiedType::Timestamp,
        "uuid" => UnifiedType::Uuid,
        "json" | "jsonb" => UnifiedType::Json,
        _ if data_type == "ARRAY" => UnifiedType::Array,
        _ => UnifiedType::Unknown,
    }
}

fn pg_type(item: &ResourceItem) -> String {
    match item.unified_type {
        UnifiedType::Boolean => "boolean".to_string(),
        UnifiedType::Int16 => "smallint".to_string(),
        UnifiedType::Int32 => "integer".to_string(),
        UnifiedType::Int64 => "bigint".to_string(),
        UnifiedType::Float32 => "real".to_string(),
        UnifiedType::Float64 => "double precision".to_string(),
        UnifiedType::Decimal => match (item.precision, item.scale) {
            (Some(p), Some(s)) => format!("numeric({p},{s})"),
            _ => "numeric".to_string(),
        },
        UnifiedType::String => match item.length {
            Some(n) => format!("varchar({n})"),
            None => "text".to_string(),
        },
        UnifiedType::Bytes => "bytea".to_string(),
        UnifiedType::Date => "date".to_string(),
        UnifiedType::Time => "time".to_string(),
        UnifiedType::Timestamp => "timestamptz".to_string(),
        UnifiedType::Uuid => "uuid".to_string(),
        UnifiedType::Json | UnifiedType::Object => "jsonb".to_string(),
        UnifiedType::Array => "jsonb".to_string(),
        UnifiedType::Unknown => "text".to_string(),
    }
}

// Deployed and discovered spellings of the same type.
fn equivalent_type(udt: &str, wanted: &str) -> bool {
    let canonical = match udt {
        "bool" => "boolean",
        "int2" => "smallint",
        "int4" => "integer",
        "int8" => "bigint",
        "float4" => "real",
        "float8" => "double precision",
        "bpchar" | "varchar" | "text" => "text",
        "timestamptz" | "timestamp" => "timestamptz",
        other => other,
    };
    let wanted = wanted.split('(').next().unwrap_or(wanted);
    let wanted = match wanted {
        "varchar" => "text",
        other => other,
    };
    canonical == wanted || udt == wanted
}

fn column_ddl(item: &ResourceItem) -> String {
    let mut ddl = format!("{} {}", quote_ident(&item.name), pg_type(item));
    if !item.nullable && !item.primary_key {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_types_map_to_unified_types() {
        assert_eq!(unified_type("int8", "bigint"), UnifiedType::Int64);
        assert_eq!(unified_type("timestamptz", ""), UnifiedType::Timestamp);
        assert_eq!(unified_type("_text", "ARRAY"), UnifiedType::Array);
        assert_eq!(unified_type("tsvector", "tsvector"), UnifiedType::Unknown);
    }

    #[test]
    fn deployed_types_round_trip_as_equivalent() {
        let mut item = ResourceItem::new(
            ResourceUri::Store(StoreUri::container("db", "d", ContainerType::Table, "t")),
            "t",
            "c",
            ItemType::Column,
            "int8",
            UnifiedType::Int64,
        );
        assert!(equivalent_type("int8", &pg_type(&item)));

        item.unified_type = UnifiedType::String;
        assert!(equivalent_type("text", &pg_type(&item)));
        assert!(!equivalent_type("int4", &pg_type(&item)));
    }
}
