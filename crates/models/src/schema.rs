use super::resources::{ResourceContainer, ResourceItem};
use serde::{Deserialize, Serialize};

/// A secondary index of a container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SecondaryIndex {
    pub container_name: String,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub container_name: String,
    pub name: String,
    pub columns: Vec<String>,
    /// Referenced container and columns, for foreign keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<(String, Vec<String>)>,
    /// Check expression, for check constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// An immutable, language-neutral snapshot of one database's schema.
/// Produced by `discover_schema` and consumed by `create_structure`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UnifiedModel {
    pub database_id: String,
    pub db_name: String,
    pub containers: Vec<ResourceContainer>,
    pub items: Vec<ResourceItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<SecondaryIndex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl UnifiedModel {
    pub fn new(database_id: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            db_name: db_name.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn container(&self, name: &str) -> Option<&ResourceContainer> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Items of the named container, in declaration order.
    pub fn items_of<'a>(&'a self, container_name: &'a str) -> impl Iterator<Item = &'a ResourceItem> + 'a {
        self.items
            .iter()
            .filter(move |i| i.container_name == container_name)
    }

    /// Primary-key item names of the named container.
    pub fn primary_key_of<'a>(&'a self, container_name: &'a str) -> Vec<&'a str> {
        self.items_of(container_name)
            .filter(|i| i.primary_key)
            .map(|i| i.name.as_str())
            .collect()
    }
}
