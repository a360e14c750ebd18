use super::uri::{ContainerType, ItemType, ResourceUri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a virtual resource binds to real stores.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// A name-matched template, reconciled against discovered schemas.
    Template,
    /// Declared but not yet associated with any store.
    #[default]
    Unbound,
    /// Pinned to a concrete resource.
    Bound,
    /// Binds to the first matching resource found at reconciliation.
    AutoBind,
}

/// Progress of matching a virtual resource against real ones.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    #[default]
    Pending,
    Matched,
    Failed,
}

/// Privilege classification of an item, as assigned upstream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeClass {
    #[default]
    Public,
    Internal,
    Confidential,
}

/// A store-agnostic data type, the common denominator all adapters
/// map their native types into and out of.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
    Array,
    Object,
    Unknown,
}

impl UnifiedType {
    /// Whether a value of this type may be written to a target item of
    /// `other` without loss that would corrupt movement. Widening numeric
    /// conversions are compatible; everything converts into String or Json.
    pub fn is_compatible_with(&self, other: UnifiedType) -> bool {
        use UnifiedType::*;

        if *self == other || matches!(other, String | Json | Unknown) || *self == Unknown {
            return true;
        }
        match (*self, other) {
            (Int16, Int32 | Int64 | Float64 | Decimal) => true,
            (Int32, Int64 | Float64 | Decimal) => true,
            (Int64, Decimal) => true,
            (Float32, Float64 | Decimal) => true,
            (Date | Time, Timestamp) => true,
            (Uuid, Bytes) => true,
            _ => false,
        }
    }
}

/// A database-agnostic description of a container: a table, collection,
/// view, stream topic or graph node-type. Containers may be virtual,
/// describing a resource no store backs yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceContainer {
    pub uri: ResourceUri,
    pub name: String,
    pub container_type: ContainerType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_virtual: bool,
    #[serde(default)]
    pub binding_mode: BindingMode,
    #[serde(default)]
    pub reconciliation_status: ReconciliationStatus,
    /// Real URI this virtual container reconciled to. Resolvers follow
    /// exactly one hop; a matched resource always carries this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_uri: Option<ResourceUri>,
}

impl ResourceContainer {
    pub fn real(uri: ResourceUri, name: impl Into<String>, container_type: ContainerType) -> Self {
        Self {
            uri,
            name: name.into(),
            container_type,
            is_virtual: false,
            binding_mode: BindingMode::Bound,
            reconciliation_status: ReconciliationStatus::Matched,
            reconciled_uri: None,
        }
    }
}

/// A child of a container: a column, document field or property.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceItem {
    pub uri: ResourceUri,
    pub container_name: String,
    pub name: String,
    pub item_type: ItemType,
    /// The store's own name for the type, e.g. `timestamptz`.
    pub native_type: String,
    pub unified_type: UnifiedType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default)]
    pub privilege: PrivilegeClass,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_virtual: bool,
    #[serde(default)]
    pub reconciliation_status: ReconciliationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_uri: Option<ResourceUri>,
}

impl ResourceItem {
    pub fn new(
        uri: ResourceUri,
        container_name: impl Into<String>,
        name: impl Into<String>,
        item_type: ItemType,
        native_type: impl Into<String>,
        unified_type: UnifiedType,
    ) -> Self {
        Self {
            uri,
            container_name: container_name.into(),
            name: name.into(),
            item_type,
            native_type: native_type.into(),
            unified_type,
            nullable: true,
            primary_key: false,
            unique: false,
            indexed: false,
            default_value: None,
            length: None,
            precision: None,
            scale: None,
            privilege: PrivilegeClass::default(),
            is_virtual: false,
            reconciliation_status: ReconciliationStatus::Matched,
            reconciled_uri: None,
        }
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unified_type_compatibility() {
        use UnifiedType::*;

        assert!(Int32.is_compatible_with(Int64));
        assert!(Int16.is_compatible_with(Decimal));
        assert!(Float32.is_compatible_with(Float64));
        assert!(Date.is_compatible_with(Timestamp));
        assert!(Bytes.is_compatible_with(String));
        assert!(Object.is_compatible_with(Json));
        assert!(!Int64.is_compatible_with(Int32));
        assert!(!Timestamp.is_compatible_with(Date));
        assert!(!String.is_compatible_with(Boolean));
    }
}
