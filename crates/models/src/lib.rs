mod config;
mod event;
mod mapping;
mod resources;
mod schema;
pub mod uri;

pub use config::{
    CdcMechanism, ConnectionConfig, InstanceConfig, ReplicationConfig, StoreType, TlsConfig,
    TlsMode,
};
pub use event::{headers, CdcEvent, CdcOperation};
pub use mapping::{Mapping, MappingRule};
pub use resources::{
    BindingMode, PrivilegeClass, ReconciliationStatus, ResourceContainer, ResourceItem,
    UnifiedType,
};
pub use schema::{Constraint, ConstraintKind, SecondaryIndex, UnifiedModel};
pub use uri::{ContainerType, ItemType, ResourceUri, StoreUri, StreamUri, TemplateUri, UriError};

/// A row in motion: an ordered mapping of column or field names to values.
pub type Row = serde_json::Map<String, serde_json::Value>;
