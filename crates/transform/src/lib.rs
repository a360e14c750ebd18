//! Per-column transformation of rows in motion (bulk movement and CDC),
//! and the resolver which binds mapping rules to concrete resources.

mod resolver;
mod rules;

pub use resolver::{column_rules, resolve_mapping, CatalogSnapshot, ResolvedMapping};
pub use rules::{
    apply_rules, apply_value, strip_metadata, target_table_for, MutationClient, TransformError,
    TransformKind, TransformRule, METADATA_DENYLIST,
};
