use super::uri::ResourceUri;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One atomic source-to-target binding within a Mapping.
///
/// Source and target URIs may be `template://` URIs; the mapping resolver
/// replaces them with concrete `redb://` URIs once the virtual resources
/// they name have been reconciled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MappingRule {
    pub id: String,
    pub source_uri: ResourceUri,
    pub target_uri: ResourceUri,
    /// Transformation kind, or "direct" for the identity.
    #[serde(default = "direct")]
    pub transformation: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transformation_params: BTreeMap<String, Value>,
    pub ordinal: u32,
}

fn direct() -> String {
    "direct".to_string()
}

/// An ordered bundle of rules binding source items to target items,
/// plus optional row filter expressions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Mapping {
    pub id: String,
    pub name: String,
    pub rules: Vec<MappingRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// True when every rule resolves to an existing item of compatible type.
    /// Recomputed by the resolver; never set directly.
    #[serde(default)]
    pub validated: bool,
}

impl Mapping {
    /// Rules in ordinal order.
    pub fn ordered_rules(&self) -> Vec<&MappingRule> {
        let mut rules: Vec<&MappingRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.ordinal);
        rules
    }

    /// Whether any rule still references a template URI.
    pub fn has_template_rules(&self) -> bool {
        self.rules
            .iter()
            .any(|r| r.source_uri.is_template() || r.target_uri.is_template())
    }
}
