use models::{
    Mapping, MappingRule, ReconciliationStatus, ResourceContainer, ResourceItem, ResourceUri,
};
use std::collections::BTreeSet;

/// The catalog state a resolution runs against. Resolution is a pure
/// function of this snapshot: no network calls, no side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogSnapshot<'a> {
    /// Virtual containers awaiting or holding a reconciliation match.
    pub virtual_containers: &'a [ResourceContainer],
    /// Virtual items awaiting or holding a reconciliation match.
    pub virtual_items: &'a [ResourceItem],
    /// Items discovered from real stores, for type compatibility checks.
    pub real_items: &'a [ResourceItem],
}

impl<'a> CatalogSnapshot<'a> {
    /// Follow a template URI one hop to the real URI its virtual resource
    /// reconciled to. Pending or failed reconciliations return None.
    fn reconciled(&self, uri: &ResourceUri) -> Option<ResourceUri> {
        let container = self
            .virtual_containers
            .iter()
            .find(|c| &c.uri == uri)
            .filter(|c| c.reconciliation_status == ReconciliationStatus::Matched)
            .and_then(|c| c.reconciled_uri.clone());
        let item = self
            .virtual_items
            .iter()
            .find(|i| &i.uri == uri)
            .filter(|i| i.reconciliation_status == ReconciliationStatus::Matched)
            .and_then(|i| i.reconciled_uri.clone());
        container.or(item)
    }

    fn real_item(&self, uri: &ResourceUri) -> Option<&ResourceItem> {
        self.real_items.iter().find(|i| &i.uri == uri)
    }
}

/// The outcome of resolving one mapping against a catalog snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMapping {
    /// The mapping with every resolvable template URI rewritten to its
    /// real URI and `validated` recomputed.
    pub mapping: Mapping,
    /// IDs of rules which could not be fully resolved or validated.
    pub unresolved_rules: Vec<String>,
}

/// Resolve a mapping's rules to concrete resources.
///
/// Template URIs whose virtual resource has reconciled are rewritten to
/// the matched real URI (exactly one hop). The mapping is `validated`
/// only when every rule references existing items of compatible types
/// whose databases appear in `open_databases`.
pub fn resolve_mapping(
    snapshot: CatalogSnapshot<'_>,
    mapping: &Mapping,
    open_databases: &BTreeSet<String>,
) -> ResolvedMapping {
    let mut resolved = mapping.clone();
    let mut unresolved_rules = Vec::new();

    for rule in &mut resolved.rules {
        if !resolve_rule(&snapshot, rule, open_databases) {
            unresolved_rules.push(rule.id.clone());
        }
    }
    resolved.validated = unresolved_rules.is_empty();

    ResolvedMapping {
        mapping: resolved,
        unresolved_rules,
    }
}

// Rewrites the rule in place; true when the rule fully validates.
fn resolve_rule(
    snapshot: &CatalogSnapshot<'_>,
    rule: &mut MappingRule,
    open_databases: &BTreeSet<String>,
) -> bool {
    for uri in [&mut rule.source_uri, &mut rule.target_uri] {
        if uri.is_template() {
            match snapshot.reconciled(uri) {
                Some(real) => *uri = real,
                // Still pending reconciliation: the rule stays virtual.
                None => return false,
            }
        }
    }

    let (Some(source), Some(target)) = (
        snapshot.real_item(&rule.source_uri),
        snapshot.real_item(&rule.target_uri),
    ) else {
        return false;
    };

    if !source.unified_type.is_compatible_with(target.unified_type) {
        return false;
    }

    reachable(&rule.source_uri, open_databases) && reachable(&rule.target_uri, open_databases)
}

/// Lower a resolved mapping into column-level transform rules for the
/// movement pipeline and the CDC router. Rules that do not address
/// items (container-to-container bindings) do not lower.
pub fn column_rules(mapping: &Mapping) -> Vec<crate::TransformRule> {
    let mut rules = Vec::new();
    for rule in mapping.ordered_rules() {
        let (Some(source_column), Some(target_column)) =
            (rule.source_uri.item_name(), rule.target_uri.item_name())
        else {
            continue;
        };
        rules.push(crate::TransformRule {
            source_column: source_column.to_string(),
            target_column: target_column.to_string(),
            kind: rule.transformation.clone(),
            parameters: rule.transformation_params.clone(),
            source_table: rule
                .source_uri
                .container_name()
                .map(str::to_string),
            target_table: rule
                .target_uri
                .container_name()
                .map(str::to_string),
        });
    }
    rules
}

// A rule may only feed movement or CDC when both containers are
// reachable through open connections.
fn reachable(uri: &ResourceUri, open_databases: &BTreeSet<String>) -> bool {
    match uri {
        ResourceUri::Store(u) => open_databases.contains(&u.database_id),
        ResourceUri::Stream(u) => open_databases.contains(&u.workspace_id),
        ResourceUri::Template(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{ContainerType, ItemType, ResourceItem, StoreUri, TemplateUri, UnifiedType};

    fn real_item(database_id: &str, table: &str, column: &str, t: UnifiedType) -> ResourceItem {
        let uri = ResourceUri::Store(
            StoreUri::container(database_id, "appdb", ContainerType::Table, table)
                .with_item(ItemType::Column, column),
        );
        ResourceItem::new(uri, table, column, ItemType::Column, "text", t)
    }

    fn virtual_item(namespace: &str, table: &str, column: &str) -> ResourceItem {
        let uri = ResourceUri::Template(
            TemplateUri::container(namespace, ContainerType::Table, table)
                .with_item(ItemType::Column, column),
        );
        let mut item =
            ResourceItem::new(uri, table, column, ItemType::Column, "", UnifiedType::Unknown);
        item.is_virtual = true;
        item.reconciliation_status = ReconciliationStatus::Pending;
        item
    }

    fn rule(id: &str, source: ResourceUri, target: ResourceUri) -> MappingRule {
        MappingRule {
            id: id.to_string(),
            source_uri: source,
            target_uri: target,
            transformation: "direct".to_string(),
            transformation_params: Default::default(),
            ordinal: 0,
        }
    }

    fn mapping(rules: Vec<MappingRule>) -> Mapping {
        Mapping {
            id: "map-1".to_string(),
            name: "users".to_string(),
            rules,
            filters: Vec::new(),
            validated: false,
        }
    }

    #[test]
    fn resolves_matched_template_rules() {
        let source = real_item("db-src", "users", "email", UnifiedType::String);
        let target = real_item("db-tgt", "users", "email", UnifiedType::String);

        let mut virt = virtual_item("crm", "users", "email");
        virt.reconciliation_status = ReconciliationStatus::Matched;
        virt.reconciled_uri = Some(target.uri.clone());

        let template_uri = virt.uri.clone();
        let snapshot = CatalogSnapshot {
            virtual_containers: &[],
            virtual_items: &[virt],
            real_items: &[source.clone(), target.clone()],
        };

        let mapping = mapping(vec![rule("r1", source.uri.clone(), template_uri)]);
        let open = BTreeSet::from(["db-src".to_string(), "db-tgt".to_string()]);

        let resolved = resolve_mapping(snapshot, &mapping, &open);
        assert!(resolved.mapping.validated);
        assert_eq!(resolved.mapping.rules[0].target_uri, target.uri);
        assert!(resolved.unresolved_rules.is_empty());
    }

    #[test]
    fn pending_reconciliation_leaves_mapping_unvalidated() {
        let source = real_item("db-src", "users", "email", UnifiedType::String);
        let virt = virtual_item("crm", "users", "email");
        let template_uri = virt.uri.clone();

        let snapshot = CatalogSnapshot {
            virtual_containers: &[],
            virtual_items: &[virt],
            real_items: &[source.clone()],
        };
        let mapping = mapping(vec![rule("r1", source.uri.clone(), template_uri.clone())]);
        let open = BTreeSet::from(["db-src".to_string()]);

        let resolved = resolve_mapping(snapshot, &mapping, &open);
        assert!(!resolved.mapping.validated);
        assert_eq!(resolved.unresolved_rules, vec!["r1".to_string()]);
        // The unresolvable rule keeps its template URI.
        assert_eq!(resolved.mapping.rules[0].target_uri, template_uri);
    }

    #[test]
    fn incompatible_types_fail_validation() {
        let source = real_item("db-src", "users", "age", UnifiedType::Int64);
        let target = real_item("db-tgt", "users", "age", UnifiedType::Int32);

        let snapshot = CatalogSnapshot {
            virtual_containers: &[],
            virtual_items: &[],
            real_items: &[source.clone(), target.clone()],
        };
        let mapping = mapping(vec![rule("r1", source.uri.clone(), target.uri.clone())]);
        let open = BTreeSet::from(["db-src".to_string(), "db-tgt".to_string()]);

        assert!(!resolve_mapping(snapshot, &mapping, &open).mapping.validated);
    }

    #[test]
    fn resolved_mappings_lower_to_column_rules() {
        let source = real_item("db-src", "users", "email_address", UnifiedType::String);
        let target = real_item("db-tgt", "people", "email", UnifiedType::String);

        let mut renames = mapping(vec![rule("r1", source.uri.clone(), target.uri.clone())]);
        renames.rules[0].transformation = "lowercase".to_string();

        let rules = column_rules(&renames);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_column, "email_address");
        assert_eq!(rules[0].target_column, "email");
        assert_eq!(rules[0].kind, "lowercase");
        assert_eq!(rules[0].source_table.as_deref(), Some("users"));
        assert_eq!(rules[0].target_table.as_deref(), Some("people"));

        // Container-level bindings have no column to lower.
        let container_rule = rule(
            "r2",
            source.uri.container_uri(),
            target.uri.container_uri(),
        );
        assert!(column_rules(&mapping(vec![container_rule])).is_empty());
    }

    #[test]
    fn unreachable_databases_fail_validation() {
        let source = real_item("db-src", "users", "email", UnifiedType::String);
        let target = real_item("db-tgt", "users", "email", UnifiedType::String);

        let snapshot = CatalogSnapshot {
            virtual_containers: &[],
            virtual_items: &[],
            real_items: &[source.clone(), target.clone()],
        };
        let mapping = mapping(vec![rule("r1", source.uri.clone(), target.uri.clone())]);
        let open = BTreeSet::from(["db-src".to_string()]);

        assert!(!resolve_mapping(snapshot, &mapping, &open).mapping.validated);
    }
}
