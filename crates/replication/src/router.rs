use adapters::{RawEvent, ReplicationOperator, Result};
use models::CdcEvent;
use ops::EventStats;
use std::sync::Arc;
use transform::{MutationClient, TransformRule};

/// Routes raw source events to a target: parse into the canonical
/// shape, transform both row images, substitute the target table name,
/// and apply.
pub struct EventRouter {
    rules: Vec<TransformRule>,
    mutation: Option<Arc<dyn MutationClient>>,
    stats: Arc<EventStats>,
}

impl EventRouter {
    pub fn new(
        rules: Vec<TransformRule>,
        mutation: Option<Arc<dyn MutationClient>>,
        stats: Arc<EventStats>,
    ) -> Self {
        Self {
            rules,
            mutation,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<EventStats> {
        &self.stats
    }

    /// Translate one raw event into the canonical event bound for the
    /// target. Pure with respect to the target store.
    pub async fn translate(
        &self,
        source: &dyn ReplicationOperator,
        raw: &RawEvent,
    ) -> Result<CdcEvent> {
        let mut event = source.parse_event(raw)?;
        self.stats.record_parsed();

        let mutation = self.mutation.as_deref();
        let source_table = event.table_name.clone();

        event.data = transform::apply_rules(
            &event.data,
            &self.rules,
            Some(source_table.as_str()),
            false,
            mutation,
        )
        .await;
        // old_data is informational for UPDATE and the key for DELETE;
        // its transformation failures never fail the event.
        if let Some(old_data) = &event.old_data {
            event.old_data = Some(
                transform::apply_rules(
                    old_data,
                    &self.rules,
                    Some(source_table.as_str()),
                    false,
                    mutation,
                )
                .await,
            );
        }
        self.stats.record_transformed();

        if let Some(target_table) = transform::target_table_for(&self.rules, &source_table) {
            event.table_name = target_table.to_string();
        }
        Ok(event)
    }

    /// Full routing: translate, then apply at the target.
    pub async fn route(
        &self,
        source: &dyn ReplicationOperator,
        target: &dyn ReplicationOperator,
        raw: &RawEvent,
    ) -> Result<CdcEvent> {
        let event = self.translate(source, raw).await?;
        target.apply_cdc_event(&event).await?;
        self.stats.record_applied();
        Ok(event)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use adapters::memory::MemoryStore;
    use models::UnifiedType;
    use serde_json::{json, Value};

    fn raw(position: &str, payload: Value) -> RawEvent {
        RawEvent {
            shard_id: "0".to_string(),
            position: position.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn routes_updates_with_transform_and_table_substitution() {
        let source = MemoryStore::new("db-src", "appdb");
        let target = MemoryStore::new("db-tgt", "appdb");
        target.seed_table(
            "customers",
            &["id"],
            &[("id", UnifiedType::Int64), ("email", UnifiedType::String)],
            vec![json!({"id": 7, "email": "a@b.c"}).as_object().unwrap().clone()],
        );

        let rules = vec![
            transform::TransformRule {
                source_table: Some("users".to_string()),
                target_table: Some("customers".to_string()),
                ..transform::TransformRule::direct("email", "email").with_kind("uppercase")
            },
            transform::TransformRule {
                source_table: Some("users".to_string()),
                target_table: Some("customers".to_string()),
                ..transform::TransformRule::direct("id", "id")
            },
        ];
        let router = EventRouter::new(rules, None, Arc::new(EventStats::default()));

        let raw = raw(
            "S2",
            json!({
                "operation": "UPDATE",
                "table_name": "users",
                "timestamp": 1_700_000_000,
                "data": {"id": 7, "email": "A@B.C"},
                "old_data": {"id": 7, "email": "a@b.c"},
                "lsn": "S2",
            }),
        );
        let event = router.route(&source, &target, &raw).await.unwrap();

        // Uppercase leaves the already-upper new image alone and lifts
        // the old image; the table name is substituted.
        assert_eq!(event.table_name, "customers");
        assert_eq!(event.data.get("email"), Some(&json!("A@B.C")));
        assert_eq!(
            event.old_data.as_ref().and_then(|o| o.get("email")),
            Some(&json!("A@B.C")),
        );
        assert_eq!(
            target.rows("customers"),
            vec![json!({"id": 7, "email": "A@B.C"}).as_object().unwrap().clone()],
        );

        let snapshot = router.stats().snapshot();
        assert_eq!(snapshot.events_parsed, 1);
        assert_eq!(snapshot.events_applied, 1);
    }

    #[tokio::test]
    async fn delete_without_keys_is_a_missing_key_failure() {
        let source = MemoryStore::new("db-src", "appdb");
        let target = MemoryStore::new("db-tgt", "appdb");
        target.seed_table("users", &["id"], &[("id", UnifiedType::Int64)], vec![]);

        let router = EventRouter::new(Vec::new(), None, Arc::new(EventStats::default()));
        let raw = raw(
            "S3",
            json!({
                "operation": "DELETE",
                "table_name": "users",
                "timestamp": 0,
                "data": {},
            }),
        );
        let err = router.route(&source, &target, &raw).await.unwrap_err();
        assert_eq!(err.kind, adapters::ErrorKind::MissingKey);
    }
}
