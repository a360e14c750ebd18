use models::Row;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata fields which must never be written to a target. These ride
/// along in raw change records and canonical-event metadata; they are
/// stripped from row images before apply.
pub const METADATA_DENYLIST: &[&str] = &[
    "message_type",
    "raw_data_b64",
    "data_length",
    "is_update",
    "sequence_number",
    "stream_view_type",
    "event_name",
    "event_source",
    "schema_name",
    "operation",
    "table_name",
    "timestamp",
    "database_id",
];

/// The closed set of built-in transformation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Direct,
    Uppercase,
    Lowercase,
    Trim,
    Cast,
    Default,
    Replace,
    FormatDate,
    Custom,
}

impl TransformKind {
    /// Parse a rule's kind. Unknown kinds return None; callers fall back
    /// to `Direct` and emit a warning.
    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "direct" => Self::Direct,
            "uppercase" => Self::Uppercase,
            "lowercase" => Self::Lowercase,
            "trim" => Self::Trim,
            "cast" => Self::Cast,
            "default" => Self::Default,
            "replace" => Self::Replace,
            "format_date" => Self::FormatDate,
            "custom" => Self::Custom,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("cannot cast {value} to {target_type}")]
    Cast { value: Value, target_type: String },
    #[error("cannot parse '{value}' with date format '{format}'")]
    DateParse { value: String, format: String },
    #[error("transformation rule is missing required parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("external transformation '{function}' failed: {message}")]
    Service { function: String, message: String },
}

/// Client of the external transformation service. Called only for rules
/// of kind `custom`; when no endpoint is configured, the engine uses no
/// client and custom transformations pass values through unchanged.
#[async_trait::async_trait]
pub trait MutationClient: Send + Sync {
    async fn transform(&self, function_name: &str, input: &str) -> Result<String, TransformError>;
}

/// One column-level rule: where a value comes from, where it lands, and
/// how it changes on the way.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransformRule {
    pub source_column: String,
    pub target_column: String,
    /// Kind name; unknown names degrade to "direct".
    #[serde(default = "direct_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Confines the rule to one source table, for cross-table mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
}

fn direct_kind() -> String {
    "direct".to_string()
}

impl TransformRule {
    pub fn direct(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_column: source.into(),
            target_column: target.into(),
            kind: direct_kind(),
            parameters: BTreeMap::new(),
            source_table: None,
            target_table: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    fn applies_to(&self, column: &str, table: Option<&str>) -> bool {
        if self.source_column != column {
            return false;
        }
        match (&self.source_table, table) {
            (Some(rule_table), Some(table)) => rule_table == table,
            _ => true,
        }
    }
}

/// The target table a row of `source_table` lands in, when any rule
/// declares one.
pub fn target_table_for<'r>(rules: &'r [TransformRule], source_table: &str) -> Option<&'r str> {
    rules
        .iter()
        .filter(|r| match &r.source_table {
            Some(table) => table == source_table,
            None => true,
        })
        .find_map(|r| r.target_table.as_deref())
}

/// Strip denylisted metadata fields from a row image.
pub fn strip_metadata(row: &Row) -> Row {
    row.iter()
        .filter(|(name, _)| !METADATA_DENYLIST.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Apply one transformation to one value. Pure for every kind except
/// `Custom`, which is dispatched separately.
pub fn apply_value(
    kind: TransformKind,
    parameters: &BTreeMap<String, Value>,
    value: &Value,
) -> Result<Value, TransformError> {
    match kind {
        TransformKind::Direct | TransformKind::Custom => Ok(value.clone()),
        TransformKind::Uppercase => Ok(map_string(value, |s| s.to_uppercase())),
        TransformKind::Lowercase => Ok(map_string(value, |s| s.to_lowercase())),
        TransformKind::Trim => Ok(map_string(value, |s| s.trim().to_string())),
        TransformKind::Replace => {
            let old = required_str(parameters, "old")?;
            let new = required_str(parameters, "new")?;
            Ok(map_string(value, |s| s.replace(old, new)))
        }
        TransformKind::Default => {
            if value.is_null() {
                Ok(parameters.get("default_value").cloned().unwrap_or(Value::Null))
            } else {
                Ok(value.clone())
            }
        }
        TransformKind::Cast => {
            let target_type = required_str(parameters, "target_type")?;
            cast_value(value, target_type)
        }
        TransformKind::FormatDate => {
            let input_format = required_str(parameters, "input_format")?;
            let output_format = required_str(parameters, "output_format")?;
            let Value::String(s) = value else {
                return Ok(value.clone());
            };
            format_date(s, input_format, output_format)
        }
    }
}

/// Transform one row under the given rules.
///
/// Columns without a matching rule pass through, unless `drop_unmapped`.
/// A rule whose source column is absent is skipped silently. An unknown
/// kind degrades to `direct` with a warning, and a failed transformation
/// falls back to the source value with a warning; neither fails the row.
pub async fn apply_rules(
    row: &Row,
    rules: &[TransformRule],
    source_table: Option<&str>,
    drop_unmapped: bool,
    mutation: Option<&dyn MutationClient>,
) -> Row {
    let mut out = Map::new();

    for (column, value) in row {
        let rule = rules.iter().find(|r| r.applies_to(column, source_table));

        let Some(rule) = rule else {
            if !drop_unmapped {
                out.insert(column.clone(), value.clone());
            }
            continue;
        };

        let kind = TransformKind::parse(&rule.kind).unwrap_or_else(|| {
            tracing::warn!(kind = %rule.kind, column = %column, "unknown transformation kind, using direct");
            TransformKind::Direct
        });

        let transformed = if kind == TransformKind::Custom {
            apply_custom(rule, value, mutation).await
        } else {
            apply_value(kind, &rule.parameters, value)
        };

        let transformed = match transformed {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(column = %column, error = %err, "transformation failed, keeping source value");
                value.clone()
            }
        };
        out.insert(rule.target_column.clone(), transformed);
    }
    out
}

async fn apply_custom(
    rule: &TransformRule,
    value: &Value,
    mutation: Option<&dyn MutationClient>,
) -> Result<Value, TransformError> {
    let Some(client) = mutation else {
        // No transformation endpoint configured: identity.
        return Ok(value.clone());
    };
    let function = rule
        .parameters
        .get("transformation_name")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingParameter("transformation_name"))?;

    let input = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let output = client.transform(function, &input).await?;

    // Prefer structured output when the service returns JSON.
    Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
}

fn map_string(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

fn required_str<'p>(
    parameters: &'p BTreeMap<String, Value>,
    key: &'static str,
) -> Result<&'p str, TransformError> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingParameter(key))
}

fn cast_value(value: &Value, target_type: &str) -> Result<Value, TransformError> {
    let fail = || TransformError::Cast {
        value: value.clone(),
        target_type: target_type.to_string(),
    };

    match target_type {
        "string" | "text" => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Null => Value::Null,
            other => Value::String(other.to_string()),
        }),
        "int16" | "int32" | "int64" | "integer" => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(fail)?;
                if f.fract() == 0.0 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(fail())
                }
            }
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::Null => Ok(Value::Null),
            _ => Err(fail()),
        },
        "float32" | "float64" | "float" | "decimal" => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(fail),
            Value::Null => Ok(Value::Null),
            _ => Err(fail()),
        },
        "boolean" | "bool" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            Value::Number(n) => Ok(Value::Bool(n.as_i64().ok_or_else(fail)? != 0)),
            Value::Null => Ok(Value::Null),
            _ => Err(fail()),
        },
        "json" => match value {
            Value::String(s) => serde_json::from_str(s).map_err(|_| fail()),
            other => Ok(other.clone()),
        },
        _ => Err(fail()),
    }
}

fn format_date(s: &str, input_format: &str, output_format: &str) -> Result<Value, TransformError> {
    let err = || TransformError::DateParse {
        value: s.to_string(),
        format: input_format.to_string(),
    };

    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, input_format) {
        return Ok(Value::String(dt.format(output_format).to_string()));
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, input_format) {
        return Ok(Value::String(d.format(output_format).to_string()));
    }
    Err(err())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn renames_and_passes_unmapped_through() {
        let rules = vec![
            TransformRule::direct("email_address", "email"),
            TransformRule::direct("password_hash", "password"),
            TransformRule::direct("id", "id"),
        ];
        let input = row(json!({"id": 1, "email_address": "a@b.c", "password_hash": "xyz"}));

        let out = apply_rules(&input, &rules, None, false, None).await;
        assert_eq!(
            Value::Object(out),
            json!({"id": 1, "email": "a@b.c", "password": "xyz"}),
        );
    }

    #[tokio::test]
    async fn drop_unmapped_removes_residual_columns() {
        let rules = vec![TransformRule::direct("id", "id")];
        let input = row(json!({"id": 1, "noise": true}));

        let out = apply_rules(&input, &rules, None, true, None).await;
        assert_eq!(Value::Object(out), json!({"id": 1}));
    }

    #[tokio::test]
    async fn unknown_kind_degrades_to_direct() {
        let rules = vec![TransformRule::direct("name", "name").with_kind("sparkle")];
        let input = row(json!({"name": "Ada"}));

        let out = apply_rules(&input, &rules, None, false, None).await;
        assert_eq!(Value::Object(out), json!({"name": "Ada"}));
    }

    #[tokio::test]
    async fn failed_cast_falls_back_to_source_value() {
        let rules = vec![TransformRule::direct("age", "age")
            .with_kind("cast")
            .with_parameter("target_type", json!("integer"))];
        let input = row(json!({"age": "not a number"}));

        let out = apply_rules(&input, &rules, None, false, None).await;
        assert_eq!(Value::Object(out), json!({"age": "not a number"}));
    }

    #[tokio::test]
    async fn table_scoped_rules_only_apply_to_their_table() {
        let rules = vec![TransformRule {
            source_table: Some("users".to_string()),
            target_table: Some("people".to_string()),
            ..TransformRule::direct("name", "full_name").with_kind("uppercase")
        }];
        let input = row(json!({"name": "ada"}));

        let out = apply_rules(&input, &rules, Some("users"), false, None).await;
        assert_eq!(Value::Object(out), json!({"full_name": "ADA"}));

        let out = apply_rules(&input, &rules, Some("orders"), false, None).await;
        assert_eq!(Value::Object(out), json!({"name": "ada"}));

        assert_eq!(target_table_for(&rules, "users"), Some("people"));
        assert_eq!(target_table_for(&rules, "orders"), None);
    }

    #[test]
    fn value_transforms() {
        let no_params = BTreeMap::new();

        assert_eq!(
            apply_value(TransformKind::Uppercase, &no_params, &json!("a@b.c")).unwrap(),
            json!("A@B.C"),
        );
        // Non-strings pass through string ops.
        assert_eq!(
            apply_value(TransformKind::Trim, &no_params, &json!(42)).unwrap(),
            json!(42),
        );

        let mut params = BTreeMap::new();
        params.insert("old".to_string(), json!("-"));
        params.insert("new".to_string(), json!("_"));
        assert_eq!(
            apply_value(TransformKind::Replace, &params, &json!("a-b-c")).unwrap(),
            json!("a_b_c"),
        );

        let mut params = BTreeMap::new();
        params.insert("default_value".to_string(), json!("unknown"));
        assert_eq!(
            apply_value(TransformKind::Default, &params, &Value::Null).unwrap(),
            json!("unknown"),
        );
        assert_eq!(
            apply_value(TransformKind::Default, &params, &json!("set")).unwrap(),
            json!("set"),
        );

        let mut params = BTreeMap::new();
        params.insert("target_type".to_string(), json!("integer"));
        assert_eq!(
            apply_value(TransformKind::Cast, &params, &json!("17")).unwrap(),
            json!(17),
        );

        let mut params = BTreeMap::new();
        params.insert("input_format".to_string(), json!("%Y-%m-%d"));
        params.insert("output_format".to_string(), json!("%d/%m/%Y"));
        assert_eq!(
            apply_value(TransformKind::FormatDate, &params, &json!("2024-02-29")).unwrap(),
            json!("29/02/2024"),
        );
    }

    #[test]
    fn strips_denylisted_metadata() {
        let input = row(json!({
            "id": 7,
            "sequence_number": "S1",
            "event_name": "INSERT",
            "stream_view_type": "NEW_AND_OLD_IMAGES",
        }));
        assert_eq!(Value::Object(strip_metadata(&input)), json!({"id": 7}));
    }

    struct ShoutingService;

    #[async_trait::async_trait]
    impl MutationClient for ShoutingService {
        async fn transform(
            &self,
            _function_name: &str,
            input: &str,
        ) -> Result<String, TransformError> {
            Ok(input.to_uppercase())
        }
    }

    #[tokio::test]
    async fn custom_rules_call_the_mutation_service() {
        let rules = vec![TransformRule::direct("name", "name")
            .with_kind("custom")
            .with_parameter("transformation_name", json!("shout"))];
        let input = row(json!({"name": "ada"}));

        // Without a configured endpoint, custom is the identity.
        let out = apply_rules(&input, &rules, None, false, None).await;
        assert_eq!(Value::Object(out), json!({"name": "ada"}));

        let out = apply_rules(&input, &rules, None, false, Some(&ShoutingService)).await;
        assert_eq!(Value::Object(out), json!({"name": "ADA"}));
    }
}
