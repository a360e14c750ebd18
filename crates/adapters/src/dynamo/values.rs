use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

/// DynamoDB attribute -> JSON value.
pub(crate) fn attribute_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number_to_json(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::B(blob) => Value::String(base64::encode(blob.as_ref())),
        AttributeValue::L(list) => Value::Array(list.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        AttributeValue::Ss(set) => {
            Value::Array(set.iter().map(|s| Value::String(s.clone())).collect())
        }
        AttributeValue::Ns(set) => Value::Array(set.iter().map(|n| number_to_json(n)).collect()),
        AttributeValue::Bs(set) => Value::Array(
            set.iter()
                .map(|b| Value::String(base64::encode(b.as_ref())))
                .collect(),
        ),
        _ => Value::Null,
    }
}

// DynamoDB numbers are decimal strings; keep exactness where JSON can.
fn number_to_json(n: &str) -> Value {
    if let Ok(int) = n.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(float) = n.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(float);
    }
    Value::String(n.to_string())
}

/// JSON value -> DynamoDB attribute.
pub(crate) fn json_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => {
            AttributeValue::L(items.iter().map(json_to_attribute).collect())
        }
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

pub(crate) fn item_to_row(item: &HashMap<String, AttributeValue>) -> Map<String, Value> {
    item.iter()
        .map(|(k, v)| (k.clone(), attribute_to_json(v)))
        .collect()
}

pub(crate) fn row_to_item(row: &Map<String, Value>) -> HashMap<String, AttributeValue> {
    row.iter()
        .map(|(k, v)| (k.clone(), json_to_attribute(v)))
        .collect()
}

// The streams SDK carries its own AttributeValue with the same shape.
pub(crate) fn stream_attribute_to_json(
    value: &aws_sdk_dynamodbstreams::types::AttributeValue,
) -> Value {
    use aws_sdk_dynamodbstreams::types::AttributeValue as Streamed;

    match value {
        Streamed::S(s) => Value::String(s.clone()),
        Streamed::N(n) => number_to_json(n),
        Streamed::Bool(b) => Value::Bool(*b),
        Streamed::Null(_) => Value::Null,
        Streamed::B(blob) => Value::String(base64::encode(blob.as_ref())),
        Streamed::L(list) => Value::Array(list.iter().map(stream_attribute_to_json).collect()),
        Streamed::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), stream_attribute_to_json(v)))
                .collect(),
        ),
        Streamed::Ss(set) => {
            Value::Array(set.iter().map(|s| Value::String(s.clone())).collect())
        }
        Streamed::Ns(set) => Value::Array(set.iter().map(|n| number_to_json(n)).collect()),
        Streamed::Bs(set) => Value::Array(
            set.iter()
                .map(|b| Value::String(base64::encode(b.as_ref())))
                .collect(),
        ),
        _ => Value::Null,
    }
}

pub(crate) fn stream_item_to_row(
    item: &HashMap<String, aws_sdk_dynamodbstreams::types::AttributeValue>,
) -> Map<String, Value> {
    item.iter()
        .map(|(k, v)| (k.clone(), stream_attribute_to_json(v)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn attributes_round_trip_through_json() {
        let mut item = HashMap::new();
        item.insert("id".to_string(), AttributeValue::N("7".to_string()));
        item.insert("name".to_string(), AttributeValue::S("Ada".to_string()));
        item.insert("active".to_string(), AttributeValue::Bool(true));
        item.insert(
            "tags".to_string(),
            AttributeValue::L(vec![AttributeValue::S("a".to_string())]),
        );

        let row = item_to_row(&item);
        assert_eq!(
            Value::Object(row.clone()),
            json!({"id": 7, "name": "Ada", "active": true, "tags": ["a"]}),
        );

        let back = row_to_item(&row);
        assert_eq!(back.get("id"), Some(&AttributeValue::N("7".to_string())));
        assert_eq!(back.get("name"), Some(&AttributeValue::S("Ada".to_string())));
    }

    #[test]
    fn numbers_degrade_gracefully() {
        assert_eq!(number_to_json("42"), json!(42));
        assert_eq!(number_to_json("3.5"), json!(3.5));
        // Out of double range: keep the decimal text.
        assert_eq!(number_to_json("1e999"), json!("1e999"));
    }
}
