use crate::error::{Error, ErrorKind, Result};
use serde_json::Value;
use tokio_postgres::types::{ToSql, Type};

/// Convert JSON parameters into typed SQL parameters, guided by the
/// prepared statement's inferred parameter types. Movement paths avoid
/// this entirely (rows travel as JSON, typed server-side); this binding
/// only serves `execute_query`.
pub(crate) fn bind_params(
    operation: &'static str,
    types: &[Type],
    params: &[Value],
) -> Result<Vec<Box<dyn ToSql + Send + Sync>>> {
    if types.len() != params.len() {
        return Err(Error::invalid_data(
            operation,
            format!("statement wants {} parameters, got {}", types.len(), params.len()),
        ));
    }

    params
        .iter()
        .zip(types)
        .map(|(value, ty)| bind_one(operation, ty, value))
        .collect()
}

fn bind_one(
    operation: &'static str,
    ty: &Type,
    value: &Value,
) -> Result<Box<dyn ToSql + Send + Sync>> {
    let mismatch = || {
        Error::new(
            ErrorKind::InvalidData,
            operation,
            format!("cannot bind {value} as {ty}"),
        )
    };

    Ok(match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => Box::new(value.as_i64().ok_or_else(mismatch)? as i16),
        Type::INT4 => Box::new(value.as_i64().ok_or_else(mismatch)? as i32),
        Type::INT8 => Box::new(value.as_i64().ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(value.as_f64().ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(value.as_f64().ok_or_else(mismatch)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => match value {
            Value::Null => Box::new(None::<String>),
            Value::String(s) => Box::new(s.clone()),
            other => Box::new(other.to_string()),
        },
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        _ => match value {
            // Last resort: let the server cast from text.
            Value::String(s) => Box::new(s.clone()),
            Value::Null => Box::new(None::<String>),
            _ => return Err(mismatch()),
        },
    })
}
