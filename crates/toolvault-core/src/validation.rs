//! Generic JSON value validation against [`SchemaDescriptor`].
//!
//! One routine serves capability parameters, manifest parameters and tool
//! outputs. The first violation is reported with a JSON-pointer-ish path.

use serde_json::Value;
use toolvault_state::SchemaDescriptor;

use crate::error::{VaultError, VaultResult};

/// Validate `value` against `schema`.
pub fn validate(schema: &SchemaDescriptor, value: &Value) -> VaultResult<()> {
    check(schema, value, "$").map_err(VaultError::Validation)
}

fn check(schema: &SchemaDescriptor, value: &Value, path: &str) -> Result<(), String> {
    match schema {
        SchemaDescriptor::Any => Ok(()),
        SchemaDescriptor::Boolean => match value {
            Value::Bool(_) => Ok(()),
            other => Err(type_error(path, "boolean", other)),
        },
        SchemaDescriptor::String {
            min_length,
            max_length,
            allowed,
        } => {
            let s = value
                .as_str()
                .ok_or_else(|| type_error(path, "string", value))?;
            let len = s.chars().count();
            if let Some(min) = min_length {
                if len < *min {
                    return Err(format!("{path}: length {len} is below minimum {min}"));
                }
            }
            if let Some(max) = max_length {
                if len > *max {
                    return Err(format!("{path}: length {len} exceeds maximum {max}"));
                }
            }
            if let Some(allowed) = allowed {
                if !allowed.iter().any(|a| a == s) {
                    return Err(format!("{path}: '{s}' is not one of {allowed:?}"));
                }
            }
            Ok(())
        }
        SchemaDescriptor::Integer { minimum, maximum } => {
            let n = value
                .as_i64()
                .ok_or_else(|| type_error(path, "integer", value))?;
            if let Some(min) = minimum {
                if n < *min {
                    return Err(format!("{path}: {n} is below minimum {min}"));
                }
            }
            if let Some(max) = maximum {
                if n > *max {
                    return Err(format!("{path}: {n} exceeds maximum {max}"));
                }
            }
            Ok(())
        }
        SchemaDescriptor::Number { minimum, maximum } => {
            let n = value
                .as_f64()
                .ok_or_else(|| type_error(path, "number", value))?;
            if let Some(min) = minimum {
                if n < *min {
                    return Err(format!("{path}: {n} is below minimum {min}"));
                }
            }
            if let Some(max) = maximum {
                if n > *max {
                    return Err(format!("{path}: {n} exceeds maximum {max}"));
                }
            }
            Ok(())
        }
        SchemaDescriptor::Array { items, max_items } => {
            let arr = value
                .as_array()
                .ok_or_else(|| type_error(path, "array", value))?;
            if let Some(max) = max_items {
                if arr.len() > *max {
                    return Err(format!("{path}: {} items exceed maximum {max}", arr.len()));
                }
            }
            for (i, item) in arr.iter().enumerate() {
                check(items, item, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        SchemaDescriptor::Object {
            properties,
            required,
            additional_properties,
        } => {
            let obj = value
                .as_object()
                .ok_or_else(|| type_error(path, "object", value))?;
            for name in required {
                if !obj.contains_key(name) {
                    return Err(format!("{path}: missing required field '{name}'"));
                }
            }
            for (key, field) in obj {
                match properties.get(key) {
                    Some(sub) => check(sub, field, &format!("{path}.{key}"))?,
                    None if !additional_properties => {
                        return Err(format!("{path}: unexpected field '{key}'"));
                    }
                    None => {}
                }
            }
            Ok(())
        }
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> String {
    let actual = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("{path}: expected {expected}, got {actual}")
}
