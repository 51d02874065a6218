use serde_json::{Map, Number, Value};

use super::FieldViolation;
use crate::schema::{literal_eq, FieldType, Schema};

/// Validate `data` against `schema`, returning the normalized object.
///
/// Normalization fills defaults and coerces integral floats to integers.
/// Every violation is pushed to `violations`; validation never stops early.
pub(crate) fn validate_object(
    schema: &Schema,
    data: &Map<String, Value>,
    prefix: &str,
    violations: &mut Vec<FieldViolation>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for field in schema.fields() {
        let path = join(prefix, &field.name);
        match data.get(&field.name) {
            Some(value) => {
                out.insert(
                    field.name.clone(),
                    validate_type(&field.ty, value, &path, violations),
                );
            }
            None => match &field.default {
                Some(default) => {
                    out.insert(field.name.clone(), default.clone());
                }
                None if field.required => {
                    violations.push(FieldViolation::new(path, "missing required field"));
                }
                None => {}
            },
        }
    }
    for key in data.keys() {
        if !schema.has_field(key) {
            violations.push(FieldViolation::new(join(prefix, key), "unexpected field"));
        }
    }
    out
}

pub(crate) fn validate_type(
    ty: &FieldType,
    value: &Value,
    path: &str,
    violations: &mut Vec<FieldViolation>,
) -> Value {
    match ty {
        FieldType::Any => value.clone(),
        FieldType::Optional(inner) => {
            if value.is_null() {
                Value::Null
            } else {
                validate_type(inner, value, path, violations)
            }
        }
        FieldType::Integer => match coerce_integer(value) {
            Some(coerced) => coerced,
            None => mismatch(ty, value, path, violations),
        },
        FieldType::String | FieldType::Number | FieldType::Boolean => {
            if ty.accepts_literal(value) {
                value.clone()
            } else {
                mismatch(ty, value, path, violations)
            }
        }
        FieldType::Enum(allowed) => {
            if allowed.iter().any(|v| literal_eq(v, value)) {
                value.clone()
            } else {
                violations.push(FieldViolation::new(
                    path,
                    format!("{} is not one of {}", value, ty.describe()),
                ));
                value.clone()
            }
        }
        FieldType::Object(schema) => match value.as_object() {
            Some(obj) => Value::Object(validate_object(schema, obj, path, violations)),
            None => mismatch(ty, value, path, violations),
        },
        FieldType::List(items) => match value.as_array() {
            Some(arr) => Value::Array(
                arr.iter()
                    .enumerate()
                    .map(|(i, item)| {
                        validate_type(items, item, &format!("{}[{}]", path, i), violations)
                    })
                    .collect(),
            ),
            None => mismatch(ty, value, path, violations),
        },
        FieldType::Map(values) => match value.as_object() {
            Some(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            validate_type(values, v, &join(path, k), violations),
                        )
                    })
                    .collect(),
            ),
            None => mismatch(ty, value, path, violations),
        },
    }
}

fn coerce_integer(value: &Value) -> Option<Value> {
    if value.is_i64() || value.is_u64() {
        return Some(value.clone());
    }
    let f = value.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        return Some(Value::Number(Number::from(f as i64)));
    }
    None
}

fn mismatch(
    ty: &FieldType,
    value: &Value,
    path: &str,
    violations: &mut Vec<FieldViolation>,
) -> Value {
    violations.push(FieldViolation::new(
        path,
        format!("expected {}, got {}", ty.describe(), kind_of(value)),
    ));
    value.clone()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
