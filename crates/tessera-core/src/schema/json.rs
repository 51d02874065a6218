//! Conversion between `Schema` and a JSON-schema dialect.
//!
//! Objects carry `properties`/`required`/`additionalProperties: false`,
//! maps carry only `additionalProperties`, optionals use `anyOf` with null.

use serde_json::{json, Map, Value};

use super::{Field, FieldType, Schema, SchemaError};

impl Schema {
    /// Render as a JSON schema object.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut property = field_type_to_json(&field.ty);
            if let Some(obj) = property.as_object_mut() {
                if let Some(description) = &field.description {
                    obj.insert("description".to_string(), json!(description));
                }
                if let Some(default) = &field.default {
                    obj.insert("default".to_string(), default.clone());
                }
            }
            properties.insert(field.name.clone(), property);
            if field.required {
                required.push(json!(field.name));
            }
        }

        let mut out = Map::new();
        if let Some(title) = &self.title {
            out.insert("title".to_string(), json!(title));
        }
        out.insert("type".to_string(), json!("object"));
        out.insert("properties".to_string(), Value::Object(properties));
        out.insert("required".to_string(), Value::Array(required));
        out.insert("additionalProperties".to_string(), json!(false));
        Value::Object(out)
    }

    /// Parse a JSON schema object produced by [`Schema::to_json_schema`] or a
    /// compatible generator.
    pub fn from_json_schema(value: &Value) -> Result<Self, SchemaError> {
        object_schema_from_json(value, "$")
    }
}

fn field_type_to_json(ty: &FieldType) -> Value {
    match ty {
        FieldType::String => json!({"type": "string"}),
        FieldType::Integer => json!({"type": "integer"}),
        FieldType::Number => json!({"type": "number"}),
        FieldType::Boolean => json!({"type": "boolean"}),
        FieldType::Any => json!({}),
        FieldType::Object(schema) => schema.to_json_schema(),
        FieldType::List(items) => json!({"type": "array", "items": field_type_to_json(items)}),
        FieldType::Map(values) => {
            json!({"type": "object", "additionalProperties": field_type_to_json(values)})
        }
        FieldType::Optional(inner) => {
            json!({"anyOf": [field_type_to_json(inner), {"type": "null"}]})
        }
        FieldType::Enum(values) => json!({ "enum": values }),
    }
}

fn invalid(path: &str, message: impl Into<String>) -> SchemaError {
    SchemaError::InvalidJsonSchema {
        path: path.to_string(),
        message: message.into(),
    }
}

fn object_schema_from_json(value: &Value, path: &str) -> Result<Schema, SchemaError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(path, "expected a schema object"))?;
    let properties = match obj.get("properties") {
        Some(Value::Object(props)) => props.clone(),
        Some(_) => return Err(invalid(path, "properties must be an object")),
        None => Map::new(),
    };
    let required: Vec<&str> = obj
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut fields = Vec::with_capacity(properties.len());
    for (name, property) in &properties {
        let field_path = format!("{}.{}", path, name);
        let ty = field_type_from_json(property, &field_path)?;
        let mut field = if required.contains(&name.as_str()) {
            Field::required(name.clone(), ty)
        } else {
            Field::optional(name.clone(), ty)
        };
        if let Some(description) = property.get("description").and_then(|v| v.as_str()) {
            field = field.with_description(description);
        }
        if let Some(default) = property.get("default") {
            field = field.with_default(default.clone());
        }
        fields.push(field);
    }

    let schema = Schema::new(fields)?;
    Ok(match obj.get("title").and_then(|v| v.as_str()) {
        Some(title) => schema.with_title(title),
        None => schema,
    })
}

fn field_type_from_json(value: &Value, path: &str) -> Result<FieldType, SchemaError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(path, "expected a type object"))?;

    if let Some(values) = obj.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| invalid(path, "enum must be an array"))?;
        return Ok(FieldType::Enum(values.clone()));
    }

    if let Some(variants) = obj.get("anyOf").and_then(|v| v.as_array()) {
        let non_null: Vec<&Value> = variants.iter().filter(|v| !is_null_type(v)).collect();
        return match (non_null.as_slice(), non_null.len() < variants.len()) {
            ([inner], true) => Ok(FieldType::optional(field_type_from_json(inner, path)?)),
            ([inner], false) => field_type_from_json(inner, path),
            _ => Err(invalid(path, "only anyOf[T, null] is supported")),
        };
    }

    match obj.get("type") {
        None => Ok(FieldType::Any),
        Some(Value::String(name)) => named_type(name, obj, value, path),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(|v| v.as_str()).collect();
            let non_null: Vec<&str> = names.iter().copied().filter(|n| *n != "null").collect();
            match non_null.as_slice() {
                [name] if names.len() == 2 => Ok(FieldType::optional(named_type(
                    name, obj, value, path,
                )?)),
                [name] => named_type(name, obj, value, path),
                _ => Err(invalid(path, "union types are not supported")),
            }
        }
        Some(_) => Err(invalid(path, "type must be a string or an array")),
    }
}

fn named_type(
    name: &str,
    obj: &Map<String, Value>,
    value: &Value,
    path: &str,
) -> Result<FieldType, SchemaError> {
    match name {
        "string" => Ok(FieldType::String),
        "integer" => Ok(FieldType::Integer),
        "number" => Ok(FieldType::Number),
        "boolean" => Ok(FieldType::Boolean),
        "array" => {
            let items = match obj.get("items") {
                Some(items) => field_type_from_json(items, &format!("{}[]", path))?,
                None => FieldType::Any,
            };
            Ok(FieldType::list(items))
        }
        "object" => {
            if obj.contains_key("properties") {
                return Ok(FieldType::Object(object_schema_from_json(value, path)?));
            }
            match obj.get("additionalProperties") {
                Some(Value::Object(values)) if !values.is_empty() => Ok(FieldType::map(
                    field_type_from_json(&Value::Object(values.clone()), path)?,
                )),
                _ => Ok(FieldType::map(FieldType::Any)),
            }
        }
        other => Err(invalid(path, format!("unsupported type '{}'", other))),
    }
}

fn is_null_type(value: &Value) -> bool {
    value.get("type").and_then(|v| v.as_str()) == Some("null")
}
