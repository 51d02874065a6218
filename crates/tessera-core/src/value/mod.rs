//! Structural values
//!
//! A `StructuralValue` pairs a `Schema` with a JSON object that conforms to
//! it. Values are immutable: every update returns a new value.

pub(crate) mod validate;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::schema::{Schema, SchemaError};

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Path-qualified field name, e.g. `messages[1].role`.
    pub path: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// All violations found while validating a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn paths(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.path.as_str()).collect()
    }
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.path, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structural value errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("malformed portable value: {0}")]
    Format(String),
}

/// A (schema, data) pair where data conforms to schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralValue {
    schema: Schema,
    data: Map<String, Value>,
}

impl StructuralValue {
    /// Validate `data` against `schema` and build a value.
    ///
    /// Missing optional fields with defaults are filled, integral floats are
    /// coerced to integers. Fails listing every violated field.
    pub fn construct(schema: Schema, data: Value) -> Result<Self, ValidationError> {
        let Value::Object(obj) = data else {
            return Err(ValidationError {
                violations: vec![FieldViolation::new("$", "expected an object")],
            });
        };
        let mut violations = Vec::new();
        let normalized = validate::validate_object(&schema, &obj, "", &mut violations);
        if !violations.is_empty() {
            return Err(ValidationError { violations });
        }
        Ok(Self {
            schema,
            data: normalized,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    pub fn into_parts(self) -> (Schema, Map<String, Value>) {
        (self.schema, self.data)
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Functional update of a single field.
    pub fn update_field(&self, name: &str, value: Value) -> Result<Self, ValueError> {
        let field = self
            .schema
            .field(name)
            .ok_or_else(|| SchemaError::UnknownField(name.to_string()))?;
        let mut violations = Vec::new();
        let normalized = validate::validate_type(&field.ty, &value, name, &mut violations);
        if !violations.is_empty() {
            return Err(ValidationError { violations }.into());
        }
        let mut data = self.data.clone();
        data.insert(name.to_string(), normalized);
        Ok(Self {
            schema: self.schema.clone(),
            data,
        })
    }

    /// Compose both schemas and union the data. On a shared field the
    /// right-hand value wins.
    pub fn concat(&self, other: &StructuralValue) -> Result<Self, ValueError> {
        let schema = self.schema.compose(&other.schema)?;
        let mut data = self.data.clone();
        for (key, value) in &other.data {
            data.insert(key.clone(), value.clone());
        }
        Ok(Self::construct(schema, Value::Object(data))?)
    }

    /// Remove fields from both schema and data.
    pub fn project<I, S>(&self, fields: I) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schema = self.schema.mask(fields)?;
        Ok(self.restrict(schema))
    }

    /// Keep only the named fields in both schema and data.
    pub fn keep<I, S>(&self, fields: I) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schema = self.schema.keep(fields)?;
        Ok(self.restrict(schema))
    }

    fn restrict(&self, schema: Schema) -> Self {
        let data = self
            .data
            .iter()
            .filter(|(k, _)| schema.has_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { schema, data }
    }

    /// Portable `{"schema": ..., "data": ...}` representation.
    pub fn to_map(&self) -> Value {
        json!({
            "schema": self.schema.to_json_schema(),
            "data": Value::Object(self.data.clone()),
        })
    }

    pub fn from_map(map: &Value) -> Result<Self, ValueError> {
        let schema = map
            .get("schema")
            .ok_or_else(|| ValueError::Format("missing 'schema'".to_string()))?;
        let data = map
            .get("data")
            .ok_or_else(|| ValueError::Format("missing 'data'".to_string()))?;
        let schema = Schema::from_json_schema(schema)?;
        Ok(Self::construct(schema, data.clone())?)
    }
}

impl AsRef<Schema> for StructuralValue {
    fn as_ref(&self) -> &Schema {
        &self.schema
    }
}
