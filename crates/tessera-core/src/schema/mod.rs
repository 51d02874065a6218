//! Schema engine
//!
//! Structural description of a typed record:
//! - `FieldType`: type descriptor of a single field
//! - `Field`: named field with required flag, default and description
//! - `Schema`: ordered, duplicate-free field set
//!
//! Identity is structural. Two schemas built independently with the same
//! field set are equal regardless of field order, title or descriptions.

mod json;

use serde_json::Value;
use thiserror::Error;

use crate::value::validate::validate_type;

/// Schema engine errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("conflicting definitions for field '{field}': {left} vs {right}")]
    Conflict {
        field: String,
        left: String,
        right: String,
    },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("duplicate field: {0}")]
    DuplicateField(String),

    #[error("invalid json schema at '{path}': {message}")]
    InvalidJsonSchema { path: String, message: String },

    #[error("invalid default for field '{field}': {message}")]
    InvalidDefault { field: String, message: String },
}

/// Type descriptor of a schema field.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Any,
    Object(Schema),
    List(Box<FieldType>),
    /// Map with string keys.
    Map(Box<FieldType>),
    Optional(Box<FieldType>),
    Enum(Vec<Value>),
}

impl FieldType {
    pub fn list(items: FieldType) -> Self {
        Self::List(Box::new(items))
    }

    pub fn map(values: FieldType) -> Self {
        Self::Map(Box::new(values))
    }

    pub fn optional(inner: FieldType) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn string_enum<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(
            values
                .into_iter()
                .map(|v| Value::String(v.into()))
                .collect(),
        )
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::String | Self::Integer | Self::Number | Self::Boolean
        )
    }

    /// Short human-readable name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Any => "any".to_string(),
            Self::Object(schema) => format!("object{{{}}}", schema.field_names().join(",")),
            Self::List(items) => format!("list<{}>", items.describe()),
            Self::Map(values) => format!("map<{}>", values.describe()),
            Self::Optional(inner) => format!("optional<{}>", inner.describe()),
            Self::Enum(values) => format!(
                "enum[{}]",
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    /// Whether a JSON literal is a valid instance of this primitive type.
    pub fn accepts_literal(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Any => true,
            _ => false,
        }
    }

    /// Equal-or-narrower relation used by containment checks.
    pub fn is_narrower_than(&self, wider: &FieldType) -> bool {
        match (self, wider) {
            (_, Self::Any) => true,
            (Self::Optional(a), Self::Optional(b)) => a.is_narrower_than(b),
            (Self::Optional(_), _) => false,
            (narrow, Self::Optional(b)) => narrow.is_narrower_than(b),
            (Self::String, Self::String)
            | (Self::Integer, Self::Integer)
            | (Self::Number, Self::Number)
            | (Self::Boolean, Self::Boolean)
            | (Self::Integer, Self::Number) => true,
            (Self::Enum(a), Self::Enum(b)) => a
                .iter()
                .all(|v| b.iter().any(|w| literal_eq(v, w))),
            (Self::Enum(a), primitive) if primitive.is_primitive() => {
                a.iter().all(|v| primitive.accepts_literal(v))
            }
            (Self::List(a), Self::List(b)) => a.is_narrower_than(b),
            (Self::Map(a), Self::Map(b)) => a.is_narrower_than(b),
            (Self::Object(a), Self::Object(b)) => a.contains(b),
            _ => false,
        }
    }
}

impl PartialEq for FieldType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String, Self::String)
            | (Self::Integer, Self::Integer)
            | (Self::Number, Self::Number)
            | (Self::Boolean, Self::Boolean)
            | (Self::Any, Self::Any) => true,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::List(a), Self::List(b))
            | (Self::Map(a), Self::Map(b))
            | (Self::Optional(a), Self::Optional(b)) => a == b,
            (Self::Enum(a), Self::Enum(b)) => {
                let count = |values: &[Value], v: &Value| {
                    values.iter().filter(|w| literal_eq(v, *w)).count()
                };
                a.len() == b.len() && a.iter().all(|v| count(a, v) == count(b, v))
            }
            _ => false,
        }
    }
}

/// JSON literal equality where `1` and `1.0` compare equal.
pub(crate) fn literal_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn check_default(field: &Field, default: &Value) -> Result<(), SchemaError> {
    let mut violations = Vec::new();
    validate_type(&field.ty, default, &field.name, &mut violations);
    if violations.is_empty() {
        return Ok(());
    }
    Err(SchemaError::InvalidDefault {
        field: field.name.clone(),
        message: violations
            .iter()
            .map(|v| format!("{}: {}", v.path, v.message))
            .collect::<Vec<_>>()
            .join("; "),
    })
}

/// A named schema field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl Field {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ty == other.ty
            && self.required == other.required
            && self.default == other.default
    }
}

/// Immutable structural record description.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    title: Option<String>,
    fields: Vec<Field>,
}

impl Schema {
    /// Build a schema, rejecting duplicate field names and defaults that do
    /// not conform to their field type.
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self, SchemaError> {
        let mut collected: Vec<Field> = Vec::new();
        for field in fields {
            if collected.iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField(field.name));
            }
            if let Some(default) = &field.default {
                check_default(&field, default)?;
            }
            collected.push(field);
        }
        Ok(Self {
            title: None,
            fields: collected,
        })
    }

    /// Build a schema from fields known to be unique.
    pub(crate) fn from_unique(title: &str, fields: Vec<Field>) -> Self {
        debug_assert!(Self::new(fields.clone()).is_ok());
        Self {
            title: Some(title.to_string()),
            fields,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge two schemas field-wise.
    ///
    /// Left fields keep their order, right-only fields are appended. A shared
    /// field must carry equal types on both sides; its `required` flag is the
    /// OR of both.
    pub fn compose(&self, other: &Schema) -> Result<Schema, SchemaError> {
        let mut fields = self.fields.clone();
        for right in &other.fields {
            match fields.iter_mut().find(|f| f.name == right.name) {
                Some(left) => {
                    if left.ty != right.ty {
                        return Err(SchemaError::Conflict {
                            field: right.name.clone(),
                            left: left.ty.describe(),
                            right: right.ty.describe(),
                        });
                    }
                    left.required |= right.required;
                    if left.default.is_none() {
                        left.default = right.default.clone();
                    }
                    if left.description.is_none() {
                        left.description = right.description.clone();
                    }
                }
                None => fields.push(right.clone()),
            }
        }
        Ok(Schema {
            title: self.title.clone().or_else(|| other.title.clone()),
            fields,
        })
    }

    /// Structural "is-a": every field of `needle` exists here with an
    /// equal-or-narrower type, and required needle fields are required here.
    pub fn contains(&self, needle: &Schema) -> bool {
        needle.fields.iter().all(|wanted| match self.field(&wanted.name) {
            Some(found) => {
                (!wanted.required || found.required) && found.ty.is_narrower_than(&wanted.ty)
            }
            None => false,
        })
    }

    /// Remove the named fields.
    pub fn mask<I, S>(&self, names: I) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.resolve_names(names)?;
        Ok(Schema {
            title: self.title.clone(),
            fields: self
                .fields
                .iter()
                .filter(|f| !names.contains(&f.name))
                .cloned()
                .collect(),
        })
    }

    /// Keep only the named fields.
    pub fn keep<I, S>(&self, names: I) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.resolve_names(names)?;
        Ok(Schema {
            title: self.title.clone(),
            fields: self
                .fields
                .iter()
                .filter(|f| names.contains(&f.name))
                .cloned()
                .collect(),
        })
    }

    fn resolve_names<I, S>(&self, names: I) -> Result<Vec<String>, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                if self.has_field(name) {
                    Ok(name.to_string())
                } else {
                    Err(SchemaError::UnknownField(name.to_string()))
                }
            })
            .collect()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|f| other.field(&f.name).is_some_and(|g| f == g))
    }
}

impl AsRef<Schema> for Schema {
    fn as_ref(&self) -> &Schema {
        self
    }
}

/// Free-function form of [`Schema::compose`].
pub fn compose(a: &Schema, b: &Schema) -> Result<Schema, SchemaError> {
    a.compose(b)
}

/// Free-function form of [`Schema::contains`].
pub fn contains(haystack: &Schema, needle: &Schema) -> bool {
    haystack.contains(needle)
}

/// Free-function form of [`Schema::mask`].
pub fn mask<I, S>(schema: &Schema, fields_to_remove: I) -> Result<Schema, SchemaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    schema.mask(fields_to_remove)
}
