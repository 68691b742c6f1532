//! Authentication metadata.
//!
//! Metadata produced by an authenticator has three sections:
//!
//! | Key | Contents | Exposure |
//! |-----|----------|----------|
//! | `public` | any JSON | safe to echo in responses |
//! | `tracing` | object of scalar attributes | attached to spans and logs |
//! | `private` | any JSON | only used for authorization decisions |
//!
//! The raw object is kept for expression evaluation. Cache keys are derived
//! from [`canonical_json`], which sorts object keys recursively.

use serde_json::{Map, Value};

use crate::error::{AuthError, Result};

const PUBLIC: &str = "public";
const PRIVATE: &str = "private";
const TRACING: &str = "tracing";

/// Immutable identity record produced by an authenticator.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticationMetadata {
    raw: Value,
}

impl AuthenticationMetadata {
    /// Validates and wraps a raw metadata object.
    ///
    /// `null` is accepted as empty metadata.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if `raw` is not an object, has
    /// keys other than `public`, `private` and `tracing`, or has tracing
    /// attributes that are not strings, numbers or booleans.
    pub fn from_raw(raw: Value) -> Result<Self> {
        let object = match raw {
            Value::Null => return Ok(Self::empty()),
            Value::Object(object) => object,
            other => {
                return Err(AuthError::invalid_argument(format!(
                    "Authentication metadata must be an object, got {}",
                    json_type_name(&other)
                )));
            },
        };

        if let Some(key) = object.keys().find(|key| ![PUBLIC, PRIVATE, TRACING].contains(&key.as_str()))
        {
            return Err(AuthError::invalid_argument(format!(
                "Unknown authentication metadata field {key:?}"
            )));
        }

        match object.get(TRACING) {
            None | Some(Value::Null) => {},
            Some(Value::Object(attributes)) => {
                if let Some((name, _)) = attributes
                    .iter()
                    .find(|(_, value)| !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)))
                {
                    return Err(AuthError::invalid_argument(format!(
                        "Tracing attribute {name:?} must be a string, number or boolean"
                    )));
                }
            },
            Some(other) => {
                return Err(AuthError::invalid_argument(format!(
                    "Tracing metadata must be an object, got {}",
                    json_type_name(other)
                )));
            },
        }

        Ok(Self { raw: Value::Object(object) })
    }

    /// Returns metadata with all sections absent.
    #[must_use]
    pub fn empty() -> Self {
        Self { raw: Value::Object(Map::new()) }
    }

    /// Returns the public section, if present.
    pub fn public(&self) -> Option<&Value> {
        self.section(PUBLIC)
    }

    /// Returns the private section, if present.
    pub fn private(&self) -> Option<&Value> {
        self.section(PRIVATE)
    }

    /// Returns the tracing attributes.
    pub fn tracing_attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.section(TRACING)
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|attributes| attributes.iter().map(|(name, value)| (name.as_str(), value)))
    }

    /// Returns the raw metadata object used as expression input.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Returns the canonical serialization of all sections.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json(&self.raw)
    }

    /// Returns the canonical serialization with the tracing section removed.
    ///
    /// Tracing attributes do not influence decisions, so cache keys use this
    /// form.
    pub fn canonical_bytes_without_tracing(&self) -> Vec<u8> {
        match &self.raw {
            Value::Object(object) if object.contains_key(TRACING) => {
                let mut object = object.clone();
                object.remove(TRACING);
                canonical_json(&Value::Object(object))
            },
            raw => canonical_json(raw),
        }
    }

    fn section(&self, name: &str) -> Option<&Value> {
        self.raw.get(name).filter(|value| !value.is_null())
    }
}

/// Serializes `value` with object keys sorted at every level.
///
/// The output is stable across processes and independent of the order in
/// which object keys were inserted.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    sorted(value).to_string().into_bytes()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let mut result = Map::with_capacity(object.len());
            for key in keys {
                if let Some(child) = object.get(key) {
                    result.insert(key.clone(), sorted(child));
                }
            }
            Value::Object(result)
        },
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        scalar => scalar.clone(),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
