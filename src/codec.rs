//! JSON documents for grain state.
//!
//! A document is a JSON object holding the grain's fields plus the reserved
//! [`TYPE_FIELD`] naming the grain's logical type. Documents are always
//! written and read whole.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Reserved document field holding the grain's logical type name.
pub const TYPE_FIELD: &str = "_Type";

/// Untyped grain state: field name to value.
pub type GrainFields = Map<String, Value>;

/// A decoded document.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// The stored logical type name, if the document carries one.
    pub type_name: Option<String>,
    pub state: T,
}

/// Serializes `state` into a document tagged with `type_name`.
///
/// The state must serialize to a JSON object. An existing field named
/// [`TYPE_FIELD`] is overwritten.
pub fn encode<T: Serialize + ?Sized>(type_name: &str, state: &T) -> Result<String> {
    let mut fields = match serde_json::to_value(state)? {
        Value::Object(fields) => fields,
        other => {
            return Err(Error::MalformedDocument(format!(
                "grain state must serialize to a JSON object, got {}",
                kind(&other)
            )))
        }
    };
    fields.insert(TYPE_FIELD.to_string(), Value::String(type_name.to_string()));
    Ok(serde_json::to_string(&fields)?)
}

/// Parses a document into the target state shape.
pub fn decode<T: DeserializeOwned>(document: &str) -> Result<Decoded<T>> {
    let (type_name, fields) = parse_fields(document)?;
    let state = serde_json::from_value(Value::Object(fields)).map_err(|e| Error::MalformedDocument(e.to_string()))?;
    Ok(Decoded { type_name, state })
}

/// Applies the fields of a document onto `target`.
///
/// Fields the document does not carry keep their current values. On error
/// `target` is left untouched. Returns the stored type name.
pub fn apply<T: Serialize + DeserializeOwned>(document: &str, target: &mut T) -> Result<Option<String>> {
    let (type_name, fields) = parse_fields(document)?;

    let merged = match serde_json::to_value(&*target)? {
        Value::Object(mut current) => {
            current.extend(fields);
            current
        }
        _ => fields,
    };

    *target = serde_json::from_value(Value::Object(merged)).map_err(|e| Error::MalformedDocument(e.to_string()))?;
    Ok(type_name)
}

fn parse_fields(document: &str) -> Result<(Option<String>, GrainFields)> {
    let value: Value = serde_json::from_str(document).map_err(|e| Error::MalformedDocument(e.to_string()))?;
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => return Err(Error::MalformedDocument(format!("expected a JSON object, got {}", kind(&other)))),
    };

    let type_name = match fields.remove(TYPE_FIELD) {
        None => None,
        Some(Value::String(name)) => Some(name),
        Some(other) => {
            return Err(Error::MalformedDocument(format!("{} must be a string, got {}", TYPE_FIELD, kind(&other))))
        }
    };
    Ok((type_name, fields))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
