use serde_json::{Map, Value};

use crate::errors::ODataError;
use crate::ODataResult;

use super::{Deserializer, DeserializerContext, PayloadKind};

/// Reads a single entity body into its structural properties.
///
/// Instance annotations (`@odata.type`) and property annotations (`Name@odata.type`)
/// are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceDeserializer;

impl Deserializer for ResourceDeserializer {
    type Output = Map<String, Value>;

    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Resource
    }

    fn read(&self, body: &[u8], _ctx: &DeserializerContext<'_>) -> ODataResult<Self::Output> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Object(object) => Ok(object
                .into_iter()
                .filter(|(name, _)| !name.contains('@'))
                .collect()),
            other => Err(ODataError::Serialization(format!(
                "Expected a JSON object for a resource, found {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
