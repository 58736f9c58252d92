use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved field naming the worker a message came from or is meant for.
pub const SERVER_TAG: &str = "_server";

/// One JSON object exchanged with a worker or the outward channel.
///
/// The payload is opaque; only [`SERVER_TAG`] is ever read or written here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Parse one line or frame. Anything but a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self, String> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(other) => Err(format!("expected a JSON object, got {}", kind_of(&other))),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }

    /// Value of `_server` when it is a string.
    pub fn tag(&self) -> Option<&str> {
        self.fields.get(SERVER_TAG).and_then(Value::as_str)
    }

    /// Returns a copy tagged with `worker`, overwriting any previous tag.
    pub fn tagged(mut self, worker: &str) -> Self {
        self.fields
            .insert(SERVER_TAG.to_string(), Value::String(worker.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.fields
    }
}

impl TryFrom<Value> for Message {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(format!("expected a JSON object, got {}", kind_of(&other))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
