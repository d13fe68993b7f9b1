use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Externally defined design document.
///
/// The orchestrator only looks at `design_id` (asset naming) and
/// `design_text` (round-tripped through mutation); every other field is
/// carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Design(Map<String, Value>);

impl Design {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Non-empty `design_id`, if present. Numeric ids are rendered as text.
    pub fn design_id(&self) -> Option<String> {
        match self.0.get("design_id")? {
            Value::String(id) => {
                let trimmed = id.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn design_text(&self) -> Option<&str> {
        self.0.get("design_text").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.0)
    }
}
