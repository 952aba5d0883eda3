//! Events handed to the output by the pipeline.

use crate::error::{StompError, StompResult};
use crate::template;
use serde_json::{Map, Value};

/// A processed pipeline event.
pub trait Event: Send + Sync {
    /// Substitute `%{field}` references with this event's field values.
    fn expand(&self, template: &str) -> String;

    /// Serialized message body.
    fn to_payload(&self) -> StompResult<Vec<u8>>;
}

/// An event backed by a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonEvent {
    fields: Map<String, Value>,
}

impl JsonEvent {
    /// Wrap a JSON value. Anything other than an object is rejected.
    pub fn new(value: Value) -> StompResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(StompError::Protocol(format!(
                "event must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Build an event from one input line.
    ///
    /// JSON object lines become the event's fields; anything else is kept
    /// as the `message` field. `@timestamp` is added when absent.
    pub fn from_line(line: &str) -> Self {
        let mut fields = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                let mut fields = Map::new();
                fields.insert("message".to_string(), Value::String(line.to_string()));
                fields
            }
        };
        fields
            .entry("@timestamp")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
        Self { fields }
    }

    /// Look up a field by reference (`name` or `[a][b]`).
    pub fn get(&self, reference: &str) -> Option<&Value> {
        let path = template::field_path(reference)?;
        let (first, rest) = path.split_first()?;
        let mut value = self.fields.get(*first)?;
        for segment in rest {
            value = match value {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Render a field value the way it appears inside an expanded template.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| render(item).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

impl Event for JsonEvent {
    fn expand(&self, template: &str) -> String {
        template::expand(template, |reference| self.get(reference).and_then(render))
    }

    fn to_payload(&self) -> StompResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}
