use conduit_core::Event;
use serde::Deserialize;
use serde_json::Value;

use crate::error::BusError;

/// Declared shape of one event type.
///
/// `schema` is a JSON Schema document applied to the event payload. When
/// `version` is set, events must also carry that metadata version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSchema {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub schema: Value,
}

impl EventSchema {
    /// Schema requiring the payload to be an object with the given fields.
    pub fn required_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: Vec<Value> = fields.into_iter().map(|f| Value::String(f.into())).collect();
        Self {
            version: None,
            schema: serde_json::json!({ "type": "object", "required": required }),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }
}

pub(crate) struct CompiledSchema {
    version: Option<u32>,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub(crate) fn compile(event_type: &str, schema: &EventSchema) -> Result<Self, BusError> {
        let document = if schema.schema.is_null() {
            serde_json::json!({})
        } else {
            schema.schema.clone()
        };
        let validator =
            jsonschema::validator_for(&document).map_err(|e| BusError::InvalidSchema {
                event_type: event_type.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            version: schema.version,
            validator,
        })
    }

    pub(crate) fn check(&self, event: &Event) -> Result<(), BusError> {
        let violation = |reason: String| BusError::SchemaViolation {
            event_type: event.event_type.clone(),
            reason,
        };

        if let Some(expected) = self.version
            && event.metadata.version != expected
        {
            return Err(violation(format!(
                "expected version {expected}, got {}",
                event.metadata.version
            )));
        }

        if let Some(error) = self.validator.iter_errors(&event.payload).next() {
            return Err(violation(error.to_string()));
        }
        Ok(())
    }
}
