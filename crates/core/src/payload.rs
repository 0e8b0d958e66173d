use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Typed request payloads.
///
/// The variant a request must carry is determined by its operation name, see
/// [`PayloadKind::for_operation`]. Untyped JSON entering the system (HTTP
/// ingress, workflow step inputs) is decoded with [`Payload::from_operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Document validation (`*.validate-*`, semantic checks).
    Validation(ValidationPayload),
    /// Content generation or enhancement.
    Generation(GenerationPayload),
    /// Catalog search.
    Search(SearchPayload),
    /// Purchase of a catalog item.
    Purchase(PurchasePayload),
    /// Anything else; passed through untouched.
    Generic(Value),
}

/// Payload for validation operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPayload {
    /// The document under validation.
    pub document: Value,
    /// Named rule sets to apply.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Fail on warnings as well as errors.
    #[serde(default)]
    pub strict: bool,
}

/// Payload for generation and enhancement operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub prompt: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Payload for search operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPayload {
    pub query: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Payload for purchase operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasePayload {
    pub item_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub buyer: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

/// Discriminant of [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Validation,
    Generation,
    Search,
    Purchase,
    Generic,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Generation => "generation",
            Self::Search => "search",
            Self::Purchase => "purchase",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

impl PayloadKind {
    /// The payload kind an operation expects, decided by keywords in its
    /// action part (`marketplace.search` → [`PayloadKind::Search`]).
    pub fn for_operation(operation: &str) -> Self {
        let action = operation
            .split_once('.')
            .map_or(operation, |(_, action)| action)
            .to_ascii_lowercase();

        if action.contains("validate") {
            Self::Validation
        } else if action.contains("generate") || action.contains("enhance") {
            Self::Generation
        } else if action.contains("search") {
            Self::Search
        } else if action.contains("purchase") {
            Self::Purchase
        } else {
            Self::Generic
        }
    }
}

impl Payload {
    /// Decode untyped JSON into the variant `operation` expects.
    pub fn from_operation(operation: &str, value: Value) -> Result<Self, CoreError> {
        let invalid = |e: serde_json::Error| CoreError::InvalidPayload {
            operation: operation.to_owned(),
            reason: e.to_string(),
        };
        let payload = match PayloadKind::for_operation(operation) {
            PayloadKind::Validation => Self::Validation(serde_json::from_value(value).map_err(invalid)?),
            PayloadKind::Generation => Self::Generation(serde_json::from_value(value).map_err(invalid)?),
            PayloadKind::Search => Self::Search(serde_json::from_value(value).map_err(invalid)?),
            PayloadKind::Purchase => Self::Purchase(serde_json::from_value(value).map_err(invalid)?),
            PayloadKind::Generic => Self::Generic(value),
        };
        Ok(payload)
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Validation(_) => PayloadKind::Validation,
            Self::Generation(_) => PayloadKind::Generation,
            Self::Search(_) => PayloadKind::Search,
            Self::Purchase(_) => PayloadKind::Purchase,
            Self::Generic(_) => PayloadKind::Generic,
        }
    }

    /// The payload body as plain JSON, without the kind tag.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::Validation(p) => serde_json::to_value(p),
            Self::Generation(p) => serde_json::to_value(p),
            Self::Search(p) => serde_json::to_value(p),
            Self::Purchase(p) => serde_json::to_value(p),
            Self::Generic(v) => return v.clone(),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Check that the payload fits `operation` and carries usable values.
    pub fn validate_for(&self, operation: &str) -> Result<(), CoreError> {
        let invalid = |reason: String| CoreError::InvalidPayload {
            operation: operation.to_owned(),
            reason,
        };

        let expected = PayloadKind::for_operation(operation);
        if expected != PayloadKind::Generic && self.kind() != expected {
            return Err(invalid(format!(
                "expected {expected} payload, got {}",
                self.kind()
            )));
        }

        match self {
            Self::Generation(p) if p.prompt.trim().is_empty() => {
                Err(invalid("prompt must not be empty".into()))
            }
            Self::Search(p) if p.query.trim().is_empty() => {
                Err(invalid("query must not be empty".into()))
            }
            Self::Search(p) if p.limit == Some(0) => {
                Err(invalid("limit must be positive".into()))
            }
            Self::Purchase(p) if p.item_id.trim().is_empty() => {
                Err(invalid("item_id must not be empty".into()))
            }
            Self::Purchase(p) if p.quantity == 0 => {
                Err(invalid("quantity must be positive".into()))
            }
            Self::Validation(p) if p.document.is_null() => {
                Err(invalid("document must not be null".into()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Generic(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_follows_action_keywords() {
        assert_eq!(PayloadKind::for_operation("cns.validate-uhft"), PayloadKind::Validation);
        assert_eq!(PayloadKind::for_operation("bytestar.ai-enhance"), PayloadKind::Generation);
        assert_eq!(PayloadKind::for_operation("marketplace.search"), PayloadKind::Search);
        assert_eq!(PayloadKind::for_operation("marketplace.purchase"), PayloadKind::Purchase);
        assert_eq!(PayloadKind::for_operation("marketplace.list"), PayloadKind::Generic);
    }

    #[test]
    fn kind_ignores_system_prefix() {
        // "search" in the system name must not make the action a search.
        assert_eq!(PayloadKind::for_operation("search-index.rebuild"), PayloadKind::Generic);
    }

    #[test]
    fn decode_typed_payload() {
        let payload =
            Payload::from_operation("marketplace.search", json!({"query": "gpu", "limit": 5}))
                .unwrap();
        let Payload::Search(search) = payload else {
            panic!("expected search payload");
        };
        assert_eq!(search.query, "gpu");
        assert_eq!(search.limit, Some(5));
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let err = Payload::from_operation("marketplace.purchase", json!({"query": "gpu"}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));
    }

    #[test]
    fn purchase_quantity_defaults_to_one() {
        let payload =
            Payload::from_operation("marketplace.purchase", json!({"item_id": "sku-1"})).unwrap();
        assert!(matches!(payload, Payload::Purchase(PurchasePayload { quantity: 1, .. })));
    }

    #[test]
    fn validate_rejects_kind_mismatch() {
        let payload = Payload::Generic(json!({"query": "gpu"}));
        assert!(payload.validate_for("marketplace.search").is_err());
    }

    #[test]
    fn validate_accepts_any_kind_for_generic_operations() {
        let payload = Payload::Search(SearchPayload {
            query: "gpu".into(),
            filters: Map::new(),
            limit: None,
        });
        assert!(payload.validate_for("analytics.report").is_ok());
    }

    #[test]
    fn validate_rejects_empty_prompt() {
        let payload = Payload::Generation(GenerationPayload {
            prompt: "  ".into(),
            parameters: Map::new(),
        });
        assert!(payload.validate_for("bytestar.generate").is_err());
    }

    #[test]
    fn to_value_drops_the_tag() {
        let payload =
            Payload::from_operation("bytestar.generate", json!({"prompt": "hi"})).unwrap();
        assert_eq!(payload.to_value(), json!({"prompt": "hi", "parameters": {}}));
    }

    #[test]
    fn serde_uses_kind_and_data() {
        let payload = Payload::Generic(json!({"a": 1}));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, json!({"kind": "generic", "data": {"a": 1}}));
    }
}
