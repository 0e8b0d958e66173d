//! Normalization of successful response data.
//!
//! Data that is not a JSON object is first wrapped as `{"result": data}`.
//! Then every rule whose system and operation globs match is applied in
//! declaration order. Operations referencing missing paths are no-ops, so a
//! rule never fails a response.

use conduit_core::path;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};

use crate::error::GatewayError;
use crate::glob::Glob;

/// Stage name recorded when non-object data is wrapped.
pub const WRAP_STAGE: &str = "wrap_result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Rename { from: String, to: String },
    Copy { from: String, to: String },
    Remove { path: String },
    /// Set `path` to `value` unless it already holds a non-null value.
    Default { path: String, value: Value },
    /// Reduce the array at `source` (optionally a field of each element)
    /// into `target`.
    Aggregate {
        source: String,
        #[serde(default)]
        field: Option<String>,
        function: Aggregation,
        target: String,
    },
}

impl TransformOp {
    fn apply(&self, data: &mut Value) {
        match self {
            Self::Rename { from, to } => {
                if let Some(value) = path::remove(data, from) {
                    path::insert(data, to, value);
                }
            }
            Self::Copy { from, to } => {
                if let Some(value) = path::lookup(data, from).cloned() {
                    path::insert(data, to, value);
                }
            }
            Self::Remove { path: at } => {
                path::remove(data, at);
            }
            Self::Default { path: at, value } => {
                if path::lookup(data, at).is_none_or(Value::is_null) {
                    path::insert(data, at, value.clone());
                }
            }
            Self::Aggregate {
                source,
                field,
                function,
                target,
            } => {
                let Some(Value::Array(items)) = path::lookup(data, source) else {
                    return;
                };
                let result = aggregate(items, field.as_deref(), *function);
                path::insert(data, target, result);
            }
        }
    }
}

fn aggregate(items: &[Value], field: Option<&str>, function: Aggregation) -> Value {
    let selected: Vec<&Value> = items
        .iter()
        .filter_map(|item| match field {
            Some(f) => path::lookup(item, f),
            None => Some(item),
        })
        .collect();

    let numbers: Vec<f64> = selected.iter().filter_map(|v| v.as_f64()).collect();
    #[allow(clippy::cast_precision_loss)]
    let result = match function {
        Aggregation::Count => return json!(selected.len()),
        Aggregation::Sum => numbers.iter().sum(),
        _ if numbers.is_empty() => return Value::Null,
        Aggregation::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        Aggregation::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Number::from_f64(result).map_or(Value::Null, Value::Number)
}

/// A named group of operations, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    pub name: String,
    #[serde(default = "match_all")]
    pub system: String,
    #[serde(default = "match_all")]
    pub operation: String,
    #[serde(default)]
    pub ops: Vec<TransformOp>,
}

fn match_all() -> String {
    "*".to_owned()
}

impl TransformRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: match_all(),
            operation: match_all(),
            ops: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    #[must_use]
    pub fn for_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    #[must_use]
    pub fn op(mut self, op: TransformOp) -> Self {
        self.ops.push(op);
        self
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: TransformRule,
    system: Glob,
    operation: Glob,
}

/// Output of [`ResponseTransformer::transform`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub data: Value,
    /// Applied stages, in order.
    pub trace: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ResponseTransformer {
    rules: Vec<CompiledRule>,
}

impl ResponseTransformer {
    pub fn new(rules: Vec<TransformRule>) -> Result<Self, GatewayError> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    system: Glob::new(&rule.system)?,
                    operation: Glob::new(&rule.operation)?,
                    rule,
                })
            })
            .collect::<Result<_, GatewayError>>()?;
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn transform(&self, system: &str, operation: &str, data: Value) -> Transformed {
        let mut trace = Vec::new();
        let mut data = match data {
            Value::Object(_) => data,
            other => {
                trace.push(WRAP_STAGE.to_owned());
                json!({ "result": other })
            }
        };

        for compiled in &self.rules {
            if !compiled.system.matches(system) || !compiled.operation.matches(operation) {
                continue;
            }
            for op in &compiled.rule.ops {
                op.apply(&mut data);
            }
            trace.push(compiled.rule.name.clone());
        }

        Transformed { data, trace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_wrapped() {
        let out = ResponseTransformer::default().transform("cns", "cns.validate", json!(true));
        assert_eq!(out.data, json!({"result": true}));
        assert_eq!(out.trace, [WRAP_STAGE]);

        let out = ResponseTransformer::default().transform("cns", "cns.validate", json!({"ok": 1}));
        assert!(out.trace.is_empty());
    }

    #[test]
    fn field_operations() {
        let rule = TransformRule::new("tidy")
            .op(TransformOp::Rename {
                from: "res.valid".into(),
                to: "valid".into(),
            })
            .op(TransformOp::Copy {
                from: "res.score".into(),
                to: "summary.score".into(),
            })
            .op(TransformOp::Remove { path: "debug".into() })
            .op(TransformOp::Default {
                path: "warnings".into(),
                value: json!([]),
            });
        let transformer = ResponseTransformer::new(vec![rule]).unwrap();
        let out = transformer.transform(
            "cns",
            "cns.validate",
            json!({"res": {"valid": true, "score": 0.9}, "debug": "x"}),
        );
        assert_eq!(
            out.data,
            json!({"res": {"score": 0.9}, "valid": true, "summary": {"score": 0.9}, "warnings": []})
        );
        assert_eq!(out.trace, ["tidy"]);
    }

    #[test]
    fn aggregations() {
        let items = json!({"items": [{"price": 10}, {"price": 30}, {"name": "free"}]});
        let agg = |function, target: &str| TransformOp::Aggregate {
            source: "items".into(),
            field: Some("price".into()),
            function,
            target: target.into(),
        };
        let rule = TransformRule::new("stats")
            .op(agg(Aggregation::Count, "stats.count"))
            .op(agg(Aggregation::Sum, "stats.sum"))
            .op(agg(Aggregation::Avg, "stats.avg"))
            .op(agg(Aggregation::Min, "stats.min"))
            .op(agg(Aggregation::Max, "stats.max"));
        let out = ResponseTransformer::new(vec![rule])
            .unwrap()
            .transform("marketplace", "marketplace.search", items);
        assert_eq!(out.data["stats"]["count"], 2);
        assert_eq!(out.data["stats"]["sum"], 40.0);
        assert_eq!(out.data["stats"]["avg"], 20.0);
        assert_eq!(out.data["stats"]["min"], 10.0);
        assert_eq!(out.data["stats"]["max"], 30.0);
    }

    #[test]
    fn rules_match_by_system_and_operation() {
        let rules = vec![
            TransformRule::new("cns-only").for_system("cns").op(TransformOp::Default {
                path: "checked".into(),
                value: json!(true),
            }),
            TransformRule::new("search-only")
                .for_operation("*.search")
                .op(TransformOp::Default {
                    path: "page".into(),
                    value: json!(1),
                }),
        ];
        let transformer = ResponseTransformer::new(rules).unwrap();

        let out = transformer.transform("marketplace", "marketplace.search", json!({}));
        assert_eq!(out.data, json!({"page": 1}));
        assert_eq!(out.trace, ["search-only"]);

        let out = transformer.transform("cns", "cns.validate", json!([1]));
        assert_eq!(out.data, json!({"result": [1], "checked": true}));
        assert_eq!(out.trace, [WRAP_STAGE, "cns-only"]);
    }

    #[test]
    fn rules_deserialize_from_config() {
        let rule: TransformRule = serde_json::from_value(json!({
            "name": "rename",
            "system": "bytestar",
            "ops": [{"op": "rename", "from": "out", "to": "content"}]
        }))
        .unwrap();
        assert_eq!(rule.operation, "*");
        assert_eq!(
            rule.ops[0],
            TransformOp::Rename {
                from: "out".into(),
                to: "content".into()
            }
        );
    }
}
