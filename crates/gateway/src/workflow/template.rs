//! Placeholder resolution for step inputs and outputs.
//!
//! Placeholders have the form `{{<namespace>.<path>}}` where the namespace
//! is one of:
//!
//! * `workflow.input` and `workflow.variables`
//! * `steps.<id>`
//! * `previous`
//!
//! A string consisting of exactly one placeholder resolves to the referenced
//! value with its JSON type intact. Placeholders embedded in longer strings
//! are substituted textually. Anything that does not resolve is left in
//! place verbatim.

use std::sync::LazyLock;

use conduit_core::{ExecutionContext, path};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
});

/// Root of a template path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Input,
    Variables,
    Step(&'a str),
    Previous,
}

/// A parsed placeholder: where to start and the dotted path below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplatePath<'a> {
    pub scope: Scope<'a>,
    pub path: &'a str,
}

impl<'a> TemplatePath<'a> {
    /// Parse the text between the braces. Unknown namespaces yield `None`.
    pub fn parse(expr: &'a str) -> Option<Self> {
        let (head, rest) = split_first(expr);
        let (scope, path) = match head {
            "workflow" => {
                let (kind, path) = split_first(rest);
                match kind {
                    "input" => (Scope::Input, path),
                    "variables" => (Scope::Variables, path),
                    _ => return None,
                }
            }
            "steps" => {
                let (id, path) = split_first(rest);
                if id.is_empty() {
                    return None;
                }
                (Scope::Step(id), path)
            }
            "previous" => (Scope::Previous, rest),
            _ => return None,
        };
        Some(Self { scope, path })
    }

    pub fn lookup<'c>(&self, context: &'c ExecutionContext) -> Option<&'c Value> {
        match self.scope {
            Scope::Input => path::lookup(&context.input, self.path),
            Scope::Previous => path::lookup(&context.previous, self.path),
            Scope::Variables => lookup_in_map(&context.variables, self.path),
            Scope::Step(id) => path::lookup(context.steps.get(id)?, self.path),
        }
    }
}

fn split_first(expr: &str) -> (&str, &str) {
    expr.split_once('.').unwrap_or((expr, ""))
}

fn lookup_in_map<'c>(map: &'c Map<String, Value>, at: &str) -> Option<&'c Value> {
    let (head, rest) = split_first(at);
    if head.is_empty() {
        return None;
    }
    path::lookup(map.get(head)?, rest)
}

/// Resolve every placeholder in `template` against `context`.
pub fn resolve_str(template: &str, context: &ExecutionContext) -> Value {
    if let Some(caps) = PLACEHOLDER.captures(template)
        && caps.get(0).is_some_and(|m| m.as_str() == template)
        && let Some(value) = resolve_expr(&caps[1], context)
    {
        return value.clone();
    }

    let replaced = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match resolve_expr(&caps[1], context) {
            Some(Value::String(s)) => s.clone(),
            Some(value) => value.to_string(),
            None => caps[0].to_owned(),
        }
    });
    Value::String(replaced.into_owned())
}

fn resolve_expr<'c>(expr: &str, context: &'c ExecutionContext) -> Option<&'c Value> {
    TemplatePath::parse(expr)?.lookup(context)
}

/// Resolve placeholders in every string nested in `value`.
pub fn resolve_value(value: &Value, context: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_str(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, context)).collect()),
        Value::Object(map) => Value::Object(resolve_map(map, context)),
        other => other.clone(),
    }
}

pub fn resolve_map(mapping: &Map<String, Value>, context: &ExecutionContext) -> Map<String, Value> {
    mapping
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, context)))
        .collect()
}
