//! Operation to system resolution.
//!
//! Resolution order: explicit target, rules by descending priority, the
//! `<system>.` operation prefix, keyword routes, the default system.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use conduit_core::{Request, SystemId, path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;
use crate::glob::Glob;

/// Predicate over a request, for conditions config cannot express.
pub type RequestPredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// An extra requirement on a rule.
#[derive(Clone)]
pub enum RouteCondition {
    /// `request.metadata.tags[key] == value`.
    Tag { key: String, value: String },
    /// Dotted path into the payload JSON equals `value`.
    PayloadField { path: String, value: Value },
    Custom(RequestPredicate),
}

impl RouteCondition {
    fn holds(&self, request: &Request) -> bool {
        match self {
            Self::Tag { key, value } => request.metadata.tags.get(key) == Some(value),
            Self::PayloadField { path: field, value } => {
                let payload = request.payload.to_value();
                path::lookup(&payload, field) == Some(value)
            }
            Self::Custom(predicate) => predicate(request),
        }
    }
}

impl fmt::Debug for RouteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag { key, value } => write!(f, "Tag({key}={value})"),
            Self::PayloadField { path, value } => write!(f, "PayloadField({path}={value})"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Declarative form of a [`RoutingRule`], as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleSpec {
    pub pattern: String,
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub payload: std::collections::BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pattern: Glob,
    target: SystemId,
    priority: i32,
    conditions: Vec<RouteCondition>,
}

impl RoutingRule {
    pub fn new(pattern: &str, target: impl Into<SystemId>, priority: i32) -> Result<Self, GatewayError> {
        Ok(Self {
            pattern: Glob::new(pattern)?,
            target: target.into(),
            priority,
            conditions: Vec::new(),
        })
    }

    pub fn from_spec(spec: &RoutingRuleSpec) -> Result<Self, GatewayError> {
        let mut rule = Self::new(&spec.pattern, spec.target.as_str(), spec.priority)?;
        for (key, value) in &spec.tags {
            rule = rule.when(RouteCondition::Tag {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for (field, value) in &spec.payload {
            rule = rule.when(RouteCondition::PayloadField {
                path: field.clone(),
                value: value.clone(),
            });
        }
        Ok(rule)
    }

    #[must_use]
    pub fn when(mut self, condition: RouteCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn target(&self) -> &SystemId {
        &self.target
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    fn applies(&self, request: &Request) -> bool {
        self.pattern.matches(&request.operation) && self.conditions.iter().all(|c| c.holds(request))
    }
}

/// A keyword heuristic: operations mentioning `keyword` go to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRoute {
    pub keyword: String,
    pub target: String,
}

impl KeywordRoute {
    pub fn new(keyword: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            target: target.into(),
        }
    }

    /// Case-insensitive substring match against the whole operation.
    fn matches(&self, operation: &str) -> bool {
        operation
            .to_ascii_lowercase()
            .contains(&self.keyword.to_ascii_lowercase())
    }
}

/// The built-in keyword table.
pub fn default_keyword_routes() -> Vec<KeywordRoute> {
    [
        ("validate", "cns"),
        ("semantic", "cns"),
        ("ai", "bytestar"),
        ("enhance", "bytestar"),
        ("generate", "bytestar"),
        ("search", "marketplace"),
        ("purchase", "marketplace"),
    ]
    .into_iter()
    .map(|(k, t)| KeywordRoute::new(k, t))
    .collect()
}

#[derive(Debug, Clone)]
pub struct RequestRouter {
    systems: BTreeSet<SystemId>,
    rules: Vec<RoutingRule>,
    keywords: Vec<KeywordRoute>,
    default_system: Option<SystemId>,
}

impl RequestRouter {
    pub fn new(systems: impl IntoIterator<Item = SystemId>) -> Self {
        Self {
            systems: systems.into_iter().collect(),
            rules: Vec::new(),
            keywords: default_keyword_routes(),
            default_system: None,
        }
    }

    /// Add a rule. Rules stay sorted by descending priority; equal
    /// priorities keep insertion order.
    pub fn add_rule(&mut self, rule: RoutingRule) {
        let at = self.rules.partition_point(|r| r.priority >= rule.priority);
        self.rules.insert(at, rule);
    }

    pub fn set_keyword_routes(&mut self, keywords: Vec<KeywordRoute>) {
        self.keywords = keywords;
    }

    pub fn set_default_system(&mut self, system: Option<SystemId>) {
        self.default_system = system;
    }

    pub fn systems(&self) -> &BTreeSet<SystemId> {
        &self.systems
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn is_configured(&self, system: &str) -> bool {
        self.systems.contains(system)
    }

    /// Check that every rule and the default name a configured system.
    /// Keyword routes to unconfigured systems are skipped at lookup instead.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if let Some(rule) = self.rules.iter().find(|r| !self.is_configured(&r.target)) {
            return Err(GatewayError::Configuration(format!(
                "routing rule {} targets unknown system {}",
                rule.pattern.as_str(),
                rule.target
            )));
        }
        if let Some(default) = &self.default_system
            && !self.is_configured(default)
        {
            return Err(GatewayError::Configuration(format!(
                "default system {default} is not configured"
            )));
        }
        Ok(())
    }

    /// Decide which system serves `request`.
    pub fn determine_target(&self, request: &Request) -> Result<SystemId, GatewayError> {
        if let Some(target) = &request.target {
            if !self.is_configured(target) {
                return Err(GatewayError::UnknownSystem(target.to_string()));
            }
            return Ok(target.clone());
        }

        if let Some(rule) = self.rules.iter().find(|r| r.applies(request)) {
            debug!(operation = %request.operation, target = %rule.target, priority = rule.priority, "routing rule matched");
            return Ok(rule.target.clone());
        }

        if let Some(prefix) = request.system_prefix()
            && let Some(system) = self.systems.get(prefix)
        {
            return Ok(system.clone());
        }

        if let Some(route) = self
            .keywords
            .iter()
            .find(|k| self.is_configured(&k.target) && k.matches(&request.operation))
        {
            debug!(operation = %request.operation, keyword = %route.keyword, target = %route.target, "keyword route matched");
            return Ok(SystemId::from(route.target.as_str()));
        }

        self.default_system
            .clone()
            .ok_or_else(|| GatewayError::UnknownSystem(request.operation.clone()))
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{Payload, SearchPayload};
    use serde_json::json;

    use super::*;

    fn router() -> RequestRouter {
        RequestRouter::new(["cns", "bytestar", "marketplace"].map(SystemId::from))
    }

    fn request(operation: &str) -> Request {
        Request::new("test", operation, Payload::default())
    }

    #[test]
    fn explicit_target_overrides_rules() {
        let mut router = router();
        router.add_rule(RoutingRule::new("*", "bytestar", 100).unwrap());
        let req = request("cns.validate").with_target("marketplace");
        assert_eq!(router.determine_target(&req).unwrap().as_str(), "marketplace");
    }

    #[test]
    fn unconfigured_explicit_target_fails() {
        let req = request("cns.validate").with_target("ledger");
        let err = router().determine_target(&req).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_SYSTEM");
    }

    #[test]
    fn rules_apply_in_priority_order() {
        let mut router = router();
        router.add_rule(RoutingRule::new("cns.*", "cns", 1).unwrap());
        router.add_rule(RoutingRule::new("cns.validate*", "bytestar", 10).unwrap());
        assert_eq!(router.determine_target(&request("cns.validate-uhft")).unwrap().as_str(), "bytestar");
        assert_eq!(router.determine_target(&request("cns.parse")).unwrap().as_str(), "cns");
        assert_eq!(router.rules()[0].priority(), 10);
    }

    #[test]
    fn rule_conditions_must_all_hold() {
        let mut router = router();
        router.add_rule(
            RoutingRule::new("*.search", "bytestar", 5)
                .unwrap()
                .when(RouteCondition::Tag {
                    key: "tier".into(),
                    value: "premium".into(),
                })
                .when(RouteCondition::PayloadField {
                    path: "query".into(),
                    value: json!("gpu"),
                }),
        );
        let payload = Payload::Search(SearchPayload {
            query: "gpu".into(),
            filters: serde_json::Map::new(),
            limit: None,
        });
        let plain = Request::new("test", "marketplace.search", payload.clone());
        assert_eq!(router.determine_target(&plain).unwrap().as_str(), "marketplace");

        let premium = plain.clone().with_tag("tier", "premium");
        assert_eq!(router.determine_target(&premium).unwrap().as_str(), "bytestar");
    }

    #[test]
    fn custom_predicate_condition() {
        let mut router = router();
        router.add_rule(
            RoutingRule::new("*", "cns", 1)
                .unwrap()
                .when(RouteCondition::Custom(Arc::new(|r: &Request| r.metadata.user_id.is_some()))),
        );
        assert_eq!(router.determine_target(&request("x.y").with_user("u")).unwrap().as_str(), "cns");
        assert!(router.determine_target(&request("x.y")).is_err());
    }

    #[test]
    fn prefix_then_keywords_then_default() {
        let mut router = router();
        assert_eq!(router.determine_target(&request("bytestar.anything")).unwrap().as_str(), "bytestar");
        assert_eq!(router.determine_target(&request("semantic-parse")).unwrap().as_str(), "cns");
        assert_eq!(router.determine_target(&request("ai-enhance")).unwrap().as_str(), "bytestar");
        assert_eq!(router.determine_target(&request("catalog.search")).unwrap().as_str(), "marketplace");

        assert!(router.determine_target(&request("send-fax")).is_err());
        router.set_default_system(Some("cns".into()));
        assert_eq!(router.determine_target(&request("send-fax")).unwrap().as_str(), "cns");
    }

    #[test]
    fn keywords_match_anywhere_in_the_operation() {
        let router = router();
        // Short keywords are plain substrings too, and table order decides ties.
        assert_eq!(router.determine_target(&request("send-email")).unwrap().as_str(), "bytestar");
        assert_eq!(router.determine_target(&request("AUTOVALIDATE")).unwrap().as_str(), "cns");
        assert_eq!(router.determine_target(&request("researcher")).unwrap().as_str(), "marketplace");
    }

    #[test]
    fn keywords_require_configured_target() {
        let router = RequestRouter::new([SystemId::from("cns")]);
        let err = router.determine_target(&request("product.search")).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_SYSTEM");
    }

    #[test]
    fn validate_rejects_dangling_targets() {
        let mut router = router();
        router.add_rule(RoutingRule::new("*", "ledger", 1).unwrap());
        assert_eq!(router.validate().unwrap_err().code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn rule_from_spec() {
        let spec: RoutingRuleSpec = serde_json::from_value(json!({
            "pattern": "marketplace.*",
            "target": "cns",
            "priority": 3,
            "tags": {"region": "eu"}
        }))
        .unwrap();
        let mut router = router();
        router.add_rule(RoutingRule::from_spec(&spec).unwrap());
        let req = request("marketplace.search").with_tag("region", "eu");
        assert_eq!(router.determine_target(&req).unwrap().as_str(), "cns");
    }
}
