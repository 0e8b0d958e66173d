use conduit_gateway::{KeywordRoute, RoutingRuleSpec};
use serde::Deserialize;

/// Routing rules applied to requests without an explicit target.
///
/// Resolution order: explicit target, then `rules` by descending priority,
/// then the operation's system prefix, then `keyword_routes`, then
/// `default_system`.
///
/// # Example
///
/// ```toml
/// [routing]
/// default_system = "marketplace"
///
/// [[routing.rules]]
/// pattern = "catalog.*"
/// target = "marketplace"
/// priority = 10
/// tags = { tier = "gold" }
///
/// [[routing.keyword_routes]]
/// keyword = "validate"
/// target = "cns"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RoutingRuleSpec>,
    /// Replaces the built-in keyword table when non-empty.
    #[serde(default)]
    pub keyword_routes: Vec<KeywordRoute>,
    #[serde(default)]
    pub default_system: Option<String>,
}
