use regex::Regex;

use crate::error::BusError;

/// What event types a subscription receives.
///
/// * `order.created` matches exactly that type.
/// * `order.*` is a wildcard; `*` matches any run of characters.
/// * `regex:^order\.(created|paid)$` or `/^order\./` is a literal regex.
#[derive(Debug, Clone)]
pub enum EventPattern {
    Exact(String),
    Pattern { source: String, regex: Regex },
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let invalid = |reason: String| BusError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern must not be empty".into()));
        }

        let literal_regex = pattern.strip_prefix("regex:").or_else(|| {
            (pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/'))
                .then(|| &pattern[1..pattern.len() - 1])
        });

        let expression = if let Some(expr) = literal_regex {
            expr.to_owned()
        } else if pattern.contains('*') {
            let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
            format!("^{}$", escaped.join(".*"))
        } else {
            return Ok(Self::Exact(pattern.to_owned()));
        };

        let regex = Regex::new(&expression).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::Pattern {
            source: pattern.to_owned(),
            regex,
        })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == event_type,
            Self::Pattern { regex, .. } => regex.is_match(event_type),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Pattern { source: s, .. } => s,
        }
    }
}
