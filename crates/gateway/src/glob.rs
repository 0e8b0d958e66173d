use std::fmt;

use regex::Regex;

use crate::error::GatewayError;

/// Anchored `*` glob over operation and system names.
#[derive(Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GatewayError> {
        let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
        let regex = Regex::new(&format!("^{}$", escaped.join(".*")))
            .map_err(|e| GatewayError::Configuration(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_run() {
        let glob = Glob::new("cns.*").unwrap();
        assert!(glob.matches("cns.validate-uhft"));
        assert!(!glob.matches("bytestar.cns.validate"));
        assert!(Glob::new("*").unwrap().matches(""));
    }

    #[test]
    fn dots_are_literal() {
        let glob = Glob::new("a.b").unwrap();
        assert!(glob.matches("a.b"));
        assert!(!glob.matches("axb"));
    }
}
