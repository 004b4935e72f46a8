//! Path templates
//!
//! Compiles `{name}` placeholders into anchored regexes. A placeholder
//! matches one or more characters inside a single `/`-delimited segment;
//! there are no wildcards that cross segment boundaries.

use crate::error::RuleError;
use regex::Regex;

/// Compiled path template
#[derive(Debug, Clone)]
pub struct PathTemplate {
    source: String,
    regex: Regex,
    variables: Vec<String>,
}

impl PathTemplate {
    /// Compile a template such as `/users/{id}` or `users:{userId}`
    pub fn new(template: &str) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut pattern = String::with_capacity(template.len() + 16);
        pattern.push('^');
        let mut variables = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find(['{', '}']) {
            if rest.as_bytes()[open] == b'}' {
                return Err(invalid("unmatched '}'"));
            }
            pattern.push_str(&regex::escape(&rest[..open]));

            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let name = &after[..close];
            if name.is_empty() {
                return Err(invalid("empty placeholder"));
            }
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("placeholder names must be alphanumeric"));
            }
            if variables.iter().any(|v| v == name) {
                return Err(invalid("duplicate placeholder"));
            }

            pattern.push_str("([^/]+)");
            variables.push(name.to_string());
            rest = &after[close + 1..];
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            source: template.to_string(),
            regex,
            variables,
        })
    }

    /// Whether a template string contains placeholders at all
    pub fn is_template(s: &str) -> bool {
        s.contains('{')
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match and extract placeholder values in declaration order
    pub fn extract<'p>(&self, path: &'p str) -> Option<Vec<(&str, &'p str)>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.variables
                .iter()
                .enumerate()
                .filter_map(|(i, name)| caps.get(i + 1).map(|m| (name.as_str(), m.as_str())))
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_placeholder() {
        let t = PathTemplate::new("/users/{userId}").unwrap();
        assert!(t.matches("/users/1"));
        assert!(!t.matches("/users/x/1"));
        assert!(!t.matches("/users/"));
        assert_eq!(t.variables(), ["userId"]);
    }

    #[test]
    fn test_non_path_template() {
        let t = PathTemplate::new("users:{userId}").unwrap();
        assert!(t.matches("users:1"));
        assert!(!t.matches("users1"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let t = PathTemplate::new("/v1.0/items/{id}").unwrap();
        assert!(t.matches("/v1.0/items/9"));
        assert!(!t.matches("/v1x0/items/9"));
    }

    #[test]
    fn test_extract() {
        let t = PathTemplate::new("/orgs/{org}/users/{id}").unwrap();
        let vars = t.extract("/orgs/acme/users/42").unwrap();
        assert_eq!(vars, vec![("org", "acme"), ("id", "42")]);
        assert!(t.extract("/orgs/acme/users").is_none());
    }

    #[test]
    fn test_invalid_templates() {
        for bad in ["/users/{id", "/users/id}", "/users/{}", "/a/{x}/{x}", "/a/{x-y}"] {
            assert!(
                matches!(PathTemplate::new(bad), Err(RuleError::InvalidTemplate { .. })),
                "expected {bad} to be rejected"
            );
        }
    }

    #[test]
    fn test_is_template() {
        assert!(PathTemplate::is_template("/users/{id}"));
        assert!(!PathTemplate::is_template("/users/1"));
    }
}
