//! Consumer rule sets and key resolution
//!
//! A [`RuleSet`] is the immutable map of one consumer's rules of one kind,
//! with its template keys precompiled. A [`RuleIndex`] is the shared slot a
//! subscription swaps fresh rule sets into while request handlers read it.
//!
//! Resolution is exact match first, then the first template (in payload
//! order) whose prefix equals the request prefix and whose target pattern
//! matches the request target. Overlapping templates have no precedence
//! beyond that order.

use crate::rules::key::{KeyPrefix, RuleKey};
use crate::rules::pattern::PathTemplate;
use crate::rules::types::Rule;
use crate::subscription::RuleListener;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// How a key was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Template,
}

/// A rule found for a request
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a, R> {
    /// The configured key, which is also the admission resource
    pub key: &'a str,
    pub rule: &'a R,
    pub matched: MatchKind,
}

struct TemplateEntry {
    key: String,
    prefix_len: usize,
    template: PathTemplate,
}

impl TemplateEntry {
    fn prefix(&self) -> &str {
        &self.key[..self.prefix_len]
    }
}

/// Immutable rules of one (consumer, kind) pair
pub struct RuleSet<R> {
    rules: HashMap<String, R>,
    templates: Vec<TemplateEntry>,
}

impl<R: Rule> RuleSet<R> {
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            templates: Vec::new(),
        }
    }

    /// Build from a rule list; later duplicates replace earlier ones
    pub fn new(rules: impl IntoIterator<Item = R>) -> Self {
        let mut map: HashMap<String, R> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for rule in rules {
            let key = rule.resource().to_string();
            if map.insert(key.clone(), rule).is_none() {
                order.push(key);
            }
        }

        let mut templates = Vec::new();
        for key in order {
            if !PathTemplate::is_template(&key) {
                continue;
            }
            let Some(decoded) = RuleKey::decode(&key) else {
                warn!(resource = %key, "template rule key has no namespace prefix, exact match only");
                continue;
            };
            let prefix_len = decoded.prefix_len();
            match PathTemplate::new(decoded.target) {
                Ok(template) => templates.push(TemplateEntry {
                    key,
                    prefix_len,
                    template,
                }),
                Err(e) => warn!(resource = %key, error = %e, "ignoring invalid template"),
            }
        }

        Self {
            rules: map,
            templates,
        }
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.rules.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rules.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn rules(&self) -> impl Iterator<Item = &R> {
        self.rules.values()
    }

    /// Exact match on the literal key only
    pub fn resolve_exact(&self, key: &str) -> Option<Resolved<'_, R>> {
        self.rules.get_key_value(key).map(|(k, rule)| Resolved {
            key: k.as_str(),
            rule,
            matched: MatchKind::Exact,
        })
    }

    /// Template match of `target` among keys starting with `prefix`
    pub fn resolve_template(&self, prefix: &str, target: &str) -> Option<Resolved<'_, R>> {
        for entry in &self.templates {
            if entry.prefix() == prefix && entry.template.matches(target) {
                trace!(template = %entry.key, target, "template matched");
                let rule = self.rules.get(&entry.key)?;
                return Some(Resolved {
                    key: entry.key.as_str(),
                    rule,
                    matched: MatchKind::Template,
                });
            }
        }
        None
    }

    /// Resolve a request given its key prefix and target
    pub fn resolve(&self, prefix: &KeyPrefix, target: &str) -> Option<Resolved<'_, R>> {
        if let Some(found) = self.resolve_exact(&prefix.key(target)) {
            return Some(found);
        }
        self.resolve_template(prefix.as_str(), target)
    }

    /// Resolve a fully encoded request key
    pub fn resolve_key(&self, key: &str) -> Option<Resolved<'_, R>> {
        if let Some(found) = self.resolve_exact(key) {
            return Some(found);
        }
        let decoded = RuleKey::decode(key)?;
        let prefix_len = decoded.prefix_len();
        self.resolve_template(&key[..prefix_len], decoded.target)
    }
}

impl<R: Rule> Default for RuleSet<R> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared, atomically replaced rule set of one consumer
pub struct RuleIndex<R> {
    current: ArcSwap<RuleSet<R>>,
}

impl<R: Rule> RuleIndex<R> {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::empty()),
        }
    }

    /// Current rule set; holds no lock
    pub fn load(&self) -> Arc<RuleSet<R>> {
        self.current.load_full()
    }

    /// Build a new set from `rules` and swap it in
    pub fn replace(&self, rules: impl IntoIterator<Item = R>) {
        self.current.store(Arc::new(RuleSet::new(rules)));
    }

    pub fn clear(&self) {
        self.current.store(Arc::new(RuleSet::empty()));
    }

    /// Resolve to an owned resource key
    pub fn resolve(&self, prefix: &KeyPrefix, target: &str) -> Option<String> {
        self.current
            .load()
            .resolve(prefix, target)
            .map(|r| r.key.to_string())
    }
}

impl<R: Rule> Default for RuleIndex<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rule> RuleListener<R> for RuleIndex<R> {
    fn post_refresh(&self, refreshed: &[R]) {
        self.replace(refreshed.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::key::Namespace;
    use crate::rules::types::FlowRule;

    fn set(keys: &[&str]) -> RuleSet<FlowRule> {
        RuleSet::new(keys.iter().map(|k| FlowRule::qps(*k, 1.0)))
    }

    fn prefix(consumer: &str, verb: &str) -> KeyPrefix {
        KeyPrefix::new(Namespace::Gateway, consumer, verb).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let rules = set(&["gateway#ali-user#GET#/users/detail"]);
        let found = rules.resolve(&prefix("ali-user", "GET"), "/users/detail").unwrap();
        assert_eq!(found.key, "gateway#ali-user#GET#/users/detail");
        assert_eq!(found.matched, MatchKind::Exact);
    }

    #[test]
    fn test_template_match() {
        let rules = set(&["gateway#ali-user#GET#/users/{id}"]);
        let found = rules.resolve(&prefix("ali-user", "GET"), "/users/42").unwrap();
        assert_eq!(found.key, "gateway#ali-user#GET#/users/{id}");
        assert_eq!(found.matched, MatchKind::Template);
        assert_eq!(rules.template_count(), 1);
    }

    #[test]
    fn test_exact_beats_template() {
        let rules = set(&[
            "gateway#ali-user#GET#/users/{id}",
            "gateway#ali-user#GET#/users/123",
        ]);
        let found = rules.resolve(&prefix("ali-user", "GET"), "/users/123").unwrap();
        assert_eq!(found.key, "gateway#ali-user#GET#/users/123");
        assert_eq!(found.matched, MatchKind::Exact);
    }

    #[test]
    fn test_template_prefix_must_match() {
        let rules = set(&["gateway#ali-user#GET#/users/{id}"]);
        assert!(rules.resolve(&prefix("ali-user", "POST"), "/users/42").is_none());
        assert!(rules.resolve(&prefix("ali-order", "GET"), "/users/42").is_none());
    }

    #[test]
    fn test_no_match_is_none() {
        let rules = set(&["gateway#ali-user#GET#/users/{id}"]);
        assert!(rules.resolve(&prefix("ali-user", "GET"), "/orders/1").is_none());
        assert!(
            RuleSet::<FlowRule>::empty()
                .resolve(&prefix("ali-user", "GET"), "/users/1")
                .is_none()
        );
    }

    #[test]
    fn test_resolve_key() {
        let rules = set(&["cache#value#get#users:{id}"]);
        let found = rules.resolve_key("cache#value#get#users:7").unwrap();
        assert_eq!(found.key, "cache#value#get#users:{id}");
        assert!(rules.resolve_key("cache#hash#get#users:7").is_none());
        assert!(rules.resolve_key("not-a-key").is_none());
    }

    #[test]
    fn test_invalid_template_still_matches_exactly() {
        let rules = set(&["web#app#GET#/broken/{id"]);
        assert_eq!(rules.template_count(), 0);
        assert!(rules.resolve_key("web#app#GET#/broken/{id").is_some());
    }

    #[test]
    fn test_index_swap() {
        let index = RuleIndex::<FlowRule>::new();
        let p = prefix("ali-user", "GET");
        assert!(index.resolve(&p, "/users/1").is_none());

        let held = index.load();
        index.post_refresh(&[FlowRule::qps("gateway#ali-user#GET#/users/{id}", 1.0)]);
        assert_eq!(
            index.resolve(&p, "/users/1").as_deref(),
            Some("gateway#ali-user#GET#/users/{id}")
        );
        // Readers holding the old set are unaffected
        assert!(held.is_empty());

        index.clear();
        assert!(index.load().is_empty());
    }
}
