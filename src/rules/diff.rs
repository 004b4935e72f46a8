//! Rule diff engine
//!
//! Computes how one consumer's rule list changed between two refreshes and
//! rewrites the shared per-kind list accordingly. Pure functions only; the
//! registry supplies the locking.

use crate::rules::types::Rule;
use std::collections::{HashMap, HashSet};

/// Summary of one diff, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Keys in the latest list but not in the previous one
    pub added: Vec<String>,
    /// Keys in the previous list but not in the latest one
    pub removed: Vec<String>,
    /// Keys present in both lists, replaced by their latest version
    pub kept: usize,
}

impl RuleDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.kept == 0
    }
}

/// Collapse duplicate resources within one payload
///
/// The first occurrence fixes the position, the last occurrence wins.
pub fn dedup_rules<R: Rule>(rules: Vec<R>) -> Vec<R> {
    let mut position: HashMap<String, usize> = HashMap::with_capacity(rules.len());
    let mut out: Vec<R> = Vec::with_capacity(rules.len());

    for rule in rules {
        match position.get(rule.resource()) {
            Some(&i) => out[i] = rule,
            None => {
                position.insert(rule.resource().to_string(), out.len());
                out.push(rule);
            }
        }
    }
    out
}

/// Apply a consumer's change set to the global list of one kind
///
/// `previous` is what this consumer contributed last time, `latest` is what
/// it contributes now (already deduplicated). Entries of other consumers are
/// carried over untouched; the result never holds a key twice.
pub fn apply_diff<R: Rule>(global: &[R], previous: &[R], latest: &[R]) -> (Vec<R>, RuleDiff) {
    let previous_keys: HashSet<&str> = previous.iter().map(Rule::resource).collect();
    let latest_map: HashMap<&str, &R> = latest.iter().map(|r| (r.resource(), r)).collect();

    let removed: HashSet<&str> = previous_keys
        .iter()
        .copied()
        .filter(|k| !latest_map.contains_key(k))
        .collect();

    let mut seen: HashSet<&str> = HashSet::with_capacity(global.len() + latest.len());
    let mut next: Vec<R> = Vec::with_capacity(global.len() + latest.len());
    let mut kept = 0;

    for rule in global {
        let key = rule.resource();
        if removed.contains(key) || !seen.insert(key) {
            continue;
        }
        match latest_map.get(key) {
            Some(latest_rule) => {
                if previous_keys.contains(key) {
                    kept += 1;
                }
                next.push((*latest_rule).clone());
            }
            None => next.push(rule.clone()),
        }
    }

    let mut added = Vec::new();
    for rule in latest {
        let key = rule.resource();
        if !previous_keys.contains(key) {
            added.push(key.to_string());
        }
        if seen.insert(key) {
            next.push(rule.clone());
        }
    }

    let mut removed: Vec<String> = removed.into_iter().map(str::to_string).collect();
    removed.sort_unstable();

    (
        next,
        RuleDiff {
            added,
            removed,
            kept,
        },
    )
}

/// Drop every entry whose key is in `owned`
pub fn remove_owned<R: Rule>(global: &[R], owned: &[R]) -> Vec<R> {
    if owned.is_empty() {
        return global.to_vec();
    }
    let owned: HashSet<&str> = owned.iter().map(Rule::resource).collect();
    global
        .iter()
        .filter(|r| !owned.contains(r.resource()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::FlowRule;

    fn rule(key: &str, count: f64) -> FlowRule {
        FlowRule::qps(key, count)
    }

    fn keys(rules: &[FlowRule]) -> Vec<&str> {
        rules.iter().map(|r| r.resource.as_str()).collect()
    }

    #[test]
    fn test_add_to_empty() {
        let (next, diff) = apply_diff(&[], &[], &[rule("a", 1.0), rule("b", 2.0)]);
        assert_eq!(keys(&next), ["a", "b"]);
        assert_eq!(diff.added, ["a", "b"]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_replace_remove_and_add() {
        let global = vec![rule("other", 9.0), rule("a", 1.0), rule("b", 2.0)];
        let previous = vec![rule("a", 1.0), rule("b", 2.0)];
        let latest = vec![rule("b", 20.0), rule("c", 3.0)];

        let (next, diff) = apply_diff(&global, &previous, &latest);

        assert_eq!(keys(&next), ["other", "b", "c"]);
        assert_eq!(next[1].count, 20.0);
        assert_eq!(diff.added, ["c"]);
        assert_eq!(diff.removed, ["a"]);
        assert_eq!(diff.kept, 1);
    }

    #[test]
    fn test_empty_latest_removes_everything_owned() {
        let global = vec![rule("a", 1.0), rule("x", 5.0)];
        let (next, diff) = apply_diff(&global, &[rule("a", 1.0)], &[]);
        assert_eq!(keys(&next), ["x"]);
        assert_eq!(diff.removed, ["a"]);
    }

    #[test]
    fn test_never_duplicates_existing_key() {
        // Another consumer already published "shared"
        let global = vec![rule("shared", 1.0)];
        let (next, diff) = apply_diff(&global, &[], &[rule("shared", 2.0)]);

        assert_eq!(keys(&next), ["shared"]);
        assert_eq!(next[0].count, 2.0);
        assert_eq!(diff.added, ["shared"]);
    }

    #[test]
    fn test_collapses_duplicates_already_in_global() {
        let global = vec![rule("a", 1.0), rule("a", 2.0)];
        let (next, _) = apply_diff(&global, &[], &[]);
        assert_eq!(keys(&next), ["a"]);
    }

    #[test]
    fn test_idempotent() {
        let latest = vec![rule("a", 1.0), rule("b", 2.0)];
        let (first, _) = apply_diff(&[rule("x", 0.0)], &[], &latest);
        let (second, diff) = apply_diff(&first, &latest, &latest);

        assert_eq!(first, second);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_dedup_rules_last_wins() {
        let rules = dedup_rules(vec![rule("a", 1.0), rule("b", 2.0), rule("a", 3.0)]);
        assert_eq!(keys(&rules), ["a", "b"]);
        assert_eq!(rules[0].count, 3.0);
    }

    #[test]
    fn test_remove_owned() {
        let global = vec![rule("a", 1.0), rule("b", 2.0), rule("c", 3.0)];
        let next = remove_owned(&global, &[rule("a", 1.0), rule("c", 0.0)]);
        assert_eq!(keys(&next), ["b"]);
        assert_eq!(remove_owned(&global, &[]).len(), 3);
    }
}
