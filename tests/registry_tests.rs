//! Global registry tests: diff idempotence, uniqueness and concurrent refreshes

use flowguard::rules::{DegradeRule, FlowRule, GlobalRegistry, Registries, Rule};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn keys<R: Rule>(registry: &GlobalRegistry<R>) -> Vec<String> {
    registry
        .snapshot()
        .rules()
        .iter()
        .map(|r| r.resource().to_string())
        .collect()
}

fn assert_unique<R: Rule>(registry: &GlobalRegistry<R>) {
    let keys = keys(registry);
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len(), "duplicate keys in {keys:?}");
}

#[test]
fn test_same_payload_twice_is_idempotent() {
    let registry = GlobalRegistry::<FlowRule>::new();
    let latest = vec![
        FlowRule::qps("web#app#GET#/a", 1.0),
        FlowRule::qps("web#app#GET#/b", 2.0),
    ];

    registry.refresh("app#flow-rules.json", latest.clone());
    let first = registry.snapshot().rules().to_vec();

    let applied = registry.refresh("app#flow-rules.json", latest);
    let second = registry.snapshot().rules().to_vec();

    assert_eq!(first, second);
    assert!(applied.diff.added.is_empty());
    assert!(applied.diff.removed.is_empty());
}

#[test]
fn test_updates_replace_in_place() {
    let registry = GlobalRegistry::<FlowRule>::new();
    registry.refresh("o", vec![FlowRule::qps("a", 1.0), FlowRule::qps("b", 1.0)]);
    registry.refresh("o", vec![FlowRule::qps("a", 5.0), FlowRule::qps("b", 1.0)]);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("a").unwrap().count, 5.0);
    // Order is kept for surviving keys
    assert_eq!(keys(&registry), vec!["a", "b"]);
}

#[test]
fn test_owners_do_not_disturb_each_other() {
    let registries = Registries::new();
    registries
        .flow
        .refresh("ali-user#flow-rules.json", vec![FlowRule::qps("web#ali-user#GET#/u", 1.0)]);
    registries.flow.refresh(
        "ali-order#flow-rules.json",
        vec![FlowRule::qps("web#ali-order#GET#/o", 1.0)],
    );

    registries.flow.refresh("ali-user#flow-rules.json", Vec::new());
    assert_eq!(keys(&registries.flow), vec!["web#ali-order#GET#/o"]);
    assert!(registries.degrade.snapshot().is_empty());
}

#[test]
fn test_duplicates_in_payload_collapse() {
    let registry = GlobalRegistry::<DegradeRule>::new();
    registry.refresh(
        "o",
        vec![
            DegradeRule::error_count("x", 1.0, 10),
            DegradeRule::error_count("y", 1.0, 10),
            DegradeRule::error_count("x", 3.0, 10),
        ],
    );

    assert_unique(&registry);
    assert_eq!(keys(&registry), vec!["x", "y"]);
    assert_eq!(registry.snapshot().get("x").unwrap().count, 3.0);
}

#[test]
fn test_unload_removes_only_owned() {
    let registry = GlobalRegistry::<FlowRule>::new();
    registry.refresh("a", vec![FlowRule::qps("a1", 1.0), FlowRule::qps("a2", 1.0)]);
    registry.refresh("b", vec![FlowRule::qps("b1", 1.0)]);

    assert_eq!(registry.unload("a"), 2);
    assert_eq!(keys(&registry), vec!["b1"]);
    assert_eq!(registry.unload("a"), 0);
    assert_eq!(registry.owners(), vec!["b"]);
}

#[test]
fn test_concurrent_refreshes_keep_every_owner() {
    const OWNERS: usize = 8;
    const ROUNDS: usize = 200;

    let registry = Arc::new(GlobalRegistry::<FlowRule>::new());
    let handles: Vec<_> = (0..OWNERS)
        .map(|owner| {
            let registry = registry.clone();
            thread::spawn(move || {
                let owner_id = format!("owner-{owner}");
                for round in 0..ROUNDS {
                    // Alternate between two disjoint key sets
                    let rules = (0..4)
                        .map(|i| {
                            FlowRule::qps(format!("{owner_id}#r{}#{i}", round % 2), 1.0)
                        })
                        .collect();
                    registry.refresh(&owner_id, rules);
                    assert_unique(&registry);
                }
                // Settle on the final set
                let last = (0..4)
                    .map(|i| FlowRule::qps(format!("{owner_id}#final#{i}"), 1.0))
                    .collect();
                registry.refresh(&owner_id, last);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut keys = keys(&registry);
    keys.sort();
    let mut expected: Vec<String> = (0..OWNERS)
        .flat_map(|owner| (0..4).map(move |i| format!("owner-{owner}#final#{i}")))
        .collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_readers_see_whole_snapshots() {
    let registry = Arc::new(GlobalRegistry::<FlowRule>::new());
    let full: Vec<FlowRule> = (0..16).map(|i| FlowRule::qps(format!("k{i}"), 1.0)).collect();

    let writer = {
        let registry = registry.clone();
        let full = full.clone();
        thread::spawn(move || {
            for round in 0..500 {
                if round % 2 == 0 {
                    registry.refresh("o", full.clone());
                } else {
                    registry.refresh("o", Vec::new());
                }
            }
        })
    };

    for _ in 0..2000 {
        let len = registry.snapshot().len();
        assert!(len == 0 || len == 16, "torn snapshot with {len} rules");
    }
    writer.join().unwrap();
}

#[test]
fn test_key_shared_by_two_owners_outlives_either_alone() {
    let registry = GlobalRegistry::<FlowRule>::new();
    registry.refresh("a", vec![FlowRule::qps("shared", 1.0), FlowRule::qps("a1", 1.0)]);
    registry.refresh("b", vec![FlowRule::qps("shared", 4.0)]);
    assert_unique(&registry);

    registry.refresh("a", Vec::new());
    assert!(registry.snapshot().contains("shared"));
    assert_eq!(registry.snapshot().get("shared").unwrap().count, 4.0);
    assert_eq!(registry.owned_by("b").len(), 1);

    registry.refresh("a", vec![FlowRule::qps("shared", 1.0)]);
    registry.unload("a");
    assert_eq!(keys(&registry), vec!["shared"]);

    registry.unload("b");
    assert!(registry.snapshot().is_empty());
}
