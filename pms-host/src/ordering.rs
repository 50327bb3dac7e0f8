//! Partial-order resolution for the extensions of one extension point.
//!
//! Each extension may declare `after` dependencies (it must run after them)
//! and `before` constraints (it must run before them). References to
//! extensions that are not registered are optional and ignored. The
//! resulting permutation is deterministic: among unconstrained peers the
//! later-registered extension runs first.

use std::collections::{HashMap, HashSet};

use crate::error::ManagerError;
use crate::runtime::ExtensionRuntime;

pub(crate) fn order_extensions(
    records: Vec<ExtensionRuntime>,
) -> Result<Vec<ExtensionRuntime>, ManagerError> {
    let direct = direct_dependencies(&records)?;
    let closed = transitive_closure(&records, &direct)?;
    Ok(sort_by_dependencies(records, &closed))
}

/// Direct dependencies of each record: its own `after` declarations plus
/// every record that declares itself `before` this one. Unknown references
/// are kept here and only filtered once the closure has been taken.
fn direct_dependencies(
    records: &[ExtensionRuntime],
) -> Result<Vec<HashSet<String>>, ManagerError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        if index.insert(record.cfg.id.as_str(), position).is_some() {
            return Err(ManagerError::DuplicateExtension(record.cfg.id.clone()));
        }
    }

    let mut deps: Vec<HashSet<String>> = records
        .iter()
        .map(|record| record.cfg.after_extension_ids.iter().cloned().collect())
        .collect();
    for record in records {
        for before in &record.cfg.before_extension_ids {
            if let Some(&target) = index.get(before.as_str()) {
                deps[target].insert(record.cfg.id.clone());
            }
        }
    }
    Ok(deps)
}

/// Expand the direct sets to their transitive closure, failing on cycles.
fn transitive_closure(
    records: &[ExtensionRuntime],
    direct: &[HashSet<String>],
) -> Result<Vec<HashSet<String>>, ManagerError> {
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(position, record)| (record.cfg.id.as_str(), position))
        .collect();

    let mut closed: Vec<Option<HashSet<String>>> = vec![None; records.len()];
    let mut in_progress = vec![false; records.len()];
    for start in 0..records.len() {
        visit(start, records, direct, &index, &mut closed, &mut in_progress)?;
    }
    Ok(closed
        .into_iter()
        .map(|set| set.unwrap_or_default())
        .collect())
}

fn visit(
    node: usize,
    records: &[ExtensionRuntime],
    direct: &[HashSet<String>],
    index: &HashMap<&str, usize>,
    closed: &mut Vec<Option<HashSet<String>>>,
    in_progress: &mut Vec<bool>,
) -> Result<(), ManagerError> {
    if closed[node].is_some() {
        return Ok(());
    }
    in_progress[node] = true;

    let mut result: HashSet<String> = direct[node].clone();
    let mut dependencies: Vec<String> = direct[node].iter().cloned().collect();
    dependencies.sort();
    for dependency in dependencies {
        // references to unregistered extensions are optional
        let Some(&dep_node) = index.get(dependency.as_str()) else {
            continue;
        };
        if in_progress[dep_node] {
            return Err(ManagerError::CircularDependency {
                id: records[node].cfg.id.clone(),
                dependency,
            });
        }
        visit(dep_node, records, direct, index, closed, in_progress)?;
        if let Some(transitive) = &closed[dep_node] {
            result.extend(transitive.iter().cloned());
        }
    }

    in_progress[node] = false;
    closed[node] = Some(result);
    Ok(())
}

/// Emit records whose dependencies are satisfied, round by round, walking
/// each round in reverse insertion order. The reverse walk is the
/// deterministic tie-break: among equals, the later-registered extension
/// goes first.
fn sort_by_dependencies(
    records: Vec<ExtensionRuntime>,
    deps: &[HashSet<String>],
) -> Vec<ExtensionRuntime> {
    let known: HashSet<&str> = records.iter().map(|record| record.cfg.id.as_str()).collect();
    let mut unsatisfied: Vec<HashSet<String>> = deps
        .iter()
        .map(|set| {
            set.iter()
                .filter(|id| known.contains(id.as_str()))
                .cloned()
                .collect()
        })
        .collect();

    let mut placed = vec![false; records.len()];
    let mut order: Vec<usize> = Vec::with_capacity(records.len());
    loop {
        let mut selected: Vec<usize> = Vec::new();
        for position in (0..records.len()).rev() {
            if !placed[position] && unsatisfied[position].is_empty() {
                placed[position] = true;
                selected.push(position);
            }
        }
        if selected.is_empty() {
            break;
        }
        for &position in &selected {
            let id = records[position].cfg.id.as_str();
            for pending in unsatisfied.iter_mut() {
                pending.remove(id);
            }
        }
        order.extend(selected);
    }

    // Anything left is blocked only by optional references; emit it at the
    // tail in insertion order.
    for position in 0..records.len() {
        if !placed[position] {
            order.push(position);
        }
    }

    let mut slots: Vec<Option<ExtensionRuntime>> = records.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExtensionKind, LocalHandler};
    use pms_sdk::protocol::ExtensionConfig;
    use serde_json::Value;

    fn record(cfg: ExtensionConfig) -> ExtensionRuntime {
        let handler = LocalHandler::new::<Value, Value, _>(cfg.id.as_str(), Ok);
        ExtensionRuntime {
            cfg,
            kind: ExtensionKind::Local(handler),
        }
    }

    fn ids(records: &[ExtensionRuntime]) -> Vec<&str> {
        records.iter().map(|r| r.cfg.id.as_str()).collect()
    }

    #[test]
    fn after_constraint_orders_dependency_first() {
        let ordered = order_extensions(vec![
            record(ExtensionConfig::new("a", "p")),
            record(ExtensionConfig::new("b", "p").with_after(["a"])),
        ])
        .unwrap();
        assert_eq!(ids(&ordered), ["a", "b"]);
    }

    #[test]
    fn before_constraint_orders_declarer_first() {
        let ordered = order_extensions(vec![
            record(ExtensionConfig::new("a", "p")),
            record(ExtensionConfig::new("b", "p").with_before(["a"])),
        ])
        .unwrap();
        assert_eq!(ids(&ordered), ["b", "a"]);
    }

    #[test]
    fn later_registered_goes_first_among_equals() {
        let ordered = order_extensions(vec![
            record(ExtensionConfig::new("x", "p")),
            record(ExtensionConfig::new("y", "p")),
        ])
        .unwrap();
        assert_eq!(ids(&ordered), ["y", "x"]);
    }

    #[test]
    fn mixed_before_and_after_constraints() {
        let ordered = order_extensions(vec![
            record(ExtensionConfig::new("a", "p")),
            record(ExtensionConfig::new("b", "p").with_after(["a"])),
            record(
                ExtensionConfig::new("c", "p")
                    .with_after(["a"])
                    .with_before(["b"]),
            ),
        ])
        .unwrap();
        assert_eq!(ids(&ordered), ["a", "c", "b"]);
    }

    #[test]
    fn transitive_chain_with_independent_peer() {
        let ordered = order_extensions(vec![
            record(ExtensionConfig::new("a", "p")),
            record(ExtensionConfig::new("b", "p").with_after(["a"])),
            record(ExtensionConfig::new("c", "p").with_after(["b"])),
            record(ExtensionConfig::new("d", "p")),
        ])
        .unwrap();
        assert_eq!(ids(&ordered), ["d", "a", "b", "c"]);
    }

    #[test]
    fn unknown_references_are_optional() {
        let ordered = order_extensions(vec![record(
            ExtensionConfig::new("d", "p").with_after(["ghost"]),
        )])
        .unwrap();
        assert_eq!(ids(&ordered), ["d"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = order_extensions(vec![
            record(ExtensionConfig::new("a", "p")),
            record(ExtensionConfig::new("a", "p")),
        ])
        .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateExtension(id) if id == "a"));
    }

    #[test]
    fn cycles_are_rejected_with_an_edge() {
        let err = order_extensions(vec![
            record(ExtensionConfig::new("p", "point").with_after(["q"])),
            record(ExtensionConfig::new("q", "point").with_after(["p"])),
        ])
        .unwrap_err();
        match err {
            ManagerError::CircularDependency { id, dependency } => {
                assert!(["p", "q"].contains(&id.as_str()));
                assert!(["p", "q"].contains(&dependency.as_str()));
                assert_ne!(id, dependency);
            }
            other => panic!("expected a cycle error, got {other}"),
        }
    }

    #[test]
    fn ordering_is_deterministic() {
        let build = || {
            vec![
                record(ExtensionConfig::new("a", "p")),
                record(ExtensionConfig::new("b", "p").with_after(["a"])),
                record(ExtensionConfig::new("c", "p")),
                record(ExtensionConfig::new("d", "p").with_before(["c"])),
            ]
        };
        let first = order_extensions(build()).unwrap();
        let second = order_extensions(build()).unwrap();
        assert_eq!(ids(&first), ids(&second));
    }
}
