//! Deterministic dependency ordering via Kahn's algorithm (spec §4.3).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use apcore_errors::ApcoreError;

use crate::module::DependencyInfo;

/// Orders `module_ids` so that every required (non-optional) dependency
/// named in `deps` precedes its dependent, breaking ties by ascending
/// module id for reproducible output.
///
/// Optional dependencies that are not in `module_ids` are ignored.
///
/// # Errors
/// Returns `ApcoreError::ModuleLoadError` if a required (non-optional)
/// dependency names a module id that was not discovered. Returns
/// `ApcoreError::CircularDependency` with the full cycle path (e.g.
/// `["a", "b", "c", "a"]`) if `deps` contains a cycle among `module_ids`.
pub fn topological_order(
    module_ids: &[String],
    deps: &BTreeMap<String, Vec<DependencyInfo>>,
) -> Result<Vec<String>, ApcoreError> {
    let known: BTreeSet<&str> = module_ids.iter().map(String::as_str).collect();

    let mut in_degree: BTreeMap<&str, usize> = module_ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for id in module_ids {
        for d in deps.get(id).into_iter().flatten() {
            if d.optional {
                continue;
            }
            if !known.contains(d.module_id.as_str()) {
                return Err(ApcoreError::module_load_error(
                    id.clone(),
                    format!("unknown required dependency '{}'", d.module_id),
                ));
            }
            if edges.entry(d.module_id.as_str()).or_default().insert(id.as_str()) {
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut queue: VecDeque<&str> = ready.iter().copied().collect();
    let mut ordered: Vec<&str> = Vec::with_capacity(module_ids.len());

    while let Some(next) = pop_smallest(&mut queue, &mut ready) {
        ordered.push(next);
        if let Some(dependents) = edges.get(next) {
            for &dependent in dependents {
                let count = in_degree.get_mut(dependent).expect("dependent tracked in in_degree");
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                    queue.push_back(dependent);
                }
            }
        }
    }

    if ordered.len() != module_ids.len() {
        let remaining: BTreeSet<&str> = known
            .into_iter()
            .filter(|id| !ordered.contains(id))
            .collect();
        let cycle = extract_cycle(&remaining, &edges);
        return Err(ApcoreError::circular_dependency(cycle));
    }

    Ok(ordered.into_iter().map(ToOwned::to_owned).collect())
}

/// Pops the lexicographically-smallest ready node, for deterministic output
/// independent of `BTreeMap`/`HashMap` iteration order.
fn pop_smallest<'a>(queue: &mut VecDeque<&'a str>, ready: &mut BTreeSet<&'a str>) -> Option<&'a str> {
    let smallest = *ready.iter().next()?;
    ready.remove(smallest);
    if let Some(pos) = queue.iter().position(|&id| id == smallest) {
        queue.remove(pos);
    }
    Some(smallest)
}

fn extract_cycle<'a>(remaining: &BTreeSet<&'a str>, edges: &BTreeMap<&'a str, BTreeSet<&'a str>>) -> Vec<String> {
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    visited.insert(start);
    let mut current = start;

    loop {
        let next = edges
            .iter()
            .find(|(_, targets)| targets.contains(current))
            .map(|(&source, _)| source)
            .filter(|source| remaining.contains(source));
        let Some(next) = next else { break };
        if let Some(pos) = path.iter().position(|&id| id == next) {
            path.truncate(pos);
            path.insert(0, next);
            break;
        }
        path.insert(0, next);
        visited.insert(next);
        current = next;
        if visited.len() > remaining.len() {
            break;
        }
    }

    path.push(path[0]);
    path.into_iter().map(ToOwned::to_owned).collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn dep(id: &str) -> DependencyInfo {
        DependencyInfo {
            module_id: id.to_owned(),
            version: None,
            optional: false,
        }
    }

    fn optional_dep(id: &str) -> DependencyInfo {
        DependencyInfo {
            module_id: id.to_owned(),
            version: None,
            optional: true,
        }
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let ids = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let mut deps = BTreeMap::new();
        deps.insert("c".to_owned(), vec![dep("b")]);
        deps.insert("b".to_owned(), vec![dep("a")]);

        let order = topological_order(&ids, &deps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let ids = vec!["z".to_owned(), "a".to_owned(), "m".to_owned()];
        let order = topological_order(&ids, &BTreeMap::new()).unwrap();
        assert_eq!(order, vec!["a", "m", "z"]);
    }

    #[test]
    fn detects_simple_cycle() {
        let ids = vec!["a".to_owned(), "b".to_owned()];
        let mut deps = BTreeMap::new();
        deps.insert("a".to_owned(), vec![dep("b")]);
        deps.insert("b".to_owned(), vec![dep("a")]);

        let err = topological_order(&ids, &deps).unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
    }

    #[test]
    fn optional_missing_dependency_is_ignored() {
        let ids = vec!["a".to_owned()];
        let mut deps = BTreeMap::new();
        deps.insert("a".to_owned(), vec![optional_dep("ghost")]);
        let order = topological_order(&ids, &deps).unwrap();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn required_missing_dependency_is_a_load_error() {
        let ids = vec!["a".to_owned()];
        let mut deps = BTreeMap::new();
        deps.insert("a".to_owned(), vec![dep("not-discovered")]);
        let err = topological_order(&ids, &deps).unwrap_err();
        assert_eq!(err.code(), "MODULE_LOAD_ERROR");
    }
}
