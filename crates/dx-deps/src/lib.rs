#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use dx_lang::AstNode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("circular dependency involving column '{column}'")]
    Circular { column: String },
}

/// Every column name an expression references, including names nested inside
/// function calls and array literals.
#[must_use]
pub fn extract_column_refs(node: &AstNode) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    collect_refs(node, &mut refs);
    refs
}

fn collect_refs(node: &AstNode, refs: &mut BTreeSet<String>) {
    match node {
        AstNode::ColumnRef { name } => {
            refs.insert(name.clone());
        }
        AstNode::Unary { operand, .. } => collect_refs(operand, refs),
        AstNode::Binary { left, right, .. } => {
            collect_refs(left, refs);
            collect_refs(right, refs);
        }
        AstNode::Call { args, .. } => {
            for arg in args {
                collect_refs(arg, refs);
            }
        }
        AstNode::Array { elements } => {
            for element in elements {
                collect_refs(element, refs);
            }
        }
        AstNode::Number { .. } | AstNode::Str { .. } | AstNode::Bool { .. } => {}
    }
}

/// Adjacency map for a set of proposed transforms: each column name maps to
/// the set of columns its expression depends on. Names absent from the map
/// (source columns) are leaves.
#[must_use]
pub fn build_dependency_map(transforms: &[(String, AstNode)]) -> BTreeMap<String, BTreeSet<String>> {
    transforms
        .iter()
        .map(|(name, ast)| (name.clone(), extract_column_refs(ast)))
        .collect()
}

/// DFS with a recursion stack. A self-reference counts as a cycle; edges to
/// names outside the map terminate (those dependencies already exist).
#[must_use]
pub fn has_circular_dependency(dep_map: &BTreeMap<String, BTreeSet<String>>) -> bool {
    let mut visited = BTreeSet::new();
    let mut in_stack = BTreeSet::new();
    for node in dep_map.keys() {
        if dfs_cycles(node, dep_map, &mut visited, &mut in_stack) {
            return true;
        }
    }
    false
}

fn dfs_cycles(
    node: &str,
    dep_map: &BTreeMap<String, BTreeSet<String>>,
    visited: &mut BTreeSet<String>,
    in_stack: &mut BTreeSet<String>,
) -> bool {
    if in_stack.contains(node) {
        return true;
    }
    if visited.contains(node) {
        return false;
    }
    visited.insert(node.to_owned());
    if let Some(deps) = dep_map.get(node) {
        in_stack.insert(node.to_owned());
        for dep in deps {
            if dfs_cycles(dep, dep_map, visited, in_stack) {
                return true;
            }
        }
        in_stack.remove(node);
    }
    false
}

/// Kahn's algorithm over the map's keys. Dependencies come before their
/// dependents; ready nodes drain in name order so the result is
/// deterministic. Fails rather than returning a partial order when a cycle
/// is present — callers must reject the batch before executing anything.
pub fn topological_sort(
    dep_map: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, CycleError> {
    // In-degree counts only edges between map keys; external names are
    // already-satisfied leaves.
    let mut in_degree: BTreeMap<&str, usize> = dep_map.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in dep_map {
        for dep in deps {
            if dep_map.contains_key(dep) {
                if let Some(count) = in_degree.get_mut(node.as_str()) {
                    *count += 1;
                }
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(dep_map.len());

    while let Some(node) = ready.pop_front() {
        order.push(node.to_owned());
        if let Some(children) = dependents.get(node) {
            for child in children {
                if let Some(count) = in_degree.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }
    }

    if order.len() != dep_map.len() {
        let stuck = in_degree
            .iter()
            .find(|(_, count)| **count > 0)
            .map_or_else(String::new, |(node, _)| (*node).to_owned());
        return Err(CycleError::Circular { column: stuck });
    }
    Ok(order)
}

/// Reverse lookup: which defined columns reference `column`? Used to warn or
/// block when removing or redefining a column others depend on.
#[must_use]
pub fn find_dependents(
    column: &str,
    all_definitions: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    all_definitions
        .iter()
        .filter(|(name, deps)| name.as_str() != column && deps.contains(column))
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use dx_lang::parse;

    use super::{
        build_dependency_map, extract_column_refs, find_dependents, has_circular_dependency,
        topological_sort,
    };

    fn map(entries: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(name, deps)| {
                (
                    (*name).to_owned(),
                    deps.iter().map(|d| (*d).to_owned()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn extraction_reaches_into_calls_and_arrays() {
        let ast = parse("cut(row_mean(a, b), [lo, hi]) + `First Name`").expect("parse");
        let refs = extract_column_refs(&ast);
        let expected: BTreeSet<String> = ["a", "b", "lo", "hi", "First Name"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert_eq!(refs, expected);
    }

    #[test]
    fn literals_contribute_no_refs() {
        let ast = parse("1 + 2 * 3 == \"x\"").expect("parse");
        assert!(extract_column_refs(&ast).is_empty());
    }

    #[test]
    fn dependency_map_covers_each_transform() {
        let transforms = vec![
            ("b".to_owned(), parse("a + 1").expect("b")),
            ("c".to_owned(), parse("b * 2").expect("c")),
        ];
        let dep_map = build_dependency_map(&transforms);
        assert_eq!(dep_map["b"], ["a".to_owned()].into_iter().collect());
        assert_eq!(dep_map["c"], ["b".to_owned()].into_iter().collect());
    }

    #[test]
    fn self_reference_is_a_cycle() {
        assert!(has_circular_dependency(&map(&[("x", &["x"])])));
    }

    #[test]
    fn two_node_cycle_detected_and_sort_fails() {
        let dep_map = map(&[("x", &["y"]), ("y", &["x"])]);
        assert!(has_circular_dependency(&dep_map));
        assert!(topological_sort(&dep_map).is_err());
    }

    #[test]
    fn acyclic_map_with_external_leaves_is_clean() {
        let dep_map = map(&[("b", &["a"]), ("c", &["b", "a"])]);
        assert!(!has_circular_dependency(&dep_map));
    }

    #[test]
    fn sort_places_dependencies_first() {
        let dep_map = map(&[("c", &["b"]), ("b", &["a"]), ("d", &["c", "b"])]);
        let order = topological_sort(&dep_map).expect("order");
        let pos =
            |name: &str| order.iter().position(|n| n == name).expect("present");
        assert!(pos("b") < pos("c"));
        assert!(pos("c") < pos("d"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn dependents_lookup_is_reverse_of_the_map() {
        let dep_map = map(&[("b", &["a"]), ("c", &["a", "b"]), ("d", &["c"])]);
        assert_eq!(find_dependents("a", &dep_map), vec!["b", "c"]);
        assert_eq!(find_dependents("d", &dep_map), Vec::<String>::new());
    }
}
