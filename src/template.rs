//! Structural template detection: group nodes that look alike (same op
//! mix, same internal shape) share a small integer id so a renderer can
//! color repeated structures consistently.

use std::collections::HashMap;

use itertools::Itertools;
use petgraph::Direction;
use ustr::Ustr;

use crate::hierarchy::{GroupKind, GroupNode, Hierarchy, HierNode};

/// Degrees of each metagraph node, sorted; two groups with different
/// degree sequences are never the same template.
fn degree_sequence(group: &GroupNode) -> Vec<usize> {
    let mut degrees: Vec<usize> = group
        .metagraph
        .nodes()
        .map(|n| {
            group
                .metagraph
                .neighbors_directed(n, Direction::Incoming)
                .count()
                + group
                    .metagraph
                    .neighbors_directed(n, Direction::Outgoing)
                    .count()
        })
        .collect();
    degrees.sort_unstable();
    degrees
}

fn signature(group: &GroupNode) -> String {
    let kind = match &group.kind {
        GroupKind::Meta => "meta".to_string(),
        GroupKind::Series(info) => format!("series:{}:{}", info.op, info.ids.len()),
    };
    let ops = group
        .op_histogram
        .iter()
        .map(|(op, count)| format!("{}={}", op, count))
        .join(",");
    let degrees = degree_sequence(group).iter().join("-");
    format!("{}|d{}|{}|{}", kind, group.depth, ops, degrees)
}

/// Assign a template id to every group node.  Ids are dense and ordered
/// by the first group name (ascending) that exhibits each signature, so
/// the assignment is stable across runs.
pub fn assign_templates(hierarchy: &Hierarchy) -> HashMap<Ustr, usize> {
    let mut group_names: Vec<Ustr> = hierarchy
        .node_names()
        .filter(|name| {
            matches!(hierarchy.node(*name), Some(HierNode::Group(_)))
        })
        .collect();
    group_names.sort();

    let mut ids_by_signature: HashMap<String, usize> = HashMap::new();
    let mut assignment = HashMap::new();
    for name in group_names {
        let group = match hierarchy.node(name) {
            Some(HierNode::Group(g)) => g,
            _ => continue,
        };
        let sig = signature(group);
        let next = ids_by_signature.len();
        let id = *ids_by_signature.entry(sig).or_insert(next);
        assignment.insert(name, id);
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildParams, NodeAttributes, RawNode};
    use crate::hierarchy::{build, HierarchyParams};
    use crate::progress::LogTracker;
    use ustr::ustr;

    fn raw(name: &str, op: &str, inputs: &[&str]) -> RawNode {
        RawNode {
            name: name.to_string(),
            op: op.to_string(),
            device: None,
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![],
            degree: None,
            attributes: NodeAttributes::default(),
        }
    }

    fn hierarchy_of(raw_nodes: Vec<RawNode>) -> Hierarchy {
        let graph =
            crate::graph::build(raw_nodes, &BuildParams::default(), &LogTracker).unwrap();
        build(graph, &HierarchyParams::default(), &LogTracker).unwrap()
    }

    #[test]
    fn isomorphic_groups_share_a_template() {
        let h = hierarchy_of(vec![
            raw("tower1/conv", "Conv", &[]),
            raw("tower1/relu", "Relu", &["tower1/conv"]),
            raw("tower2/conv", "Conv", &[]),
            raw("tower2/relu", "Relu", &["tower2/conv"]),
            raw("other/pool", "Pool", &[]),
        ]);
        let templates = assign_templates(&h);
        assert_eq!(templates[&ustr("tower1")], templates[&ustr("tower2")]);
        assert_ne!(templates[&ustr("tower1")], templates[&ustr("other")]);
    }

    #[test]
    fn differing_internal_shape_splits_templates() {
        let h = hierarchy_of(vec![
            raw("a/x", "Op1", &[]),
            raw("a/y", "Op1", &["a/x"]),
            raw("b/x", "Op1", &[]),
            raw("b/y", "Op1", &[]), // same ops, no edge
        ]);
        let templates = assign_templates(&h);
        assert_ne!(templates[&ustr("a")], templates[&ustr("b")]);
    }

    #[test]
    fn ids_are_dense_and_ordered_by_first_appearance() {
        let h = hierarchy_of(vec![
            raw("a/x", "Op1", &[]),
            raw("b/x", "Op2", &[]),
            raw("c/x", "Op1", &[]),
        ]);
        let templates = assign_templates(&h);
        // Ids are dense and assigned in sorted-name order; a and c share
        // a signature.
        assert_eq!(templates[&ustr("a")], templates[&ustr("c")]);
        let mut ids: Vec<usize> = templates.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (0..ids.len()).collect::<Vec<_>>());
    }

    #[test]
    fn cached_template_index_matches_direct_assignment() {
        let mut h = hierarchy_of(vec![raw("a/x", "Op1", &[]), raw("b/x", "Op1", &[])]);
        let direct = assign_templates(&h);
        assert_eq!(h.get_template_index(), &direct);
    }
}
