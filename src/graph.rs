//! Flat "op graph" construction from raw node records.
//!
//! The raw document is a list of nodes whose `input` strings encode edges:
//! a leading `^` marks a control dependency and a `:suffix` names the
//! producing output.  Building normalizes those strings, renames nodes that
//! collide with a namespace (`a` next to `a/b` becomes `a/(a)`), and emits a
//! [`SlimGraph`] of nodes plus base edges for the hierarchy builder.

use std::collections::{BTreeMap, HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use ustr::{ustr, Ustr};

use crate::errors::{GraphError, Result};
use crate::progress::{run_phase, ProgressTracker};

pub const NAMESPACE_DELIM: char = '/';
pub const ROOT_NAME: &str = "__root__";

/// Per-node annotation marking maps the leaf to its series group name.
pub type SeriesNames = HashMap<Ustr, Ustr>;

/// Whether the user (or an extraction pass) has pinned a node into or out
/// of the rendered core graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InclusionType {
    Include,
    Exclude,
    Unspecified,
}

/// Per-series override of the automatic grouping decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesGrouping {
    Group,
    Ungroup,
}

/// Free-form metadata carried on a raw node.  For npm graphs this holds
/// the package name, version and resolution range.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Dependency resolution state reported by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One node record as it appears in the raw graph document.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNode {
    pub name: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
    /// Raw degree hint supplied by the producer; very connected nodes are
    /// pre-marked for extraction.
    #[serde(default)]
    pub degree: Option<u64>,
    #[serde(default, rename = "nodeAttributes")]
    pub attributes: NodeAttributes,
}

/// The top-level raw document: just a node list.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGraph {
    pub node: Vec<RawNode>,
}

/// An input reference after stripping the control marker and output key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedInput {
    pub name: Ustr,
    /// Which output of the producing node this consumes, `"0"` by default.
    pub output_key: String,
    pub is_control: bool,
}

/// A leaf node of the flat graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub name: Ustr,
    pub op: Ustr,
    pub device: Option<Ustr>,
    pub inputs: Vec<NormalizedInput>,
    pub outputs: Vec<NormalizedInput>,
    pub cardinality: u64,
    pub include: InclusionType,
    /// Name of the series group this node was folded into, if any.
    pub owning_series: Option<Ustr>,
    /// Name of the enclosing group once placed in a hierarchy.
    pub parent: Option<Ustr>,
    /// Nodes drawn embedded into this one (e.g. constants feeding it)
    /// rather than as standalone graph nodes.
    pub in_embeddings: Vec<OpNode>,
    pub out_embeddings: Vec<OpNode>,
    pub attributes: NodeAttributes,
}

impl OpNode {
    fn new(raw: RawNode) -> OpNode {
        let include = match raw.degree {
            Some(d) if d > EXCLUDE_DEGREE_DEFAULT => InclusionType::Exclude,
            _ => InclusionType::Unspecified,
        };
        OpNode {
            name: ustr(&raw.name),
            op: ustr(&raw.op),
            device: raw.device.as_deref().map(ustr),
            inputs: normalize_inputs(&raw.input),
            outputs: normalize_inputs(&raw.output),
            cardinality: 1,
            include,
            owning_series: None,
            parent: None,
            in_embeddings: Vec::new(),
            out_embeddings: Vec::new(),
            attributes: raw.attributes,
        }
    }
}

/// A single dependency between two leaf nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseEdge {
    pub v: Ustr,
    pub w: Ustr,
    pub output_key: String,
    pub is_control: bool,
    pub is_reference: bool,
}

/// Flat graph: every node keyed by (strict) name, plus the raw edge list.
/// Grouping into namespaces happens later, in the hierarchy builder.
#[derive(Debug, Default)]
pub struct SlimGraph {
    pub nodes: HashMap<Ustr, OpNode>,
    pub edges: Vec<BaseEdge>,
}

/// Raw-degree bound above which a node is pre-marked for extraction.
pub const EXCLUDE_DEGREE_DEFAULT: u64 = 5;

/// Configuration for [`build`].
#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    /// `(op, input index)` pairs whose edges pass data by reference.
    pub ref_edges: HashSet<(String, usize)>,
}

lazy_static! {
    // An output key is either `word:number` (function outputs) or a bare
    // number; try the longer form first.
    static ref FUNCTION_OUTPUT_RE: Regex = Regex::new(r"(.*):(\w+:\d+)$").unwrap();
    static ref NUMBERED_OUTPUT_RE: Regex = Regex::new(r"(.*):(\d+)$").unwrap();
}

/// Strip control markers and output keys from raw input strings.
/// Consecutive references to the same producer collapse into one.
fn normalize_inputs(inputs: &[String]) -> Vec<NormalizedInput> {
    let mut normalized: Vec<NormalizedInput> = Vec::new();
    for raw in inputs {
        let is_control = raw.starts_with('^');
        let stripped = if is_control { &raw[1..] } else { raw.as_str() };

        let (name, output_key) = if let Some(caps) = FUNCTION_OUTPUT_RE.captures(stripped) {
            (caps[1].to_string(), caps[2].to_string())
        } else if let Some(caps) = NUMBERED_OUTPUT_RE.captures(stripped) {
            (caps[1].to_string(), caps[2].to_string())
        } else {
            (stripped.to_string(), "0".to_string())
        };

        let is_dup = normalized
            .last()
            .map_or(false, |prev: &NormalizedInput| prev.name.as_str() == name);
        if !is_dup {
            normalized.push(NormalizedInput {
                name: ustr(&name),
                output_key,
                is_control,
            });
        }
    }
    normalized
}

/// Split a name into the chain of enclosing namespaces plus the name
/// itself, e.g. `a/b/c` yields `[a, a/b, a/b/c]`.  When `series_names`
/// maps the leaf to a series group, the series name is inserted just
/// before the leaf.
pub fn hierarchical_path(name: Ustr, series_names: Option<&SeriesNames>) -> Vec<Ustr> {
    let mut path = Vec::new();
    let text = name.as_str();
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(NAMESPACE_DELIM) {
        let idx = search_from + rel;
        path.push(ustr(&text[..idx]));
        search_from = idx + 1;
    }
    if let Some(series) = series_names.and_then(|map| map.get(&name)) {
        path.push(*series);
    }
    path.push(name);
    path
}

/// Strict node name (`name` => `name/(name)`), used when a node's name is
/// also a namespace.
pub fn strict_name(name: &str) -> String {
    let leaf = name
        .rsplit(NAMESPACE_DELIM)
        .next()
        .unwrap_or(name);
    format!("{}{}({})", name, NAMESPACE_DELIM, leaf)
}

/// Find the nodes whose names are also namespaces of other nodes and map
/// them to their strict names.  Sorting first makes the prefix scan cheap:
/// any node nested under `a` sorts into the contiguous run after `a`.
fn map_strict_hierarchy(node_names: &mut Vec<String>) -> HashMap<String, String> {
    let mut renames = HashMap::new();
    node_names.sort();
    for i in 0..node_names.len().saturating_sub(1) {
        let a = &node_names[i];
        for b in &node_names[i + 1..] {
            if b.starts_with(a.as_str()) {
                if b.len() > a.len() && b.as_bytes()[a.len()] == NAMESPACE_DELIM as u8 {
                    renames.insert(a.clone(), strict_name(a));
                    break;
                }
            } else {
                break;
            }
        }
    }
    renames
}

/// Build a [`SlimGraph`] from raw node records.  Two phases: normalize the
/// node names (30%), then assemble the node map and edge list (70%).
pub fn build(
    raw_nodes: Vec<RawNode>,
    params: &BuildParams,
    tracker: &dyn ProgressTracker,
) -> Result<SlimGraph> {
    if raw_nodes.is_empty() {
        let err = GraphError::bad_input("the graph is empty");
        tracker.report_error("Building the data structure", &err);
        return Err(err);
    }
    let (op_nodes, mut node_names) = run_phase(tracker, "Normalizing names", 30.0, || {
        let mut op_nodes = Vec::with_capacity(raw_nodes.len());
        let mut node_names = Vec::with_capacity(raw_nodes.len());
        for raw in raw_nodes {
            let node = OpNode::new(raw);
            node_names.push(node.name.to_string());
            op_nodes.push(node);
        }
        Ok((op_nodes, node_names))
    })?;

    run_phase(tracker, "Building the data structure", 70.0, || {
        let renames = map_strict_hierarchy(&mut node_names);
        let mut graph = SlimGraph::default();

        let mapped = |name: Ustr| -> Ustr {
            match renames.get(name.as_str()) {
                Some(new_name) => ustr(new_name),
                None => name,
            }
        };

        for mut node in op_nodes {
            node.name = mapped(node.name);
            for (i, input) in node.inputs.iter().enumerate() {
                let input_name = mapped(input.name);
                // No self loops.
                if input_name == node.name {
                    continue;
                }
                let is_reference = params
                    .ref_edges
                    .contains(&(node.op.to_string(), i));
                graph.edges.push(BaseEdge {
                    v: input_name,
                    w: node.name,
                    output_key: input.output_key.clone(),
                    is_control: input.is_control,
                    is_reference,
                });
            }
            graph.nodes.insert(node.name, node);
        }
        Ok(graph)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogTracker;

    fn raw(name: &str, inputs: &[&str]) -> RawNode {
        RawNode {
            name: name.to_string(),
            op: "OP".to_string(),
            device: None,
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![],
            degree: None,
            attributes: NodeAttributes::default(),
        }
    }

    #[test]
    fn normalize_strips_control_marker_and_output_keys() {
        let inputs = vec![
            "^ctl".to_string(),
            "plain".to_string(),
            "tensor:1".to_string(),
            "func:out:2".to_string(),
        ];
        let normalized = normalize_inputs(&inputs);
        assert_eq!(normalized.len(), 4);
        assert!(normalized[0].is_control);
        assert_eq!(normalized[0].name.as_str(), "ctl");
        assert_eq!(normalized[0].output_key, "0");
        assert!(!normalized[1].is_control);
        assert_eq!(normalized[2].name.as_str(), "tensor");
        assert_eq!(normalized[2].output_key, "1");
        assert_eq!(normalized[3].name.as_str(), "func");
        assert_eq!(normalized[3].output_key, "out:2");
    }

    #[test]
    fn normalize_collapses_consecutive_duplicates() {
        let inputs = vec![
            "a:0".to_string(),
            "a:1".to_string(),
            "b".to_string(),
            "a".to_string(),
        ];
        let normalized = normalize_inputs(&inputs);
        let names: Vec<&str> = normalized.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn hierarchical_path_includes_every_ancestor() {
        let path = hierarchical_path(ustr("a/b/c"), None);
        let names: Vec<&str> = path.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["a", "a/b", "a/b/c"]);
    }

    #[test]
    fn hierarchical_path_inserts_series_before_leaf() {
        let mut series = SeriesNames::new();
        series.insert(ustr("g/foo_2"), ustr("g/foo[1-3]"));
        let path = hierarchical_path(ustr("g/foo_2"), Some(&series));
        let names: Vec<&str> = path.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["g", "g/foo[1-3]", "g/foo_2"]);
    }

    #[test]
    fn empty_graphs_are_rejected() {
        let result = build(vec![], &BuildParams::default(), &LogTracker);
        assert!(matches!(result, Err(GraphError::BadInput(_))));
    }

    #[test]
    fn namespace_collision_renames_node_and_rekeys_edges() {
        let raw_nodes = vec![
            raw("a", &[]),
            raw("a/b", &["a"]),
            raw("c", &["a"]),
        ];
        let graph = build(raw_nodes, &BuildParams::default(), &LogTracker).unwrap();
        assert!(graph.nodes.contains_key(&ustr("a/(a)")));
        assert!(!graph.nodes.contains_key(&ustr("a")));
        // Both consumers now point at the strict name.
        for edge in &graph.edges {
            assert_eq!(edge.v.as_str(), "a/(a)");
        }
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn self_loops_are_dropped() {
        let graph = build(
            vec![raw("x", &["x", "y"]), raw("y", &[])],
            &BuildParams::default(),
            &LogTracker,
        )
        .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].v.as_str(), "y");
        assert_eq!(graph.edges[0].w.as_str(), "x");
    }

    #[test]
    fn high_raw_degree_marks_node_excluded() {
        let mut hub = raw("hub", &[]);
        hub.degree = Some(9);
        let graph = build(
            vec![hub, raw("leaf", &[])],
            &BuildParams::default(),
            &LogTracker,
        )
        .unwrap();
        assert_eq!(
            graph.nodes[&ustr("hub")].include,
            InclusionType::Exclude
        );
        assert_eq!(
            graph.nodes[&ustr("leaf")].include,
            InclusionType::Unspecified
        );
    }

    #[test]
    fn reference_edges_follow_the_op_index_whitelist() {
        let mut params = BuildParams::default();
        params.ref_edges.insert(("OP".to_string(), 1));
        let graph = build(
            vec![raw("sink", &["a", "b"]), raw("a", &[]), raw("b", &[])],
            &params,
            &LogTracker,
        )
        .unwrap();
        let by_source: HashMap<&str, &BaseEdge> = graph
            .edges
            .iter()
            .map(|e| (e.v.as_str(), e))
            .collect();
        assert!(!by_source["a"].is_reference);
        assert!(by_source["b"].is_reference);
    }
}
