//! Render-time view of a [`Hierarchy`]: per expanded group node, a "core"
//! subgraph restricted to that group's immediate children, with
//! high-degree and control-only clutter moved into annotation lists
//! instead of rendered edges.
//!
//! Core graphs are built lazily per expansion, and the extraction order
//! matters: explicitly excluded nodes first, then predefined sink/source
//! op types, then statistical high-degree extraction, then control-edge
//! thinning, and finally a sweep for nodes the earlier passes isolated.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde_json::{json, Value};
use ustr::{ustr, Ustr};

use crate::errors::{GraphError, Result};
use crate::graph::{hierarchical_path, strict_name, InclusionType};
use crate::hierarchy::{GroupKind, HierNode, Hierarchy, Metaedge};

/// Core subgraph of one expanded group, over child names.
pub type CoreGraph = DiGraphMap<Ustr, RenderMetaedgeInfo>;

/// Thresholds and toggles for render-graph construction.  These replace
/// what the visualization layer would otherwise keep as mutable globals.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub enable_extraction: bool,
    /// Groups with fewer candidate children than this skip statistical
    /// degree extraction entirely.
    pub min_node_count_for_extraction: usize,
    /// A node must reach this in- or out-degree before the quartile rule
    /// may extract it.
    pub min_degree_for_extraction: usize,
    /// Control edges beyond this many per node become annotations.
    pub max_control_degree: usize,
    /// Sink-like op types always extracted from the core graph.
    pub out_extract_types: Vec<String>,
    /// Source-like op types always extracted from the core graph.
    pub in_extract_types: Vec<String>,
    /// When extracting a high-degree node, detach all of its edges
    /// instead of only the high side.
    pub detach_all_edges_for_high_degree: bool,
    /// Sweep nodes that end up isolated with annotations on exactly one
    /// side into the matching extract list.
    pub extract_isolated_nodes_with_annotations_on_one_side: bool,
    /// Annotations shown per side before an ellipsis stands in.
    pub max_annotations: usize,
}

impl Default for RenderParams {
    fn default() -> Self {
        RenderParams {
            enable_extraction: true,
            min_node_count_for_extraction: 15,
            min_degree_for_extraction: 40,
            max_control_degree: 4,
            out_extract_types: vec!["NoOp".to_string()],
            in_extract_types: vec![],
            detach_all_edges_for_high_degree: true,
            extract_isolated_nodes_with_annotations_on_one_side: true,
            max_annotations: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Shortcut,
    Constant,
    Summary,
    Ellipsis,
}

impl AnnotationKind {
    fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Shortcut => "shortcut",
            AnnotationKind::Constant => "constant",
            AnnotationKind::Summary => "summary",
            AnnotationKind::Ellipsis => "ellipsis",
        }
    }
}

/// A node drawn small beside its host instead of inside the core graph.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub node_name: Ustr,
    pub kind: AnnotationKind,
    pub is_in: bool,
    /// The aggregate edge this annotation stands in for, when any.
    pub metaedge: Option<Metaedge>,
    /// How many further annotations an ellipsis covers.
    pub num_more_nodes: usize,
}

impl Annotation {
    fn shortcut(node_name: Ustr, is_in: bool, metaedge: Option<Metaedge>) -> Annotation {
        Annotation {
            node_name,
            kind: AnnotationKind::Shortcut,
            is_in,
            metaedge,
            num_more_nodes: 0,
        }
    }
}

/// Annotation list for one side of a node.  Deduplicates by target name
/// and collapses overflow beyond `max_annotations` into one ellipsis.
#[derive(Debug, Default)]
pub struct AnnotationList {
    pub list: Vec<Annotation>,
    names: HashSet<Ustr>,
}

impl AnnotationList {
    fn push(&mut self, max_annotations: usize, annotation: Annotation) {
        if self.names.contains(&annotation.node_name) {
            return;
        }
        self.names.insert(annotation.node_name);

        if self.list.len() < max_annotations {
            self.list.push(annotation);
            return;
        }
        if let Some(last) = self.list.last_mut() {
            if last.kind == AnnotationKind::Ellipsis {
                last.num_more_nodes += 1;
                return;
            }
        }
        self.list.push(Annotation {
            node_name: ustr("..."),
            kind: AnnotationKind::Ellipsis,
            is_in: annotation.is_in,
            metaedge: None,
            num_more_nodes: 1,
        });
    }

    pub fn contains(&self, name: Ustr) -> bool {
        self.names.contains(&name)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Rendering state of one node.
#[derive(Debug, Default)]
pub struct RenderNodeInfo {
    pub name: Ustr,
    pub expanded: bool,
    pub in_annotations: AnnotationList,
    pub out_annotations: AnnotationList,
    pub is_in_extract: bool,
    pub is_out_extract: bool,
}

impl RenderNodeInfo {
    fn new(name: Ustr) -> RenderNodeInfo {
        RenderNodeInfo {
            name,
            ..Default::default()
        }
    }
}

/// Rendering state of a group node: the shared fields plus its core
/// graph and the children extracted out of it.
#[derive(Debug)]
pub struct RenderGroupNodeInfo {
    pub info: RenderNodeInfo,
    pub core_graph: CoreGraph,
    pub isolated_in_extract: Vec<Ustr>,
    pub isolated_out_extract: Vec<Ustr>,
}

impl RenderGroupNodeInfo {
    fn new(name: Ustr) -> RenderGroupNodeInfo {
        RenderGroupNodeInfo {
            info: RenderNodeInfo::new(name),
            core_graph: CoreGraph::new(),
            isolated_in_extract: Vec::new(),
            isolated_out_extract: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum RenderNode {
    Leaf(RenderNodeInfo),
    Group(RenderGroupNodeInfo),
}

impl RenderNode {
    pub fn info(&self) -> &RenderNodeInfo {
        match self {
            RenderNode::Leaf(info) => info,
            RenderNode::Group(group) => &group.info,
        }
    }

    pub fn info_mut(&mut self) -> &mut RenderNodeInfo {
        match self {
            RenderNode::Leaf(info) => info,
            RenderNode::Group(group) => &mut group.info,
        }
    }

    pub fn as_group(&self) -> Option<&RenderGroupNodeInfo> {
        match self {
            RenderNode::Group(group) => Some(group),
            RenderNode::Leaf(_) => None,
        }
    }
}

/// Renderable edge wrapping the aggregate it was copied from.
#[derive(Debug, Clone)]
pub struct RenderMetaedgeInfo {
    pub metaedge: Option<Metaedge>,
}

/// Per-expansion render state over a hierarchy.  Owns the hierarchy
/// because extraction writes inclusion decisions back onto its nodes.
#[derive(Debug)]
pub struct RenderGraphInfo {
    pub hierarchy: Hierarchy,
    params: RenderParams,
    index: HashMap<Ustr, RenderNode>,
    has_subhierarchy: HashSet<Ustr>,
    rendered_names: Vec<Ustr>,
    root_name: Ustr,
}

impl RenderGraphInfo {
    /// Wrap a hierarchy and eagerly build the root's core graph; nested
    /// groups stay unbuilt until expanded.
    pub fn new(hierarchy: Hierarchy, params: RenderParams) -> Result<RenderGraphInfo> {
        let root_name = hierarchy.root_name();
        let mut render = RenderGraphInfo {
            hierarchy,
            params,
            index: HashMap::new(),
            has_subhierarchy: HashSet::new(),
            rendered_names: Vec::new(),
            root_name,
        };
        render.get_or_create_render_node(root_name)?;
        render.build_subhierarchy(root_name)?;
        if let Some(root) = render.index.get_mut(&root_name) {
            root.info_mut().expanded = true;
        }
        Ok(render)
    }

    pub fn root_name(&self) -> Ustr {
        self.root_name
    }

    pub fn get_render_node(&self, name: Ustr) -> Option<&RenderNode> {
        self.index.get(&name)
    }

    /// Names rendered so far; only ever grows as groups are expanded.
    pub fn rendered_names(&self) -> &[Ustr] {
        &self.rendered_names
    }

    /// Look up render info for `name`, creating it if the hierarchy
    /// knows the node.  Unknown names are the caller's error.
    pub fn get_or_create_render_node(&mut self, name: Ustr) -> Result<&RenderNode> {
        if !self.index.contains_key(&name) {
            let render = match self.hierarchy.node(name) {
                Some(HierNode::Group(_)) => RenderNode::Group(RenderGroupNodeInfo::new(name)),
                Some(HierNode::Op(_)) => RenderNode::Leaf(RenderNodeInfo::new(name)),
                None => {
                    return Err(GraphError::not_found(format!(
                        "no node named {} in the hierarchy",
                        name
                    )))
                }
            };
            self.index.insert(name, render);
            self.rendered_names.push(name);
        }
        self.index
            .get(&name)
            .ok_or_else(|| GraphError::invariant("render node vanished after insertion"))
    }

    /// Mark a group expanded, building its subhierarchy on first use.
    pub fn expand_node(&mut self, name: Ustr) -> Result<()> {
        self.get_or_create_render_node(name)?;
        self.build_subhierarchy(name)?;
        if let Some(node) = self.index.get_mut(&name) {
            node.info_mut().expanded = true;
        }
        Ok(())
    }

    /// Expand every group in the hierarchy, depth first.
    pub fn expand_all(&mut self) -> Result<()> {
        let mut stack = vec![self.root_name];
        while let Some(name) = stack.pop() {
            self.expand_node(name)?;
            if let Some(HierNode::Group(group)) = self.hierarchy.node(name) {
                for child in group.metagraph.nodes() {
                    if matches!(self.hierarchy.node(child), Some(HierNode::Group(_))) {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the core graph for one group: copy its metagraph children
    /// and metaedges, then run the extraction passes.  Idempotent.
    pub fn build_subhierarchy(&mut self, name: Ustr) -> Result<()> {
        if self.has_subhierarchy.contains(&name) {
            return Ok(());
        }
        self.has_subhierarchy.insert(name);
        self.get_or_create_render_node(name)?;

        let (children, metaedges, is_meta) = match self.hierarchy.node(name) {
            Some(HierNode::Group(group)) => {
                let children: Vec<Ustr> = group.metagraph.nodes().collect();
                let metaedges: Vec<(Ustr, Ustr, Metaedge)> = group
                    .metagraph
                    .all_edges()
                    .map(|(v, w, metaedge)| (v, w, metaedge.clone()))
                    .collect();
                (children, metaedges, matches!(group.kind, GroupKind::Meta))
            }
            // Op nodes have no subhierarchy.
            _ => return Ok(()),
        };

        for child in &children {
            self.get_or_create_render_node(*child)?;
            let (in_embedded, out_embedded) = match self.hierarchy.node(*child) {
                Some(HierNode::Op(op)) => (
                    op.in_embeddings.iter().map(|e| e.name).collect::<Vec<_>>(),
                    op.out_embeddings.iter().map(|e| e.name).collect::<Vec<_>>(),
                ),
                _ => (Vec::new(), Vec::new()),
            };
            for embedded in in_embedded {
                self.add_annotation(
                    *child,
                    true,
                    Annotation {
                        node_name: embedded,
                        kind: AnnotationKind::Constant,
                        is_in: true,
                        metaedge: None,
                        num_more_nodes: 0,
                    },
                );
            }
            for embedded in out_embedded {
                self.add_annotation(
                    *child,
                    false,
                    Annotation {
                        node_name: embedded,
                        kind: AnnotationKind::Summary,
                        is_in: false,
                        metaedge: None,
                        num_more_nodes: 0,
                    },
                );
            }
        }

        let mut core = CoreGraph::new();
        for child in &children {
            core.add_node(*child);
        }
        for (v, w, metaedge) in metaedges {
            core.add_edge(
                v,
                w,
                RenderMetaedgeInfo {
                    metaedge: Some(metaedge),
                },
            );
        }

        let mut isolated_in = Vec::new();
        let mut isolated_out = Vec::new();
        // Series groups render as a unit, so extraction only applies to
        // namespace metanodes.
        if self.params.enable_extraction && is_meta {
            self.extract_high_degrees(&mut core, &mut isolated_in, &mut isolated_out)?;
        }

        match self.index.get_mut(&name) {
            Some(RenderNode::Group(group)) => {
                group.core_graph = core;
                group.isolated_in_extract = isolated_in;
                group.isolated_out_extract = isolated_out;
                Ok(())
            }
            _ => Err(GraphError::invariant(format!(
                "{} has a metagraph but no group render info",
                name
            ))),
        }
    }

    /// Nearest ancestor of `name` (or the node itself) that is drawn,
    /// i.e. every namespace above it is expanded.
    pub fn get_nearest_visible_ancestor(&self, name: Ustr) -> Ustr {
        let path = hierarchical_path(name, None);
        let mut node_name = name;
        let mut i = 0;
        while i < path.len() {
            node_name = path[i];
            match self.index.get(&node_name) {
                Some(render) => {
                    if !render.info().expanded {
                        break;
                    }
                }
                None => break,
            }
            i += 1;
        }
        // An embedded node is drawn whenever its host is: answer with the
        // embedding itself rather than the host.
        if i + 2 == path.len() {
            let next = path[i + 1];
            if let Some(render) = self.index.get(&node_name) {
                let info = render.info();
                if info.in_annotations.contains(next) || info.out_annotations.contains(next) {
                    return next;
                }
            }
        }
        node_name
    }

    /// Whether `name` was moved out of its parent's core graph into one
    /// of the isolated extract lists.
    pub fn is_node_auxiliary(&self, name: Ustr) -> bool {
        let parent = match self.hierarchy.node(name).and_then(|n| n.parent()) {
            Some(parent) => parent,
            None => return false,
        };
        match self.index.get(&parent).and_then(|n| n.as_group()) {
            Some(group) => {
                group.isolated_in_extract.contains(&name)
                    || group.isolated_out_extract.contains(&name)
            }
            None => false,
        }
    }

    fn add_annotation(&mut self, host: Ustr, is_in: bool, annotation: Annotation) {
        let max_annotations = self.params.max_annotations;
        if let Some(node) = self.index.get_mut(&host) {
            let info = node.info_mut();
            let list = if is_in {
                &mut info.in_annotations
            } else {
                &mut info.out_annotations
            };
            list.push(max_annotations, annotation);
        }
    }

    fn include_of(&self, name: Ustr) -> InclusionType {
        self.hierarchy
            .node(name)
            .map(|n| n.include())
            .unwrap_or(InclusionType::Unspecified)
    }

    /// Replace the core edge (v, w) with a pair of shortcut annotations,
    /// unless an endpoint is pinned into the core graph and neither is
    /// excluded, in which case the real edge stays.
    fn create_shortcut(&mut self, core: &mut CoreGraph, v: Ustr, w: Ustr) {
        let edge = match core.edge_weight(v, w) {
            Some(edge) => edge.clone(),
            // Already removed by an earlier shortcut pass.
            None => return,
        };
        let src = self.include_of(v);
        let sink = self.include_of(w);
        if (src == InclusionType::Include || sink == InclusionType::Include)
            && src != InclusionType::Exclude
            && sink != InclusionType::Exclude
        {
            return;
        }

        self.add_annotation(v, false, Annotation::shortcut(w, false, edge.metaedge.clone()));
        self.add_annotation(w, true, Annotation::shortcut(v, true, edge.metaedge));
        core.remove_edge(v, w);
    }

    fn degree(core: &CoreGraph, n: Ustr) -> usize {
        core.neighbors_directed(n, Direction::Incoming).count()
            + core.neighbors_directed(n, Direction::Outgoing).count()
    }

    /// Shortcut `n`'s in-edges (all edges when detaching fully); if that
    /// leaves it isolated, exclude it and move it to the out-extract.
    fn make_out_extract(
        &mut self,
        core: &mut CoreGraph,
        isolated_out: &mut Vec<Ustr>,
        n: Ustr,
        force_detach: bool,
    ) -> Result<()> {
        if let Some(node) = self.index.get_mut(&n) {
            node.info_mut().is_out_extract = true;
        }
        let preds: Vec<Ustr> = core.neighbors_directed(n, Direction::Incoming).collect();
        for p in preds {
            self.create_shortcut(core, p, n);
        }
        if self.params.detach_all_edges_for_high_degree || force_detach {
            let succs: Vec<Ustr> = core.neighbors_directed(n, Direction::Outgoing).collect();
            for s in succs {
                self.create_shortcut(core, n, s);
            }
        }
        if Self::degree(core, n) == 0 {
            self.hierarchy.set_include(n, InclusionType::Exclude)?;
            isolated_out.push(n);
            core.remove_node(n);
        }
        Ok(())
    }

    /// Mirror image of [`Self::make_out_extract`].
    fn make_in_extract(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        n: Ustr,
        force_detach: bool,
    ) -> Result<()> {
        if let Some(node) = self.index.get_mut(&n) {
            node.info_mut().is_in_extract = true;
        }
        let succs: Vec<Ustr> = core.neighbors_directed(n, Direction::Outgoing).collect();
        for s in succs {
            self.create_shortcut(core, n, s);
        }
        if self.params.detach_all_edges_for_high_degree || force_detach {
            let preds: Vec<Ustr> = core.neighbors_directed(n, Direction::Incoming).collect();
            for p in preds {
                self.create_shortcut(core, p, n);
            }
        }
        if Self::degree(core, n) == 0 {
            self.hierarchy.set_include(n, InclusionType::Exclude)?;
            isolated_in.push(n);
            core.remove_node(n);
        }
        Ok(())
    }

    /// Op-type check used by the predefined extract lists: op nodes match
    /// on their own op; metanodes match on their root op (`x/(x)`).
    fn has_op_in(&self, name: Ustr, types: &[String]) -> bool {
        match self.hierarchy.node(name) {
            Some(HierNode::Op(op)) => types.iter().any(|t| op.op.as_str() == t),
            Some(HierNode::Group(group)) if matches!(group.kind, GroupKind::Meta) => {
                let root_op = ustr(&strict_name(name.as_str()));
                if !group.metagraph.contains_node(root_op) {
                    return false;
                }
                match self.hierarchy.node(root_op) {
                    Some(HierNode::Op(op)) => types.iter().any(|t| op.op.as_str() == t),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Pass 1: move user- or producer-excluded nodes out of the core
    /// graph, to whichever side carries more of their edges.
    fn extract_specified(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        isolated_out: &mut Vec<Ustr>,
    ) -> Result<()> {
        let mut nodes: Vec<Ustr> = core.nodes().collect();
        nodes.sort();
        for n in nodes {
            if !core.contains_node(n) {
                continue;
            }
            if self.include_of(n) != InclusionType::Exclude {
                continue;
            }
            let out_edges = core.neighbors_directed(n, Direction::Outgoing).count();
            let in_edges = core.neighbors_directed(n, Direction::Incoming).count();
            if out_edges > in_edges {
                self.make_out_extract(core, isolated_out, n, true)?;
            } else {
                self.make_in_extract(core, isolated_in, n, true)?;
            }
        }
        Ok(())
    }

    /// Pass 2/3: predefined sink-like and source-like op types.
    fn extract_predefined(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        isolated_out: &mut Vec<Ustr>,
        sinks: bool,
    ) -> Result<()> {
        let types = if sinks {
            self.params.out_extract_types.clone()
        } else {
            self.params.in_extract_types.clone()
        };
        let mut nodes: Vec<Ustr> = core.nodes().collect();
        nodes.sort();
        for n in nodes {
            if !core.contains_node(n) {
                continue;
            }
            if self.include_of(n) != InclusionType::Unspecified {
                continue;
            }
            if !self.has_op_in(n, &types) {
                continue;
            }
            if sinks {
                self.make_out_extract(core, isolated_out, n, false)?;
            } else {
                self.make_in_extract(core, isolated_in, n, false)?;
            }
        }
        Ok(())
    }

    /// Pass 4: quartile-based extraction of statistically high-degree
    /// nodes.  In-degree extracts above `Q3 + (Q3 - Q1)`; out-degree is
    /// more lenient at `Q3 + 4 * (Q3 - Q1)` because sources fan out.
    fn extract_high_in_or_out_degree(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        isolated_out: &mut Vec<Ustr>,
    ) -> Result<()> {
        // Degrees count regular edges only, unless a node is purely
        // control-connected, in which case its raw neighbor count stands
        // in.  That keeps control edges from triggering extraction except
        // for control-only nodes.
        let mut in_degree: HashMap<Ustr, usize> = HashMap::new();
        let mut out_degree: HashMap<Ustr, usize> = HashMap::new();
        for n in core.nodes() {
            if self.include_of(n) != InclusionType::Unspecified {
                continue;
            }
            let preds: Vec<Ustr> = core.neighbors_directed(n, Direction::Incoming).collect();
            let mut regular_in = preds
                .iter()
                .filter(|p| {
                    core.edge_weight(**p, n)
                        .and_then(|e| e.metaedge.as_ref())
                        .map_or(false, |m| m.num_regular > 0)
                })
                .count();
            if regular_in == 0 && !preds.is_empty() {
                regular_in = preds.len();
            }

            let succs: Vec<Ustr> = core.neighbors_directed(n, Direction::Outgoing).collect();
            let mut regular_out = succs
                .iter()
                .filter(|s| {
                    core.edge_weight(n, **s)
                        .and_then(|e| e.metaedge.as_ref())
                        .map_or(false, |m| m.num_regular > 0)
                })
                .count();
            if regular_out == 0 && !succs.is_empty() {
                regular_out = succs.len();
            }

            in_degree.insert(n, regular_in);
            out_degree.insert(n, regular_out);
        }

        let valid_count = in_degree.len();
        if valid_count < self.params.min_node_count_for_extraction {
            return Ok(());
        }

        let min_upper_bound = self.params.min_degree_for_extraction.saturating_sub(1);
        let q3_index = ((valid_count as f64 * 0.75).round() as usize).min(valid_count - 1);
        let q1_index = ((valid_count as f64 * 0.25).round() as usize).min(valid_count - 1);

        let mut sorted_by_in: Vec<Ustr> = in_degree.keys().copied().collect();
        sorted_by_in.sort_by_key(|n| (in_degree[n], *n));
        let in_q3 = in_degree[&sorted_by_in[q3_index]];
        let in_q1 = in_degree[&sorted_by_in[q1_index]];
        let in_bound = (in_q3 + (in_q3 - in_q1)).max(min_upper_bound);
        for i in (0..valid_count).rev() {
            let n = sorted_by_in[i];
            if in_degree[&n] <= in_bound {
                break;
            }
            self.make_in_extract(core, isolated_in, n, false)?;
        }

        let mut sorted_by_out: Vec<Ustr> = out_degree.keys().copied().collect();
        sorted_by_out.sort_by_key(|n| (out_degree[n], *n));
        let out_q3 = out_degree[&sorted_by_out[q3_index]];
        let out_q1 = out_degree[&sorted_by_out[q1_index]];
        let out_bound = (out_q3 + (out_q3 - out_q1) * 4).max(min_upper_bound);
        for i in (0..valid_count).rev() {
            let n = sorted_by_out[i];
            if out_degree[&n] <= out_bound {
                break;
            }
            // Skip nodes the in-degree pass already pulled out.
            let already_in_extract = self
                .index
                .get(&n)
                .map_or(false, |node| node.info().is_in_extract);
            if !core.contains_node(n) || already_in_extract {
                continue;
            }
            self.make_out_extract(core, isolated_out, n, false)?;
        }
        Ok(())
    }

    /// Pass 5: nodes with too many control-only edges have all of them
    /// turned into annotations.
    fn remove_control_edges(&mut self, core: &mut CoreGraph) -> Result<()> {
        let mut by_node: BTreeMap<Ustr, Vec<(Ustr, Ustr)>> = BTreeMap::new();
        for (v, w, edge) in core.all_edges() {
            let is_control = edge
                .metaedge
                .as_ref()
                .map_or(false, |m| m.num_regular == 0);
            if is_control {
                by_node.entry(v).or_default().push((v, w));
                by_node.entry(w).or_default().push((v, w));
            }
        }
        for (_node, edges) in by_node {
            if edges.len() > self.params.max_control_degree {
                for (v, w) in edges {
                    self.create_shortcut(core, v, w);
                }
            }
        }
        Ok(())
    }

    /// Final sweep: nodes the earlier passes left isolated move to the
    /// extract list matching their annotation side.  A node annotated on
    /// both sides stays in the core graph; there is no clear side for it.
    fn extract_isolated(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        isolated_out: &mut Vec<Ustr>,
    ) -> Result<()> {
        let mut nodes: Vec<Ustr> = core.nodes().collect();
        nodes.sort();
        for n in nodes {
            if !core.contains_node(n) {
                continue;
            }
            if self.include_of(n) != InclusionType::Unspecified {
                continue;
            }
            if Self::degree(core, n) != 0 {
                continue;
            }
            let (is_in_extract, is_out_extract, has_in, has_out) = match self.index.get(&n) {
                Some(node) => {
                    let info = node.info();
                    (
                        info.is_in_extract,
                        info.is_out_extract,
                        !info.in_annotations.is_empty(),
                        !info.out_annotations.is_empty(),
                    )
                }
                None => continue,
            };
            if is_in_extract {
                isolated_in.push(n);
                self.hierarchy.set_include(n, InclusionType::Exclude)?;
                core.remove_node(n);
            } else if is_out_extract {
                isolated_out.push(n);
                self.hierarchy.set_include(n, InclusionType::Exclude)?;
                core.remove_node(n);
            } else if self
                .params
                .extract_isolated_nodes_with_annotations_on_one_side
            {
                if has_out && !has_in {
                    if let Some(node) = self.index.get_mut(&n) {
                        node.info_mut().is_in_extract = true;
                    }
                    isolated_in.push(n);
                    self.hierarchy.set_include(n, InclusionType::Exclude)?;
                    core.remove_node(n);
                } else if has_in && !has_out {
                    if let Some(node) = self.index.get_mut(&n) {
                        node.info_mut().is_out_extract = true;
                    }
                    isolated_out.push(n);
                    self.hierarchy.set_include(n, InclusionType::Exclude)?;
                    core.remove_node(n);
                }
            }
        }
        Ok(())
    }

    fn extract_high_degrees(
        &mut self,
        core: &mut CoreGraph,
        isolated_in: &mut Vec<Ustr>,
        isolated_out: &mut Vec<Ustr>,
    ) -> Result<()> {
        self.extract_specified(core, isolated_in, isolated_out)?;
        if !self.params.out_extract_types.is_empty() {
            self.extract_predefined(core, isolated_in, isolated_out, true)?;
        }
        // Sources must go before high in-degree extraction to protect a
        // core that legitimately consumes many of them.
        if !self.params.in_extract_types.is_empty() {
            self.extract_predefined(core, isolated_in, isolated_out, false)?;
        }
        self.extract_high_in_or_out_degree(core, isolated_in, isolated_out)?;
        if self.params.max_control_degree > 0 {
            self.remove_control_edges(core)?;
        }
        self.extract_isolated(core, isolated_in, isolated_out)
    }

    fn annotations_to_json(list: &AnnotationList) -> Value {
        Value::Array(
            list.list
                .iter()
                .map(|a| {
                    json!({
                        "node": a.node_name.as_str(),
                        "kind": a.kind.as_str(),
                        "more": a.num_more_nodes,
                    })
                })
                .collect(),
        )
    }

    /// JSON for one built group, with nodes and edges in sorted order so
    /// output is diffable.
    pub fn group_to_json(&self, name: Ustr) -> Result<Value> {
        let group = self
            .index
            .get(&name)
            .and_then(|n| n.as_group())
            .ok_or_else(|| GraphError::not_found(format!("no render group named {}", name)))?;

        let mut nodes: BTreeMap<String, Value> = BTreeMap::new();
        for n in group.core_graph.nodes() {
            let kind = match self.hierarchy.node(n) {
                Some(HierNode::Group(g)) if g.is_series() => "series",
                Some(HierNode::Group(_)) => "meta",
                _ => "op",
            };
            let info = match self.index.get(&n) {
                Some(render) => render.info(),
                None => continue,
            };
            nodes.insert(
                n.to_string(),
                json!({
                    "kind": kind,
                    "expanded": info.expanded,
                    "inAnnotations": Self::annotations_to_json(&info.in_annotations),
                    "outAnnotations": Self::annotations_to_json(&info.out_annotations),
                }),
            );
        }

        let mut edges: Vec<(String, String, Value)> = group
            .core_graph
            .all_edges()
            .map(|(v, w, edge)| {
                let (regular, control, reference, size) = match &edge.metaedge {
                    Some(m) => (m.num_regular, m.num_control, m.num_ref, m.total_size),
                    None => (0, 0, 0, 0),
                };
                (
                    v.to_string(),
                    w.to_string(),
                    json!({
                        "v": v.as_str(),
                        "w": w.as_str(),
                        "regular": regular,
                        "control": control,
                        "reference": reference,
                        "size": size,
                    }),
                )
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        Ok(json!({
            "nodes": nodes,
            "edges": edges.into_iter().map(|(_, _, e)| e).collect::<Vec<_>>(),
            "isolatedInExtract": group
                .isolated_in_extract
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>(),
            "isolatedOutExtract": group
                .isolated_out_extract
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>(),
        }))
    }

    /// JSON for every group built so far, keyed and sorted by name.
    pub fn to_json(&self) -> Result<Value> {
        let mut groups: BTreeMap<String, Value> = BTreeMap::new();
        let mut built: Vec<Ustr> = self.has_subhierarchy.iter().copied().collect();
        built.sort();
        for name in built {
            if self.index.get(&name).and_then(|n| n.as_group()).is_some() {
                groups.insert(name.to_string(), self.group_to_json(name)?);
            }
        }
        Ok(json!({
            "root": self.root_name.as_str(),
            "maxMetaEdgeSize": self.hierarchy.max_meta_edge_size,
            "groups": groups,
        }))
    }
}
