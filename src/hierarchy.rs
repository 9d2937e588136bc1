//! The hierarchical graph: a rooted tree of group nodes built from
//! `/`-delimited leaf names, with per-group "metagraphs" holding the
//! aggregated edges between siblings.
//!
//! Building runs three strictly sequential phases over a [`SlimGraph`]:
//! add-nodes (namespace tree plus bottom-up histograms), detect-series
//! (collapse runs of numbered siblings, see [`crate::series`]), and
//! add-edges (fold every base edge into a metaedge at the lowest common
//! ancestor of its endpoints).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::graphmap::DiGraphMap;
use tracing::trace;
use ustr::{ustr, Ustr};

use crate::errors::{GraphError, Result};
use crate::graph::{
    hierarchical_path, BaseEdge, InclusionType, OpNode, SeriesGrouping, SeriesNames, SlimGraph,
    ROOT_NAME,
};
use crate::progress::{run_phase, ProgressTracker};
use crate::series::{detect_series, DetectedSeries};
use crate::template;

/// Aggregated edges between the children of one group, keyed by the
/// ordered endpoint pair.  At most one metaedge exists per (v, w).
pub type MetaGraph = DiGraphMap<Ustr, Metaedge>;

/// An aggregated edge between two children of the same group.
#[derive(Debug, Clone)]
pub struct Metaedge {
    pub v: Ustr,
    pub w: Ustr,
    pub base_edges: Vec<BaseEdge>,
    /// For bridgegraph edges, whether the edge points into the group.
    pub inbound: Option<bool>,
    pub num_regular: u64,
    pub num_control: u64,
    pub num_ref: u64,
    /// Grows with every folded base edge; used for relative thickness
    /// scaling only.
    pub total_size: u64,
}

impl Metaedge {
    pub fn new(v: Ustr, w: Ustr) -> Metaedge {
        Metaedge {
            v,
            w,
            base_edges: Vec::new(),
            inbound: None,
            num_regular: 0,
            num_control: 0,
            num_ref: 0,
            total_size: 0,
        }
    }

    /// Fold one base edge into this aggregate and return the new total
    /// size so the caller can keep the hierarchy-wide maximum current.
    pub fn add_base_edge(&mut self, edge: BaseEdge) -> u64 {
        if edge.is_control {
            self.num_control += 1;
        } else {
            self.num_regular += 1;
        }
        if edge.is_reference {
            self.num_ref += 1;
        }
        self.base_edges.push(edge);
        self.total_size += 1;
        self.total_size
    }
}

/// Detected-series metadata kept on a series group node.
#[derive(Debug, Clone)]
pub struct SeriesInfo {
    pub prefix: String,
    pub suffix: String,
    /// Namespace the members live in, empty at the root.
    pub parent_path: String,
    pub op: Ustr,
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub enum GroupKind {
    Meta,
    Series(SeriesInfo),
}

/// A group node: a namespace metanode or a series node.  Children live in
/// `metagraph`; `bridgegraph` lazily holds edges from children to nodes
/// outside the group.
#[derive(Debug)]
pub struct GroupNode {
    pub name: Ustr,
    pub kind: GroupKind,
    /// Height of the subtree rooted here, in name segments.
    pub depth: usize,
    pub cardinality: u64,
    pub op_histogram: BTreeMap<Ustr, u64>,
    pub device_histogram: BTreeMap<Ustr, u64>,
    pub metagraph: MetaGraph,
    pub bridgegraph: Option<MetaGraph>,
    pub has_non_control_edges: bool,
    pub include: InclusionType,
    pub parent: Option<Ustr>,
}

impl GroupNode {
    fn new(name: Ustr, kind: GroupKind) -> GroupNode {
        GroupNode {
            name,
            kind,
            depth: 1,
            cardinality: 0,
            op_histogram: BTreeMap::new(),
            device_histogram: BTreeMap::new(),
            metagraph: MetaGraph::new(),
            bridgegraph: None,
            has_non_control_edges: false,
            include: InclusionType::Unspecified,
            parent: None,
        }
    }

    pub fn is_series(&self) -> bool {
        matches!(self.kind, GroupKind::Series(_))
    }
}

/// Any node in the hierarchy index: an op leaf or a group.
#[derive(Debug)]
pub enum HierNode {
    Op(OpNode),
    Group(GroupNode),
}

impl HierNode {
    pub fn name(&self) -> Ustr {
        match self {
            HierNode::Op(n) => n.name,
            HierNode::Group(g) => g.name,
        }
    }

    pub fn parent(&self) -> Option<Ustr> {
        match self {
            HierNode::Op(n) => n.parent,
            HierNode::Group(g) => g.parent,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, HierNode::Group(_))
    }

    pub fn cardinality(&self) -> u64 {
        match self {
            HierNode::Op(n) => n.cardinality,
            HierNode::Group(g) => g.cardinality,
        }
    }

    pub fn include(&self) -> InclusionType {
        match self {
            HierNode::Op(n) => n.include,
            HierNode::Group(g) => g.include,
        }
    }

    pub fn set_include(&mut self, include: InclusionType) {
        match self {
            HierNode::Op(n) => n.include = include,
            HierNode::Group(g) => g.include = include,
        }
    }

    pub fn as_op(&self) -> Option<&OpNode> {
        match self {
            HierNode::Op(n) => Some(n),
            HierNode::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupNode> {
        match self {
            HierNode::Group(g) => Some(g),
            HierNode::Op(_) => None,
        }
    }
}

/// Incident metaedges of one node, split by whether the aggregate carries
/// any non-control base edge.
#[derive(Debug, Default)]
pub struct Edges {
    pub regular: Vec<Metaedge>,
    pub control: Vec<Metaedge>,
}

#[derive(Debug, Clone)]
struct SeriesRecord {
    parent: Ustr,
    info: DetectedSeries,
}

/// Knobs for [`build`].
#[derive(Debug, Clone)]
pub struct HierarchyParams {
    /// Detected runs shorter than this default to ungrouped.
    pub series_node_min_size: usize,
    /// Explicit per-series overrides of the grouping decision.
    pub series_map: HashMap<Ustr, SeriesGrouping>,
    /// Match numbers anywhere in leaf names instead of only a trailing
    /// `_<n>` suffix.
    pub use_generalized_series_patterns: bool,
}

impl Default for HierarchyParams {
    fn default() -> Self {
        HierarchyParams {
            series_node_min_size: 5,
            series_map: HashMap::new(),
            use_generalized_series_patterns: false,
        }
    }
}

/// The whole tree plus the name-keyed node index.  Parent/child links are
/// names into the index, never references.
#[derive(Debug)]
pub struct Hierarchy {
    index: HashMap<Ustr, HierNode>,
    root_name: Ustr,
    /// Every distinct device seen on a leaf, sorted.
    pub devices: Vec<Ustr>,
    /// Maximum metaedge `total_size` observed, for thickness scaling.
    pub max_meta_edge_size: u64,
    /// Leaf name -> name of the series group that adopted it.
    series_names: SeriesNames,
    /// Grouping decisions per series name, defaults plus user overrides.
    series_groupings: HashMap<Ustr, SeriesGrouping>,
    /// Every series the detector found, grouped or not, so grouping can
    /// be toggled later without re-running detection.
    detected_series: HashMap<Ustr, SeriesRecord>,
    /// Cached topological orderings, invalidated on series regrouping.
    orderings: HashMap<Ustr, HashMap<Ustr, usize>>,
    templates: Option<HashMap<Ustr, usize>>,
}

impl Hierarchy {
    fn new() -> Hierarchy {
        let root_name = ustr(ROOT_NAME);
        let mut index = HashMap::new();
        index.insert(root_name, HierNode::Group(GroupNode::new(root_name, GroupKind::Meta)));
        Hierarchy {
            index,
            root_name,
            devices: Vec::new(),
            max_meta_edge_size: 1,
            series_names: SeriesNames::new(),
            series_groupings: HashMap::new(),
            detected_series: HashMap::new(),
            orderings: HashMap::new(),
            templates: None,
        }
    }

    pub fn root_name(&self) -> Ustr {
        self.root_name
    }

    pub fn node(&self, name: Ustr) -> Option<&HierNode> {
        self.index.get(&name)
    }

    /// Insert or replace a node in the index under `name`.
    pub fn set_node(&mut self, name: Ustr, node: HierNode) {
        self.index.insert(name, node);
    }

    pub fn node_names(&self) -> impl Iterator<Item = Ustr> + '_ {
        self.index.keys().copied()
    }

    pub fn series_names(&self) -> &SeriesNames {
        &self.series_names
    }

    pub fn set_include(&mut self, name: Ustr, include: InclusionType) -> Result<()> {
        let node = self
            .index
            .get_mut(&name)
            .ok_or_else(|| GraphError::not_found(format!("no node named {}", name)))?;
        node.set_include(include);
        Ok(())
    }

    pub fn group(&self, name: Ustr) -> Result<&GroupNode> {
        match self.index.get(&name) {
            Some(HierNode::Group(g)) => Ok(g),
            Some(HierNode::Op(_)) => Err(GraphError::not_found(format!(
                "{} is an op node, not a group",
                name
            ))),
            None => Err(GraphError::not_found(format!("no node named {}", name))),
        }
    }

    fn group_mut(&mut self, name: Ustr) -> Result<&mut GroupNode> {
        match self.index.get_mut(&name) {
            Some(HierNode::Group(g)) => Ok(g),
            Some(HierNode::Op(_)) => Err(GraphError::not_found(format!(
                "{} is an op node, not a group",
                name
            ))),
            None => Err(GraphError::not_found(format!("no node named {}", name))),
        }
    }

    /// Name of the immediate child of `group_name` on the path down to
    /// `descendant`.
    pub fn child_name(&self, group_name: Ustr, descendant: Ustr) -> Result<Ustr> {
        let mut current = descendant;
        loop {
            match self.index.get(&current) {
                Some(node) => match node.parent() {
                    Some(parent) if parent == group_name => return Ok(current),
                    Some(parent) => current = parent,
                    None => break,
                },
                None => break,
            }
        }
        Err(GraphError::invariant(format!(
            "could not find immediate child of {} for descendant {}",
            group_name, descendant
        )))
    }

    /// All op-node names under the root, ascending.
    pub fn leaves(&self) -> Vec<Ustr> {
        let mut out = Vec::new();
        let mut stack = vec![self.root_name];
        while let Some(name) = stack.pop() {
            if let Some(HierNode::Group(group)) = self.index.get(&name) {
                for child in group.metagraph.nodes() {
                    match self.index.get(&child) {
                        Some(HierNode::Group(_)) => stack.push(child),
                        Some(HierNode::Op(_)) => out.push(child),
                        None => {}
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Incoming metaedges of `name` within its parent's metagraph, plus a
    /// synthesized metaedge per in-embedding.
    pub fn get_predecessors(&self, name: Ustr) -> Result<Edges> {
        let node = self
            .index
            .get(&name)
            .ok_or_else(|| GraphError::not_found(format!("no node named {}", name)))?;
        let mut edges = self.one_way_edges(node, true);
        if let HierNode::Op(op) = node {
            for embedded in &op.in_embeddings {
                for input in &op.inputs {
                    if input.name == embedded.name {
                        let mut metaedge = Metaedge::new(embedded.name, name);
                        metaedge.add_base_edge(BaseEdge {
                            v: embedded.name,
                            w: name,
                            output_key: input.output_key.clone(),
                            is_control: input.is_control,
                            is_reference: false,
                        });
                        edges.regular.push(metaedge);
                    }
                }
            }
        }
        Ok(edges)
    }

    /// Outgoing metaedges of `name` within its parent's metagraph, plus a
    /// synthesized metaedge per out-embedding.
    pub fn get_successors(&self, name: Ustr) -> Result<Edges> {
        let node = self
            .index
            .get(&name)
            .ok_or_else(|| GraphError::not_found(format!("no node named {}", name)))?;
        let mut edges = self.one_way_edges(node, false);
        if let HierNode::Op(op) = node {
            for embedded in &op.out_embeddings {
                for input in &embedded.inputs {
                    if input.name == name {
                        let mut metaedge = Metaedge::new(name, embedded.name);
                        metaedge.add_base_edge(BaseEdge {
                            v: name,
                            w: embedded.name,
                            output_key: input.output_key.clone(),
                            is_control: input.is_control,
                            is_reference: false,
                        });
                        edges.regular.push(metaedge);
                    }
                }
            }
        }
        Ok(edges)
    }

    fn one_way_edges(&self, node: &HierNode, inbound: bool) -> Edges {
        let mut edges = Edges::default();
        let parent = match node.parent().and_then(|p| self.index.get(&p)) {
            Some(HierNode::Group(g)) => g,
            _ => return edges,
        };
        let name = node.name();
        for (v, w, metaedge) in parent.metagraph.all_edges() {
            let incident = if inbound { w == name } else { v == name };
            if !incident {
                continue;
            }
            if metaedge.num_regular > 0 {
                edges.regular.push(metaedge.clone());
            } else {
                edges.control.push(metaedge.clone());
            }
        }
        edges
    }

    /// BFS partial order over a group's children, ignoring control-only
    /// metaedges: if a non-control path runs from X to Y then X's number
    /// is lower.  Not necessarily a dense 0..N-1 range.  Cached; the
    /// cache entry is dropped when series grouping mutates the group.
    pub fn get_topological_ordering(
        &mut self,
        name: Ustr,
    ) -> Result<Option<&HashMap<Ustr, usize>>> {
        let group = match self.index.get(&name) {
            None => {
                return Err(GraphError::not_found(format!("no node named {}", name)));
            }
            Some(HierNode::Op(_)) => return Ok(None),
            Some(HierNode::Group(g)) => g,
        };
        if !self.orderings.contains_key(&name) {
            let mut successors: HashMap<Ustr, Vec<Ustr>> = HashMap::new();
            let mut destinations: HashSet<Ustr> = HashSet::new();
            for (v, w, metaedge) in group.metagraph.all_edges() {
                if metaedge.num_regular == 0 {
                    continue;
                }
                successors.entry(v).or_default().push(w);
                destinations.insert(w);
            }

            // Seed with true sources, sorted for a stable ordering.
            let mut sources: Vec<Ustr> = successors
                .keys()
                .filter(|n| !destinations.contains(n))
                .copied()
                .collect();
            sources.sort();
            let mut queue: VecDeque<Ustr> = sources.into();

            let mut ordering = HashMap::new();
            let mut next = 0usize;
            while let Some(child) = queue.pop_front() {
                // A node reached again through a longer path takes a
                // fresh, higher number, so every regular path stays
                // monotonically ordered.
                ordering.insert(child, next);
                next += 1;
                // Removing the entry keeps cycles from looping forever.
                if let Some(succs) = successors.remove(&child) {
                    queue.extend(succs);
                }
            }
            self.orderings.insert(name, ordering);
        }
        Ok(self.orderings.get(&name))
    }

    /// Edges connecting `name`'s children to nodes outside the group,
    /// projected down lazily from the parent's metagraph and bridgegraph.
    /// `Ok(None)` for op nodes.
    pub fn get_bridgegraph(&mut self, name: Ustr) -> Result<Option<&MetaGraph>> {
        let parent_of_group = match self.index.get(&name) {
            None => {
                return Err(GraphError::not_found(format!("no node named {}", name)));
            }
            Some(HierNode::Op(_)) => return Ok(None),
            Some(HierNode::Group(g)) => {
                if g.bridgegraph.is_some() {
                    None
                } else {
                    Some(g.parent)
                }
            }
        };

        if let Some(parent_opt) = parent_of_group {
            let mut bridge = MetaGraph::new();
            if let Some(parent) = parent_opt {
                // The parent's own bridgegraph feeds the projection.
                self.get_bridgegraph(parent)?;

                let mut staged: Vec<(Ustr, Ustr, bool, BaseEdge)> = Vec::new();
                {
                    let parent_group = self.group(parent)?;
                    let mut relevant: Vec<&Metaedge> = Vec::new();
                    for (v, w, metaedge) in parent_group.metagraph.all_edges() {
                        if v == name || w == name {
                            relevant.push(metaedge);
                        }
                    }
                    if let Some(parent_bridge) = &parent_group.bridgegraph {
                        for (v, w, metaedge) in parent_bridge.all_edges() {
                            if v == name || w == name {
                                relevant.push(metaedge);
                            }
                        }
                    }
                    for metaedge in relevant {
                        let is_inbound = metaedge.w == name;
                        let other = if is_inbound { metaedge.v } else { metaedge.w };
                        for base in &metaedge.base_edges {
                            let inner = if is_inbound { base.w } else { base.v };
                            let child = self.child_name(name, inner)?;
                            let (v, w) = if is_inbound { (other, child) } else { (child, other) };
                            staged.push((v, w, is_inbound, base.clone()));
                        }
                    }
                }

                let mut max_size = self.max_meta_edge_size;
                for (v, w, is_inbound, base) in staged {
                    if !bridge.contains_edge(v, w) {
                        let mut metaedge = Metaedge::new(v, w);
                        metaedge.inbound = Some(is_inbound);
                        bridge.add_edge(v, w, metaedge);
                    }
                    let metaedge = bridge.edge_weight_mut(v, w).ok_or_else(|| {
                        GraphError::invariant("bridgegraph edge vanished after insertion")
                    })?;
                    let total = metaedge.add_base_edge(base);
                    max_size = max_size.max(total);
                }
                self.max_meta_edge_size = max_size;
            }
            self.group_mut(name)?.bridgegraph = Some(bridge);
        }

        match self.index.get(&name) {
            Some(HierNode::Group(g)) => Ok(g.bridgegraph.as_ref()),
            _ => Err(GraphError::invariant(format!(
                "{} changed kind while computing its bridgegraph",
                name
            ))),
        }
    }

    /// Stable small-integer id per distinct structural template of group
    /// nodes, for palette assignment.
    pub fn get_template_index(&mut self) -> &HashMap<Ustr, usize> {
        if self.templates.is_none() {
            self.templates = Some(template::assign_templates(self));
        }
        // Populated just above.
        self.templates.get_or_insert_with(HashMap::new)
    }

    /// Flip one detected series between grouped and ungrouped form.  Only
    /// the owning parent's metagraph is restructured: its incident
    /// metaedges are unfolded back to base edges and refolded through the
    /// new parent chains.
    pub fn set_series_grouping(
        &mut self,
        series_name: Ustr,
        grouping: SeriesGrouping,
    ) -> Result<()> {
        let record = self
            .detected_series
            .get(&series_name)
            .cloned()
            .ok_or_else(|| {
                GraphError::not_found(format!("no detected series named {}", series_name))
            })?;
        let currently_grouped =
            matches!(self.index.get(&series_name), Some(HierNode::Group(_)));
        self.series_groupings.insert(series_name, grouping);

        match (grouping, currently_grouped) {
            (SeriesGrouping::Group, false) => {
                let affected =
                    self.unfold_edges_touching(record.parent, &record.info.members)?;
                self.adopt_series(record.parent, &record.info)?;
                for edge in affected {
                    self.fold_base_edge(&edge)?;
                }
            }
            (SeriesGrouping::Ungroup, true) => {
                let mut affected = self.unfold_edges_touching(record.parent, &[series_name])?;
                {
                    let series = self.group_mut(series_name)?;
                    let inner: Vec<(Ustr, Ustr)> = series
                        .metagraph
                        .all_edges()
                        .map(|(v, w, _)| (v, w))
                        .collect();
                    for (v, w) in inner {
                        if let Some(metaedge) = series.metagraph.remove_edge(v, w) {
                            affected.extend(metaedge.base_edges);
                        }
                    }
                }
                for member in &record.info.members {
                    if let Some(node) = self.index.get_mut(member) {
                        if let HierNode::Op(op) = node {
                            op.parent = Some(record.parent);
                        }
                    }
                    self.series_names.remove(member);
                    self.group_mut(record.parent)?.metagraph.add_node(*member);
                }
                self.group_mut(record.parent)?
                    .metagraph
                    .remove_node(series_name);
                self.index.remove(&series_name);
                for edge in affected {
                    self.fold_base_edge(&edge)?;
                }
            }
            _ => return Ok(()),
        }

        self.orderings.remove(&record.parent);
        self.orderings.remove(&series_name);
        // Bridgegraphs project from parent metagraphs, so cached ones may
        // now be stale.
        for node in self.index.values_mut() {
            if let HierNode::Group(group) = node {
                group.bridgegraph = None;
            }
        }
        self.templates = None;
        Ok(())
    }

    /// Remove every metaedge in `parent`'s metagraph incident to one of
    /// `names` and hand back the base edges it aggregated.
    fn unfold_edges_touching(&mut self, parent: Ustr, names: &[Ustr]) -> Result<Vec<BaseEdge>> {
        let targets: HashSet<Ustr> = names.iter().copied().collect();
        let group = self.group_mut(parent)?;
        let incident: Vec<(Ustr, Ustr)> = group
            .metagraph
            .all_edges()
            .filter(|(v, w, _)| targets.contains(v) || targets.contains(w))
            .map(|(v, w, _)| (v, w))
            .collect();
        let mut out = Vec::new();
        for (v, w) in incident {
            if let Some(metaedge) = group.metagraph.remove_edge(v, w) {
                out.extend(metaedge.base_edges);
            }
        }
        Ok(out)
    }

    /// Create the series group node under `parent` and move the members
    /// into it.  The parent's histograms are intentionally left alone;
    /// the series carries its own counts summed from the members.
    fn adopt_series(&mut self, parent: Ustr, series: &DetectedSeries) -> Result<()> {
        let mut node = GroupNode::new(
            series.name,
            GroupKind::Series(SeriesInfo {
                prefix: series.prefix.clone(),
                suffix: series.suffix.clone(),
                parent_path: series.parent.clone(),
                op: series.op,
                ids: series.ids.clone(),
            }),
        );
        node.parent = Some(parent);
        for member in &series.members {
            node.metagraph.add_node(*member);
            let (cardinality, device) = match self.index.get(member) {
                Some(HierNode::Op(op)) => (op.cardinality, op.device),
                _ => {
                    return Err(GraphError::invariant(format!(
                        "series member {} is not an op node",
                        member
                    )))
                }
            };
            node.cardinality += cardinality;
            if let Some(device) = device {
                *node.device_histogram.entry(device).or_insert(0) += 1;
            }
        }
        self.index.insert(series.name, HierNode::Group(node));

        {
            let parent_group = self.group_mut(parent)?;
            parent_group.metagraph.add_node(series.name);
            for member in &series.members {
                parent_group.metagraph.remove_node(*member);
            }
        }
        for member in &series.members {
            if let Some(HierNode::Op(op)) = self.index.get_mut(member) {
                op.parent = Some(series.name);
            }
            self.series_names.insert(*member, series.name);
        }
        Ok(())
    }

    /// Leaf-to-root name chain via parent links.  False when the name is
    /// not in the index (the edge referencing it gets dropped).
    fn ancestor_path(&self, leaf: Ustr, path: &mut Vec<Ustr>) -> bool {
        path.clear();
        let mut current = leaf;
        loop {
            match self.index.get(&current) {
                Some(node) => {
                    path.push(current);
                    match node.parent() {
                        Some(parent) => current = parent,
                        None => return true,
                    }
                }
                None => return false,
            }
        }
    }

    /// Fold one base edge into the metaedge at the lowest common ancestor
    /// of its endpoints.  Returns false when an endpoint is unknown and
    /// the edge was dropped.
    fn fold_base_edge(&mut self, edge: &BaseEdge) -> Result<bool> {
        let mut source_path = Vec::new();
        let mut dest_path = Vec::new();
        if !self.ancestor_path(edge.v, &mut source_path)
            || !self.ancestor_path(edge.w, &mut dest_path)
        {
            trace!(v = %edge.v, w = %edge.w, "dropping edge with unknown endpoint");
            return Ok(false);
        }

        // Walk down from the root ends of both paths; the first place the
        // paths differ names the two children of the shared ancestor.
        let mut i = source_path.len() - 1;
        let mut j = dest_path.len() - 1;
        while source_path[i] == dest_path[j] {
            if i == 0 || j == 0 {
                return Err(GraphError::invariant(format!(
                    "no difference found between ancestor paths of {} and {}",
                    edge.v, edge.w
                )));
            }
            i -= 1;
            j -= 1;
        }
        let shared_ancestor = source_path[i + 1];
        let v = source_path[i];
        let w = dest_path[j];

        let group = self.group_mut(shared_ancestor)?;
        if !group.metagraph.contains_edge(v, w) {
            group.metagraph.add_edge(v, w, Metaedge::new(v, w));
        }
        let metaedge = group
            .metagraph
            .edge_weight_mut(v, w)
            .ok_or_else(|| GraphError::invariant("metaedge vanished after insertion"))?;
        let total = metaedge.add_base_edge(edge.clone());
        if !edge.is_control {
            group.has_non_control_edges = true;
        }
        if total > self.max_meta_edge_size {
            self.max_meta_edge_size = total;
        }
        Ok(true)
    }

    /// Phase 1: place every op node under its namespace chain, creating
    /// metanodes on demand and rolling histograms up every ancestor.
    fn add_nodes(&mut self, graph: &mut SlimGraph) -> Result<()> {
        let mut names: Vec<Ustr> = graph.nodes.keys().copied().collect();
        names.sort();

        let mut devices: HashSet<Ustr> = HashSet::new();
        for name in names {
            let mut node = match graph.nodes.remove(&name) {
                Some(node) => node,
                None => continue,
            };
            if let Some(device) = node.device {
                devices.insert(device);
            }

            let path = hierarchical_path(node.name, None);
            let mut parent_name = self.root_name;
            for i in 0..path.len() {
                {
                    let parent = self.group_mut(parent_name)?;
                    parent.depth = parent.depth.max(path.len() - i);
                    parent.cardinality += node.cardinality;
                    *parent.op_histogram.entry(node.op).or_insert(0) += 1;
                    if let Some(device) = node.device {
                        *parent.device_histogram.entry(device).or_insert(0) += 1;
                    }
                }
                if i == path.len() - 1 {
                    break;
                }
                let child_name = path[i];
                if !self.index.contains_key(&child_name) {
                    let mut child = GroupNode::new(child_name, GroupKind::Meta);
                    child.parent = Some(parent_name);
                    self.group_mut(parent_name)?.metagraph.add_node(child_name);
                    self.index.insert(child_name, HierNode::Group(child));
                }
                parent_name = child_name;
            }

            node.parent = Some(parent_name);
            self.group_mut(parent_name)?.metagraph.add_node(node.name);
            self.index.insert(node.name, HierNode::Op(node));
        }

        self.devices = devices.into_iter().collect();
        self.devices.sort();
        Ok(())
    }

    /// Phase 2: recurse into every group, detect series among its op
    /// children, and adopt those the policy says to group.
    fn group_series(&mut self, group_name: Ustr, params: &HierarchyParams) -> Result<()> {
        let children: Vec<Ustr> = self.group(group_name)?.metagraph.nodes().collect();
        for child in &children {
            if matches!(self.index.get(child), Some(HierNode::Group(_))) {
                self.group_series(*child, params)?;
            }
        }

        let op_children: Vec<(Ustr, Ustr)> = children
            .iter()
            .filter_map(|child| match self.index.get(child) {
                Some(HierNode::Op(op)) => Some((op.name, op.op)),
                _ => None,
            })
            .collect();
        let detected = detect_series(&op_children, params.use_generalized_series_patterns);

        for series in detected {
            for member in &series.members {
                if let Some(HierNode::Op(op)) = self.index.get_mut(member) {
                    if op.owning_series.is_none() {
                        op.owning_series = Some(series.name);
                    }
                }
            }
            // Short runs default to ungrouped unless explicitly forced.
            if series.members.len() < params.series_node_min_size
                && !self.series_groupings.contains_key(&series.name)
            {
                self.series_groupings
                    .insert(series.name, SeriesGrouping::Ungroup);
            }
            let grouped = !matches!(
                self.series_groupings.get(&series.name),
                Some(SeriesGrouping::Ungroup)
            );
            self.detected_series.insert(
                series.name,
                SeriesRecord {
                    parent: group_name,
                    info: series.clone(),
                },
            );
            if grouped {
                self.adopt_series(group_name, &series)?;
            }
        }
        Ok(())
    }
}

/// Build a [`Hierarchy`] from a flat graph.  Three sequential phases:
/// adding nodes (20%), detecting series (20%), adding edges (60%).
pub fn build(
    mut graph: SlimGraph,
    params: &HierarchyParams,
    tracker: &dyn ProgressTracker,
) -> Result<Hierarchy> {
    let mut hierarchy = Hierarchy::new();
    hierarchy.series_groupings = params.series_map.clone();

    run_phase(tracker, "Adding nodes", 20.0, || {
        hierarchy.add_nodes(&mut graph)
    })?;

    run_phase(tracker, "Detect series", 20.0, || {
        if params.series_node_min_size > 0 {
            let root = hierarchy.root_name;
            hierarchy.group_series(root, params)?;
        }
        Ok(())
    })?;

    run_phase(tracker, "Adding edges", 60.0, || {
        for edge in &graph.edges {
            hierarchy.fold_base_edge(edge)?;
        }
        Ok(())
    })?;

    Ok(hierarchy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildParams, NodeAttributes, RawNode};
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

    fn build_hierarchy(raw_nodes: Vec<RawNode>, params: &HierarchyParams) -> Hierarchy {
        let graph =
            crate::graph::build(raw_nodes, &BuildParams::default(), &LogTracker).unwrap();
        build(graph, params, &LogTracker).unwrap()
    }

    fn leaf_names(h: &Hierarchy) -> Vec<String> {
        h.leaves().iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn namespaces_become_group_nodes_with_rolled_up_histograms() {
        let h = build_hierarchy(
            vec![raw("a/b/c", &[]), raw("a/b/d", &[]), raw("a/e", &[])],
            &HierarchyParams::default(),
        );
        let root = h.group(h.root_name()).unwrap();
        assert_eq!(root.cardinality, 3);
        assert_eq!(root.depth, 3);
        assert_eq!(root.op_histogram[&ustr("OP")], 3);

        let a = h.group(ustr("a")).unwrap();
        assert_eq!(a.cardinality, 3);
        assert_eq!(a.depth, 2);
        assert_eq!(a.parent, Some(h.root_name()));

        let ab = h.group(ustr("a/b")).unwrap();
        assert_eq!(ab.cardinality, 2);
        assert_eq!(ab.depth, 1);
        assert!(ab.metagraph.contains_node(ustr("a/b/c")));
    }

    #[test]
    fn leaves_round_trip_the_op_node_set() {
        let h = build_hierarchy(
            vec![raw("a", &[]), raw("a/b", &[]), raw("c/d", &[])],
            &HierarchyParams::default(),
        );
        // `a` collided with namespace `a` and was renamed on the way in.
        assert_eq!(leaf_names(&h), vec!["a/(a)", "a/b", "c/d"]);
    }

    #[test]
    fn edges_fold_at_the_lowest_common_ancestor() {
        let h = build_hierarchy(
            vec![
                raw("x/a", &[]),
                raw("x/b", &["x/a"]),
                raw("y", &["x/a"]),
            ],
            &HierarchyParams::default(),
        );
        let x = h.group(ustr("x")).unwrap();
        let inner = x.metagraph.edge_weight(ustr("x/a"), ustr("x/b")).unwrap();
        assert_eq!(inner.base_edges.len(), 1);
        assert_eq!(inner.num_regular, 1);

        let root = h.group(h.root_name()).unwrap();
        let outer = root.metagraph.edge_weight(ustr("x"), ustr("y")).unwrap();
        assert_eq!(outer.base_edges.len(), 1);
        assert_eq!(outer.v, ustr("x"));
        assert_eq!(outer.w, ustr("y"));
    }

    #[test]
    fn parallel_base_edges_share_one_metaedge() {
        // Two distinct raw inputs from the same producer (non-consecutive,
        // so normalization keeps both).
        let h = build_hierarchy(
            vec![raw("sink", &["src:0", "other", "src:1"]), raw("src", &[]), raw("other", &[])],
            &HierarchyParams::default(),
        );
        let root = h.group(h.root_name()).unwrap();
        let metaedge = root
            .metagraph
            .edge_weight(ustr("src"), ustr("sink"))
            .unwrap();
        assert_eq!(metaedge.base_edges.len(), 2);
        assert_eq!(metaedge.total_size, 2);
        assert_eq!(h.max_meta_edge_size, 2);
    }

    #[test]
    fn control_only_metaedges_split_out_in_queries() {
        let h = build_hierarchy(
            vec![raw("a", &[]), raw("b", &[]), raw("c", &["a", "^b"])],
            &HierarchyParams::default(),
        );
        let preds = h.get_predecessors(ustr("c")).unwrap();
        assert_eq!(preds.regular.len(), 1);
        assert_eq!(preds.control.len(), 1);
        assert_eq!(preds.regular[0].v, ustr("a"));
        assert_eq!(preds.control[0].v, ustr("b"));

        let succs = h.get_successors(ustr("a")).unwrap();
        assert_eq!(succs.regular.len(), 1);
        assert_eq!(succs.regular[0].w, ustr("c"));
    }

    #[test]
    fn predecessors_synthesize_embedded_neighbors() {
        let mut graph = crate::graph::build(
            vec![raw("op", &["const"]), raw("const", &[])],
            &BuildParams::default(),
            &LogTracker,
        )
        .unwrap();
        // Pull the constant out of the graph and embed it into its consumer.
        let constant = graph.nodes.remove(&ustr("const")).unwrap();
        graph
            .nodes
            .get_mut(&ustr("op"))
            .unwrap()
            .in_embeddings
            .push(constant);
        let h = build(graph, &HierarchyParams::default(), &LogTracker).unwrap();

        let preds = h.get_predecessors(ustr("op")).unwrap();
        assert_eq!(preds.regular.len(), 1);
        assert_eq!(preds.regular[0].v, ustr("const"));
        assert_eq!(preds.regular[0].w, ustr("op"));
    }

    #[test]
    fn series_members_move_into_the_series_metagraph() {
        let params = HierarchyParams {
            series_node_min_size: 2,
            ..Default::default()
        };
        let h = build_hierarchy(
            vec![
                raw("g/foo_1", &[]),
                raw("g/foo_2", &[]),
                raw("g/foo_3", &[]),
                raw("g/bar", &[]),
            ],
            &params,
        );
        let series_name = ustr("g/foo[1-3]");
        let g = h.group(ustr("g")).unwrap();
        assert!(g.metagraph.contains_node(series_name));
        assert!(g.metagraph.contains_node(ustr("g/bar")));
        assert!(!g.metagraph.contains_node(ustr("g/foo_1")));

        let series = h.group(series_name).unwrap();
        assert!(series.is_series());
        assert_eq!(series.cardinality, 3);
        assert!(series.metagraph.contains_node(ustr("g/foo_2")));
        let member = h.node(ustr("g/foo_2")).unwrap().as_op().unwrap();
        assert_eq!(member.parent, Some(series_name));
        assert_eq!(member.owning_series, Some(series_name));
        assert_eq!(h.series_names()[&ustr("g/foo_2")], series_name);
    }

    #[test]
    fn parent_histograms_stay_put_when_a_series_adopts_members() {
        let params = HierarchyParams {
            series_node_min_size: 2,
            ..Default::default()
        };
        let h = build_hierarchy(
            vec![raw("g/foo_1", &[]), raw("g/foo_2", &[]), raw("g/bar", &[])],
            &params,
        );
        let g = h.group(ustr("g")).unwrap();
        // Intentionally not decremented by adoption.
        assert_eq!(g.op_histogram[&ustr("OP")], 3);
        assert_eq!(g.cardinality, 3);
    }

    #[test]
    fn short_runs_stay_ungrouped_unless_forced() {
        let h = build_hierarchy(
            vec![raw("g/foo_1", &[]), raw("g/foo_2", &[])],
            &HierarchyParams::default(), // min size 5
        );
        assert!(h.node(ustr("g/foo[1-2]")).is_none());
        let g = h.group(ustr("g")).unwrap();
        assert!(g.metagraph.contains_node(ustr("g/foo_1")));

        let mut forced = HierarchyParams::default();
        forced
            .series_map
            .insert(ustr("g/foo[1-2]"), SeriesGrouping::Group);
        let h = build_hierarchy(vec![raw("g/foo_1", &[]), raw("g/foo_2", &[])], &forced);
        assert!(h.group(ustr("g/foo[1-2]")).is_ok());
    }

    #[test]
    fn edges_route_through_series_nodes() {
        let params = HierarchyParams {
            series_node_min_size: 2,
            ..Default::default()
        };
        let h = build_hierarchy(
            vec![
                raw("g/foo_1", &[]),
                raw("g/foo_2", &[]),
                raw("g/bar", &["g/foo_1"]),
            ],
            &params,
        );
        let g = h.group(ustr("g")).unwrap();
        let metaedge = g
            .metagraph
            .edge_weight(ustr("g/foo[1-2]"), ustr("g/bar"))
            .unwrap();
        assert_eq!(metaedge.base_edges.len(), 1);
        assert_eq!(metaedge.base_edges[0].v, ustr("g/foo_1"));
    }

    #[test]
    fn toggling_a_series_regroups_and_refolds_edges() {
        // Too short to group by default.
        let mut h = build_hierarchy(
            vec![
                raw("g/foo_1", &[]),
                raw("g/foo_2", &[]),
                raw("g/bar", &["g/foo_1"]),
            ],
            &HierarchyParams::default(),
        );
        let series_name = ustr("g/foo[1-2]");
        assert!(h.node(series_name).is_none());

        h.set_series_grouping(series_name, SeriesGrouping::Group)
            .unwrap();
        let g = h.group(ustr("g")).unwrap();
        assert!(g.metagraph.contains_node(series_name));
        assert!(g
            .metagraph
            .edge_weight(series_name, ustr("g/bar"))
            .is_some());
        assert!(g.metagraph.edge_weight(ustr("g/foo_1"), ustr("g/bar")).is_none());

        h.set_series_grouping(series_name, SeriesGrouping::Ungroup)
            .unwrap();
        let g = h.group(ustr("g")).unwrap();
        assert!(!g.metagraph.contains_node(series_name));
        assert!(h.node(series_name).is_none());
        let metaedge = g
            .metagraph
            .edge_weight(ustr("g/foo_1"), ustr("g/bar"))
            .unwrap();
        assert_eq!(metaedge.base_edges.len(), 1);
        assert_eq!(
            h.node(ustr("g/foo_1")).unwrap().parent(),
            Some(ustr("g"))
        );
    }

    #[test]
    fn topological_ordering_respects_regular_paths_and_skips_control() {
        let mut h = build_hierarchy(
            vec![
                raw("a", &[]),
                raw("b", &["a"]),
                raw("c", &["b"]),
                raw("d", &["^c"]),
            ],
            &HierarchyParams::default(),
        );
        let root = h.root_name();
        let ordering = h.get_topological_ordering(root).unwrap().unwrap().clone();
        assert!(ordering[&ustr("a")] < ordering[&ustr("b")]);
        assert!(ordering[&ustr("b")] < ordering[&ustr("c")]);
        // Control-only destinations never enter the ordering.
        assert!(!ordering.contains_key(&ustr("d")));
        // Op nodes have no ordering at all.
        assert!(h.get_topological_ordering(ustr("a")).unwrap().is_none());
    }

    #[test]
    fn topological_ordering_follows_regular_paths_across_join_nodes() {
        // `c` is reachable both directly from `a` and through `b`; the
        // short path must not freeze c's number below b's.
        let mut h = build_hierarchy(
            vec![raw("c", &["a", "b"]), raw("b", &["a"]), raw("a", &[])],
            &HierarchyParams::default(),
        );
        let root = h.root_name();
        let ordering = h.get_topological_ordering(root).unwrap().unwrap().clone();
        assert!(ordering[&ustr("a")] < ordering[&ustr("b")]);
        assert!(ordering[&ustr("b")] < ordering[&ustr("c")]);
    }

    #[test]
    fn metaedge_counters_account_for_every_base_edge() {
        // One regular reference-carrying input and one control input from
        // the same producer aggregate into a single metaedge.
        let mut params = BuildParams::default();
        params.ref_edges.insert(("OP".to_string(), 0));
        let graph = crate::graph::build(
            vec![
                raw("sink", &["src:0", "x", "^src"]),
                raw("src", &[]),
                raw("x", &[]),
            ],
            &params,
            &LogTracker,
        )
        .unwrap();
        let h = build(graph, &HierarchyParams::default(), &LogTracker).unwrap();

        let root = h.group(h.root_name()).unwrap();
        let metaedge = root
            .metagraph
            .edge_weight(ustr("src"), ustr("sink"))
            .unwrap();
        assert_eq!(metaedge.num_regular, 1);
        assert_eq!(metaedge.num_control, 1);
        assert_eq!(metaedge.num_ref, 1);
        assert_eq!(
            metaedge.base_edges.len() as u64,
            metaedge.num_regular + metaedge.num_control
        );
        assert!(metaedge.num_ref <= metaedge.num_regular);
    }

    #[test]
    fn topological_ordering_cache_invalidated_by_regrouping() {
        let mut h = build_hierarchy(
            vec![
                raw("g/foo_1", &[]),
                raw("g/foo_2", &[]),
                raw("g/bar", &["g/foo_1"]),
            ],
            &HierarchyParams::default(),
        );
        let before = h
            .get_topological_ordering(ustr("g"))
            .unwrap()
            .unwrap()
            .clone();
        assert!(before.contains_key(&ustr("g/foo_1")));

        h.set_series_grouping(ustr("g/foo[1-2]"), SeriesGrouping::Group)
            .unwrap();
        let after = h
            .get_topological_ordering(ustr("g"))
            .unwrap()
            .unwrap()
            .clone();
        assert!(after.contains_key(&ustr("g/foo[1-2]")));
        assert!(!after.contains_key(&ustr("g/foo_1")));
    }

    #[test]
    fn bridgegraph_projects_external_edges_onto_children() {
        let mut h = build_hierarchy(
            vec![
                raw("x/a", &[]),
                raw("x/b", &[]),
                raw("y", &["x/a"]),
                raw("x/b/c", &["y"]),
            ],
            &HierarchyParams::default(),
        );
        let bridge = h.get_bridgegraph(ustr("x")).unwrap().unwrap();
        // x/a -> y leaves the group.
        let out = bridge.edge_weight(ustr("x/a"), ustr("y")).unwrap();
        assert_eq!(out.inbound, Some(false));
        assert_eq!(out.base_edges.len(), 1);
        // y -> x/b/c enters it, projected onto the immediate child x/b.
        let inward = bridge.edge_weight(ustr("y"), ustr("x/b")).unwrap();
        assert_eq!(inward.inbound, Some(true));
        assert_eq!(inward.base_edges[0].w, ustr("x/b/c"));
        // Op nodes have no bridgegraph.
        assert!(h.get_bridgegraph(ustr("y")).unwrap().is_none());
    }

    #[test]
    fn edges_to_unknown_nodes_are_dropped() {
        let h = build_hierarchy(
            vec![raw("a", &["ghost"]), raw("b", &["a"])],
            &HierarchyParams::default(),
        );
        let root = h.group(h.root_name()).unwrap();
        assert_eq!(root.metagraph.all_edges().count(), 1);
        assert!(root.metagraph.edge_weight(ustr("a"), ustr("b")).is_some());
    }

    #[test]
    fn devices_are_inventoried_sorted() {
        let mut n1 = raw("a", &[]);
        n1.device = Some("runtime".to_string());
        let mut n2 = raw("b", &[]);
        n2.device = Some("development".to_string());
        let h = build_hierarchy(vec![n1, n2], &HierarchyParams::default());
        let devices: Vec<&str> = h.devices.iter().map(|d| d.as_str()).collect();
        assert_eq!(devices, vec!["development", "runtime"]);
        let root = h.group(h.root_name()).unwrap();
        assert_eq!(root.device_histogram[&ustr("runtime")], 1);
    }

    #[test]
    fn missing_names_surface_not_found() {
        let mut h = build_hierarchy(vec![raw("a", &[])], &HierarchyParams::default());
        assert!(matches!(
            h.get_predecessors(ustr("nope")),
            Err(GraphError::NotFound(_))
        ));
        assert!(matches!(
            h.get_topological_ordering(ustr("nope")),
            Err(GraphError::NotFound(_))
        ));
    }
}
