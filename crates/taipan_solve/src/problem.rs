//! Turning an unsolvable rule set into an explainable graph.
//!
//! When the solver fails it returns a [`Problem`]: the set of rules that
//! cannot be satisfied together. The problem can be compressed into a
//! [`ProblemsGraph`] whose nodes are the involved packages and whose edges
//! are requirements and conflicts, and rendered as a human readable tree
//! with [`DisplayUnsat`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Formatter;
use std::rc::Rc;

use itertools::Itertools;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::conflict_map::ConflictMap;
use crate::id::{RuleId, SolvableId, SpecId};
use crate::rules::RuleKind;
use crate::solver::Solver;

/// A node in the problem graph.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProblemNode {
    /// A solvable that could not be placed (the root node is the synthetic
    /// root solvable representing the user request).
    Solvable(SolvableId),
    /// A requirement for which no candidate exists at all.
    UnresolvedDependency,
}

impl ProblemNode {
    fn solvable_id(self) -> SolvableId {
        match self {
            ProblemNode::Solvable(solvable_id) => solvable_id,
            ProblemNode::UnresolvedDependency => {
                panic!("expected solvable node, found unresolved dependency")
            }
        }
    }
}

/// An edge in the problem graph.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ProblemEdge {
    /// The source requires one of the targets through the spec.
    Requires(SpecId),
    /// The source and target exclude each other.
    Conflict(ConflictKind),
}

impl ProblemEdge {
    fn try_requires(self) -> Option<SpecId> {
        match self {
            ProblemEdge::Requires(spec_id) => Some(spec_id),
            ProblemEdge::Conflict(_) => None,
        }
    }
}

/// Why two nodes exclude each other.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ConflictKind {
    /// Two candidates of the same package name.
    SingleInstance,
    /// The target was forbidden outright (a remove or lock job).
    Locked,
    /// The source `constrains` the target's package to a spec the target
    /// does not match. Labeled separately from requires edges.
    Constrains(SpecId),
}

/// Sibling nodes of the problem graph that were merged because they share a
/// name and their edges are identical.
pub struct MergedProblemNode {
    /// The merged solvables, ordered by version.
    pub ids: Vec<SolvableId>,
}

/// The set of rules involved in an unsolvable job list.
#[derive(Debug, Default)]
pub struct Problem {
    rules: Vec<RuleId>,
}

impl Problem {
    pub(crate) fn add_rule(&mut self, rule_id: RuleId) {
        if !self.rules.contains(&rule_id) {
            self.rules.push(rule_id);
        }
    }

    /// Builds the problem graph from the cited rules.
    pub fn graph(&self, solver: &Solver) -> ProblemsGraph {
        let mut graph = DiGraph::<ProblemNode, ProblemEdge>::default();
        let mut nodes: HashMap<SolvableId, NodeIndex> = HashMap::default();

        let root_node = Self::add_node(&mut graph, &mut nodes, SolvableId::root());
        let unresolved_node = graph.add_node(ProblemNode::UnresolvedDependency);

        for rule_id in &self.rules {
            let rule = &solver.rules[rule_id.index()];
            match rule.kind {
                RuleKind::InstallRoot => (),
                RuleKind::Requires(owner, spec_id) => {
                    let owner_node = Self::add_node(&mut graph, &mut nodes, owner);
                    let candidates = solver.pool().candidates[spec_id.index()]
                        .as_deref()
                        .unwrap_or(&[]);
                    if candidates.is_empty() {
                        graph.add_edge(
                            owner_node,
                            unresolved_node,
                            ProblemEdge::Requires(spec_id),
                        );
                    } else {
                        for &candidate in candidates {
                            let candidate_node =
                                Self::add_node(&mut graph, &mut nodes, candidate);
                            graph.add_edge(
                                owner_node,
                                candidate_node,
                                ProblemEdge::Requires(spec_id),
                            );
                        }
                    }
                }
                RuleKind::Forbids(a, b) => {
                    let kind = if a.is_root() {
                        ConflictKind::Locked
                    } else {
                        ConflictKind::SingleInstance
                    };
                    let a_node = Self::add_node(&mut graph, &mut nodes, a);
                    let b_node = Self::add_node(&mut graph, &mut nodes, b);
                    graph.add_edge(a_node, b_node, ProblemEdge::Conflict(kind));
                }
                RuleKind::Constrains(a, b, spec_id) => {
                    let a_node = Self::add_node(&mut graph, &mut nodes, a);
                    let b_node = Self::add_node(&mut graph, &mut nodes, b);
                    graph.add_edge(
                        a_node,
                        b_node,
                        ProblemEdge::Conflict(ConflictKind::Constrains(spec_id)),
                    );
                }
            }
        }

        let unresolved_node = if graph
            .edges_directed(unresolved_node, Direction::Incoming)
            .next()
            .is_none()
        {
            graph.remove_node(unresolved_node);
            None
        } else {
            Some(unresolved_node)
        };

        ProblemsGraph {
            graph,
            root_node,
            unresolved_node,
        }
    }

    fn add_node(
        graph: &mut DiGraph<ProblemNode, ProblemEdge>,
        nodes: &mut HashMap<SolvableId, NodeIndex>,
        solvable_id: SolvableId,
    ) -> NodeIndex {
        *nodes
            .entry(solvable_id)
            .or_insert_with(|| graph.add_node(ProblemNode::Solvable(solvable_id)))
    }

    /// Renders the problem as a human readable tree.
    pub fn display_user_friendly<'a>(&self, solver: &'a Solver) -> DisplayUnsat<'a> {
        DisplayUnsat::new(self.graph(solver), solver)
    }
}

/// The compressed graph view of a [`Problem`].
pub struct ProblemsGraph {
    graph: DiGraph<ProblemNode, ProblemEdge>,
    root_node: NodeIndex,
    unresolved_node: Option<NodeIndex>,
}

impl ProblemsGraph {
    /// The symmetric conflict relation between the solvables of this graph.
    pub fn conflict_map(&self) -> ConflictMap<SolvableId> {
        let mut map = ConflictMap::new();
        for edge in self.graph.edge_references() {
            if matches!(edge.weight(), ProblemEdge::Conflict(_)) {
                let source = self.graph[edge.source()].solvable_id();
                let target = self.graph[edge.target()].solvable_id();
                map.add(source, target);
            }
        }
        map
    }

    /// Merges sibling package nodes that share a name and have identical
    /// edges, so version ranges render as one line.
    fn simplify(&self, solver: &Solver) -> HashMap<SolvableId, Rc<MergedProblemNode>> {
        let graph = &self.graph;

        let mut maybe_merge = HashMap::new();
        for node_id in graph.node_indices() {
            let candidate = match graph[node_id] {
                ProblemNode::UnresolvedDependency => continue,
                ProblemNode::Solvable(solvable_id) if solvable_id.is_root() => continue,
                ProblemNode::Solvable(solvable_id) => solvable_id,
            };

            // Conflict targets must stay distinct nodes.
            if graph
                .edges_directed(node_id, Direction::Incoming)
                .any(|e| matches!(e.weight(), ProblemEdge::Conflict(..)))
            {
                continue;
            }

            let predecessors: Vec<_> = graph
                .edges_directed(node_id, Direction::Incoming)
                .map(|e| e.source())
                .sorted_unstable()
                .collect();
            let successors: Vec<_> = graph
                .edges(node_id)
                .map(|e| (e.target(), *e.weight()))
                .sorted_unstable()
                .collect();
            let name = solver.pool().resolve_solvable(candidate).name_id();

            maybe_merge
                .entry((name, predecessors, successors))
                .or_insert_with(Vec::new)
                .push((node_id, candidate));
        }

        let mut merged_candidates = HashMap::default();
        for mut group in maybe_merge.into_values() {
            if group.len() > 1 {
                group.sort_unstable_by(|&(_, a), &(_, b)| {
                    solver
                        .pool()
                        .resolve_solvable(a)
                        .record
                        .package_record
                        .version
                        .cmp(
                            &solver
                                .pool()
                                .resolve_solvable(b)
                                .record
                                .package_record
                                .version,
                        )
                });
                let merged = Rc::new(MergedProblemNode {
                    ids: group.into_iter().map(|(_, solvable)| solvable).collect(),
                });
                for &id in &merged.ids {
                    merged_candidates.insert(id, merged.clone());
                }
            }
        }

        merged_candidates
    }

    /// A node is installable if none of its paths to the leaves pass
    /// through a conflict. Conflicts are propagated up the graph.
    fn get_installable_set(&self) -> HashSet<NodeIndex> {
        let mut non_installable: HashSet<NodeIndex> = HashSet::new();

        let mut conflicting_edges: Vec<_> = self
            .graph
            .edge_references()
            .filter(|e| matches!(e.weight(), ProblemEdge::Conflict(..)))
            .collect();
        if let Some(unresolved) = self.unresolved_node {
            conflicting_edges.extend(self.graph.edges_directed(unresolved, Direction::Incoming));
        }

        let mut pending: Vec<NodeIndex> =
            conflicting_edges.into_iter().map(|e| e.source()).collect();
        while let Some(node) = pending.pop() {
            if non_installable.insert(node) {
                pending.extend(
                    self.graph
                        .edges_directed(node, Direction::Incoming)
                        .map(|e| e.source()),
                );
            }
        }

        self.graph
            .node_indices()
            .filter(|node| !non_installable.contains(node))
            .collect()
    }
}

/// Renders a [`ProblemsGraph`] as an indented tree, merging version ranges
/// and pointing out the conflicting leaves.
pub struct DisplayUnsat<'a> {
    graph: ProblemsGraph,
    merged_candidates: HashMap<SolvableId, Rc<MergedProblemNode>>,
    installable_set: HashSet<NodeIndex>,
    solver: &'a Solver,
}

impl<'a> DisplayUnsat<'a> {
    pub(crate) fn new(graph: ProblemsGraph, solver: &'a Solver) -> Self {
        let merged_candidates = graph.simplify(solver);
        let installable_set = graph.get_installable_set();
        Self {
            graph,
            merged_candidates,
            installable_set,
            solver,
        }
    }

    fn version_range(&self, solvable_id: SolvableId, reported: &mut HashSet<SolvableId>) -> String {
        let pool = self.solver.pool();
        if let Some(merged) = self.merged_candidates.get(&solvable_id) {
            reported.extend(merged.ids.iter().copied());
            merged
                .ids
                .iter()
                .map(|&id| {
                    pool.resolve_solvable(id)
                        .record
                        .package_record
                        .version
                        .to_string()
                })
                .join(" | ")
        } else {
            pool.resolve_solvable(solvable_id)
                .record
                .package_record
                .version
                .to_string()
        }
    }
}

impl fmt::Display for DisplayUnsat<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        enum DisplayOp {
            Requirement(SpecId, Vec<petgraph::graph::EdgeIndex>),
            Candidate(NodeIndex),
        }

        let graph = &self.graph.graph;
        let pool = self.solver.pool();
        let installable = &self.installable_set;
        let mut reported: HashSet<SolvableId> = HashSet::new();

        writeln!(f, "The following packages are incompatible")?;

        let mut stack = graph
            .edges(self.graph.root_node)
            .filter(|e| e.weight().try_requires().is_some())
            .chunk_by(|e| match e.weight() {
                ProblemEdge::Requires(spec_id) => *spec_id,
                ProblemEdge::Conflict(_) => unreachable!("filtered above"),
            })
            .into_iter()
            .map(|(spec_id, group)| {
                let edges: Vec<_> = group.map(|e| e.id()).collect();
                (DisplayOp::Requirement(spec_id, edges), 0usize)
            })
            .collect::<Vec<_>>();

        while let Some((op, depth)) = stack.pop() {
            let indent = "    ".repeat(depth);
            match op {
                DisplayOp::Requirement(spec_id, edges) => {
                    debug_assert!(!edges.is_empty());
                    let spec = pool.resolve_spec(spec_id);

                    let all_missing = edges.iter().all(|&e| {
                        let (_, target) = graph.edge_endpoints(e).expect("edge exists");
                        graph[target] == ProblemNode::UnresolvedDependency
                    });
                    let any_installable = edges.iter().any(|&e| {
                        let (_, target) = graph.edge_endpoints(e).expect("edge exists");
                        installable.contains(&target)
                    });

                    if all_missing {
                        if depth == 0 {
                            writeln!(f, "{indent}|-- no candidates were found for {spec}.")?;
                        } else {
                            writeln!(f, "{indent}|-- {spec}, for which no candidates were found.")?;
                        }
                    } else if any_installable {
                        if depth == 0 {
                            writeln!(
                                f,
                                "|-- {spec} can be installed with any of the following options:"
                            )?;
                        } else {
                            writeln!(f, "{indent}|-- {spec}, which can be installed with any of the following options:")?;
                        }
                        stack.extend(
                            edges
                                .iter()
                                .filter(|&&e| {
                                    installable.contains(
                                        &graph.edge_endpoints(e).expect("edge exists").1,
                                    )
                                })
                                .map(|&e| {
                                    (
                                        DisplayOp::Candidate(
                                            graph.edge_endpoints(e).expect("edge exists").1,
                                        ),
                                        depth + 1,
                                    )
                                }),
                        );
                    } else {
                        if depth == 0 {
                            writeln!(f, "|-- {spec} cannot be installed because there are no viable options:")?;
                        } else {
                            writeln!(f, "{indent}|-- {spec}, which cannot be installed because there are no viable options:")?;
                        }
                        stack.extend(edges.iter().map(|&e| {
                            (
                                DisplayOp::Candidate(
                                    graph.edge_endpoints(e).expect("edge exists").1,
                                ),
                                depth + 1,
                            )
                        }));
                    }
                }
                DisplayOp::Candidate(node) => {
                    if graph[node] == ProblemNode::UnresolvedDependency {
                        continue;
                    }
                    let solvable_id = graph[node].solvable_id();
                    if reported.contains(&solvable_id) {
                        continue;
                    }

                    let name = &pool.resolve_solvable(solvable_id).record.package_record.name;
                    let version = self.version_range(solvable_id, &mut reported);

                    let is_conflict_source = graph
                        .edges(node)
                        .any(|e| e.weight().try_requires().is_none());
                    let is_leaf = graph.edges(node).next().is_none();

                    if is_conflict_source {
                        writeln!(f, "{indent}|-- {name} {version}, which conflicts with the versions reported above.")?;
                    } else if is_leaf {
                        writeln!(f, "{indent}|-- {name} {version}")?;
                    } else {
                        writeln!(f, "{indent}|-- {name} {version} would require")?;
                        stack.extend(
                            graph
                                .edges(node)
                                .filter(|e| e.weight().try_requires().is_some())
                                .chunk_by(|e| match e.weight() {
                                    ProblemEdge::Requires(spec_id) => *spec_id,
                                    ProblemEdge::Conflict(_) => unreachable!("filtered above"),
                                })
                                .into_iter()
                                .map(|(spec_id, group)| {
                                    let edges: Vec<_> = group.map(|e| e.id()).collect();
                                    (DisplayOp::Requirement(spec_id, edges), depth + 1)
                                }),
                        );
                    }
                }
            }
        }

        // Conflicts hanging off the root are locked or removed packages.
        for edge in graph.edges(self.graph.root_node) {
            let ProblemEdge::Conflict(kind) = edge.weight() else {
                continue;
            };
            let target = graph[edge.target()].solvable_id();
            let record = &pool.resolve_solvable(target).record.package_record;
            match kind {
                ConflictKind::Locked => {
                    writeln!(
                        f,
                        "|-- {} {} is locked or removed, but another version is required as reported above",
                        record.name, record.version
                    )?;
                }
                ConflictKind::SingleInstance => {}
                ConflictKind::Constrains(spec_id) => {
                    writeln!(
                        f,
                        "|-- {} {} is constrained to {}",
                        record.name,
                        record.version,
                        pool.resolve_spec(*spec_id)
                    )?;
                }
            }
        }

        Ok(())
    }
}
