//! Deliberation graph definition and compile-time validation
//!
//! The debate loop is a cycle by design. Safety comes from the compile
//! step: every cycle in the graph must have at least one conditional exit
//! edge (a round counter or convergence check that can leave the loop),
//! or compilation refuses before any model call is made. The compiled
//! graph also carries the hard node-visit budget.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::GraphError;

pub mod convergence;
pub mod runner;

pub use convergence::{ConvergenceChecker, ConvergenceSignals, ConvergenceVerdict};
pub use runner::{GraphOutcome, GraphRunner};

/// Compiled-in hard cap on total node visits per session: 15 rounds × 3
/// visits per round (decide, speak, check) plus pipeline overhead.
pub const MAX_NODE_VISITS: u32 = 55;

/// Nodes of the deliberation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Decompose,
    CollectContext,
    SelectPersonas,
    InitialRound,
    FacilitatorDecide,
    PersonaContribute,
    ModeratorIntervene,
    Research,
    CheckConvergence,
    Recommend,
    Synthesize,
    End,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Decompose => "decompose",
            NodeId::CollectContext => "collect_context",
            NodeId::SelectPersonas => "select_personas",
            NodeId::InitialRound => "initial_round",
            NodeId::FacilitatorDecide => "facilitator_decide",
            NodeId::PersonaContribute => "persona_contribute",
            NodeId::ModeratorIntervene => "moderator_intervene",
            NodeId::Research => "research",
            NodeId::CheckConvergence => "check_convergence",
            NodeId::Recommend => "recommend",
            NodeId::Synthesize => "synthesize",
            NodeId::End => "end",
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge. `conditional` marks edges taken only when a runtime
/// predicate holds (convergence reached, round budget spent, …) — the
/// edges that make cycles safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub conditional: bool,
}

impl Edge {
    pub const fn flows(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            conditional: false,
        }
    }

    pub const fn guarded(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            conditional: true,
        }
    }
}

/// An uncompiled graph: just edges.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new(edges: Vec<Edge>) -> Self {
        Self { edges }
    }

    /// The deliberation graph from the component design.
    pub fn deliberation() -> Self {
        use NodeId::*;
        Self::new(vec![
            Edge::flows(Decompose, CollectContext),
            Edge::flows(CollectContext, SelectPersonas),
            Edge::flows(SelectPersonas, InitialRound),
            Edge::flows(InitialRound, FacilitatorDecide),
            // The facilitator fans out to one of four actions.
            Edge::flows(FacilitatorDecide, PersonaContribute),
            Edge::flows(FacilitatorDecide, ModeratorIntervene),
            Edge::flows(FacilitatorDecide, Research),
            Edge::guarded(FacilitatorDecide, Recommend),
            Edge::flows(PersonaContribute, CheckConvergence),
            Edge::flows(ModeratorIntervene, CheckConvergence),
            Edge::flows(Research, FacilitatorDecide),
            // The debate cycle, with its conditional exit.
            Edge::flows(CheckConvergence, FacilitatorDecide),
            Edge::guarded(CheckConvergence, Recommend),
            Edge::flows(Recommend, Synthesize),
            Edge::flows(Synthesize, End),
        ])
    }

    /// Validate and compile. Every cycle must contain at least one node
    /// with a conditional edge leaving that cycle.
    pub fn compile(self) -> Result<CompiledGraph, GraphError> {
        let mut adjacency: HashMap<NodeId, Vec<&Edge>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from).or_default().push(edge);
        }

        for cycle in find_cycles(&adjacency) {
            let cycle_set: HashSet<NodeId> = cycle.iter().copied().collect();
            let has_exit = cycle.iter().any(|node| {
                adjacency
                    .get(node)
                    .map(|edges| {
                        edges
                            .iter()
                            .any(|e| e.conditional && !cycle_set.contains(&e.to))
                    })
                    .unwrap_or(false)
            });
            if !has_exit {
                return Err(GraphError::UncontrolledCycle {
                    node: cycle[0].to_string(),
                });
            }
        }

        Ok(CompiledGraph {
            edges: self.edges,
            max_visits: MAX_NODE_VISITS,
        })
    }
}

/// A validated graph. Construction is only possible through
/// [`GraphDefinition::compile`].
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    edges: Vec<Edge>,
    max_visits: u32,
}

impl CompiledGraph {
    pub fn max_visits(&self) -> u32 {
        self.max_visits
    }

    /// Whether `from → to` is a declared edge. The runner asserts this on
    /// every transition it takes.
    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }
}

/// Enumerate simple cycles by DFS from every node. The graph is a dozen
/// nodes, so the naive search is fine.
fn find_cycles(adjacency: &HashMap<NodeId, Vec<&Edge>>) -> Vec<Vec<NodeId>> {
    let mut cycles: Vec<Vec<NodeId>> = Vec::new();
    let mut seen: HashSet<Vec<NodeId>> = HashSet::new();

    for &start in adjacency.keys() {
        let mut path = vec![start];
        dfs_cycles(start, start, adjacency, &mut path, &mut cycles, &mut seen);
    }
    cycles
}

fn dfs_cycles(
    start: NodeId,
    current: NodeId,
    adjacency: &HashMap<NodeId, Vec<&Edge>>,
    path: &mut Vec<NodeId>,
    cycles: &mut Vec<Vec<NodeId>>,
    seen: &mut HashSet<Vec<NodeId>>,
) {
    let Some(edges) = adjacency.get(&current) else {
        return;
    };
    for edge in edges {
        if edge.to == start {
            // Canonical rotation so each cycle is reported once.
            let mut canonical = path.clone();
            let min_index = canonical
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.as_str())
                .map(|(i, _)| i)
                .unwrap_or(0);
            canonical.rotate_left(min_index);
            if seen.insert(canonical.clone()) {
                cycles.push(canonical);
            }
        } else if !path.contains(&edge.to) {
            path.push(edge.to);
            dfs_cycles(start, edge.to, adjacency, path, cycles, seen);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliberation_graph_compiles() {
        let compiled = GraphDefinition::deliberation().compile().unwrap();
        assert_eq!(compiled.max_visits(), MAX_NODE_VISITS);
        assert!(compiled.has_edge(NodeId::Decompose, NodeId::CollectContext));
        assert!(compiled.has_edge(NodeId::CheckConvergence, NodeId::Recommend));
        assert!(!compiled.has_edge(NodeId::End, NodeId::Decompose));
    }

    #[test]
    fn test_uncontrolled_cycle_refused() {
        use NodeId::*;
        // decide ↔ contribute with no conditional way out.
        let graph = GraphDefinition::new(vec![
            Edge::flows(FacilitatorDecide, PersonaContribute),
            Edge::flows(PersonaContribute, FacilitatorDecide),
        ]);
        let err = graph.compile().unwrap_err();
        assert!(matches!(err, GraphError::UncontrolledCycle { .. }));
    }

    #[test]
    fn test_conditional_edge_inside_cycle_is_not_an_exit() {
        use NodeId::*;
        // The conditional edge stays inside the cycle, so it cannot end it.
        let graph = GraphDefinition::new(vec![
            Edge::flows(FacilitatorDecide, PersonaContribute),
            Edge::guarded(PersonaContribute, FacilitatorDecide),
        ]);
        let err = graph.compile().unwrap_err();
        assert!(matches!(err, GraphError::UncontrolledCycle { .. }));
    }

    #[test]
    fn test_cycle_with_conditional_exit_accepted() {
        use NodeId::*;
        let graph = GraphDefinition::new(vec![
            Edge::flows(FacilitatorDecide, PersonaContribute),
            Edge::flows(PersonaContribute, CheckConvergence),
            Edge::flows(CheckConvergence, FacilitatorDecide),
            Edge::guarded(CheckConvergence, Recommend),
            Edge::flows(Recommend, End),
        ]);
        assert!(graph.compile().is_ok());
    }

    #[test]
    fn test_acyclic_graph_accepted() {
        use NodeId::*;
        let graph = GraphDefinition::new(vec![
            Edge::flows(Decompose, SelectPersonas),
            Edge::flows(SelectPersonas, End),
        ]);
        assert!(graph.compile().is_ok());
    }

    #[test]
    fn test_both_deliberation_cycles_found() {
        use NodeId::*;
        let graph = GraphDefinition::deliberation();
        let mut adjacency: HashMap<NodeId, Vec<&Edge>> = HashMap::new();
        for edge in &graph.edges {
            adjacency.entry(edge.from).or_default().push(edge);
        }
        let cycles = find_cycles(&adjacency);
        // persona loop, moderator loop, and research loop at minimum.
        assert!(cycles.len() >= 3);
        assert!(cycles
            .iter()
            .any(|c| c.contains(&Research) && c.contains(&FacilitatorDecide)));
    }
}
