//! Execution graph: (instruction, pipeline stage) nodes with timing edges.
//!
//! The graph is a DAG stored as flat vectors with integer indices; each
//! node carries a stage tag, a latency interval and the ready/start/finish
//! intervals filled by the solver. Solid edges are dependencies (the sink
//! starts after the source finishes), slashed edges are not-before
//! orderings (the sink starts no earlier than the source starts).

pub mod builder;
pub mod solver;

pub use builder::{ExeGraphBuilder, SeqInst};
pub use solver::solve;

/// Node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Dependency: `start(dst) >= finish(src) + latency`.
    Solid,
    /// Ordering: `start(dst) >= start(src) + latency`.
    Slashed,
}

/// Position of the owning instruction in the analyzed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePart {
    BeforePrologue,
    Prologue,
    Body,
    Epilogue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub min: u64,
    pub max: u64,
}

impl Interval {
    pub fn point(v: u64) -> Self {
        Self { min: v, max: v }
    }
}

/// Times of one node through the stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Times {
    pub ready: Interval,
    pub start: Interval,
    pub finish: Interval,
}

#[derive(Debug, Clone)]
pub struct ExeNode {
    /// Index of the instruction in the sequence.
    pub inst: usize,
    /// Pipeline stage index.
    pub stage: usize,
    /// Functional unit inside an execution stage.
    pub fu: Option<usize>,
    pub part: CodePart,
    pub latency: Interval,
    pub times: Times,
    /// Nodes competing for the same non-pipelined resource.
    pub contenders: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ExeEdge {
    pub src: NodeId,
    pub dst: NodeId,
    pub ty: EdgeType,
    pub latency: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ExeGraph {
    pub nodes: Vec<ExeNode>,
    pub edges: Vec<ExeEdge>,
}

impl ExeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: ExeNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() as u32 - 1)
    }

    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, ty: EdgeType, latency: u32) {
        debug_assert_ne!(src, dst);
        self.edges.push(ExeEdge {
            src,
            dst,
            ty,
            latency,
        });
    }

    pub fn node(&self, id: NodeId) -> &ExeNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ExeNode {
        &mut self.nodes[id.index()]
    }

    /// Topological order; `None` when the graph has a cycle (which is a
    /// construction bug, the graph must stay a DAG).
    pub fn topo_order(&self) -> Option<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut indeg = vec![0usize; n];
        for e in &self.edges {
            indeg[e.dst.index()] += 1;
        }
        let mut ready: Vec<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
        // deterministic tie-break on node index
        ready.sort_unstable_by(|a, b| b.cmp(a));
        let mut order = Vec::with_capacity(n);
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for e in &self.edges {
            succs[e.src.index()].push(e.dst.index());
        }
        while let Some(i) = ready.pop() {
            order.push(NodeId(i as u32));
            for &s in &succs[i] {
                indeg[s] -= 1;
                if indeg[s] == 0 {
                    // keep the vector sorted descending for determinism
                    let pos = ready.binary_search_by(|x| s.cmp(x)).unwrap_or_else(|p| p);
                    ready.insert(pos, s);
                }
            }
        }
        (order.len() == n).then_some(order)
    }

    /// Last node of the given part traversing the given stage.
    pub fn last_node_of(&self, part: CodePart, stage: usize) -> Option<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.part == part && n.stage == stage)
            .max_by_key(|(_, n)| n.inst)
            .map(|(i, _)| NodeId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(inst: usize, stage: usize) -> ExeNode {
        ExeNode {
            inst,
            stage,
            fu: None,
            part: CodePart::Body,
            latency: Interval::point(1),
            times: Times::default(),
            contenders: Vec::new(),
        }
    }

    #[test]
    fn test_topo_order() {
        let mut g = ExeGraph::new();
        let a = g.add_node(node(0, 0));
        let b = g.add_node(node(0, 1));
        let c = g.add_node(node(1, 0));
        g.add_edge(a, b, EdgeType::Solid, 0);
        g.add_edge(a, c, EdgeType::Solid, 0);
        g.add_edge(c, b, EdgeType::Slashed, 0);

        let order = g.topo_order().unwrap();
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(c) < pos(b));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = ExeGraph::new();
        let a = g.add_node(node(0, 0));
        let b = g.add_node(node(0, 1));
        g.add_edge(a, b, EdgeType::Solid, 0);
        g.add_edge(b, a, EdgeType::Solid, 0);
        assert!(g.topo_order().is_none());
    }

    #[test]
    fn test_last_node_of() {
        let mut g = ExeGraph::new();
        g.add_node(node(0, 2));
        let last = g.add_node(node(1, 2));
        g.add_node(node(1, 1));
        assert_eq!(g.last_node_of(CodePart::Body, 2), Some(last));
        assert_eq!(g.last_node_of(CodePart::Prologue, 2), None);
    }
}
