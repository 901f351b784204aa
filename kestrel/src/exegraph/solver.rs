//! Longest-path solving of an execution graph.
//!
//! Times are computed forward over a topological order: a node becomes
//! ready when its incoming edges allow it, starts when ready and finishes
//! after its latency. The sequence time is the finish of the last
//! committed body instruction, minus the finish of the last prologue
//! instruction when a prefix is present (delta time).

use super::{CodePart, EdgeType, ExeGraph};

/// Fills the node time intervals in place. The graph must be a DAG.
pub fn solve(g: &mut ExeGraph) {
    let order = g
        .topo_order()
        .expect("execution graph construction keeps the graph acyclic");

    // reset
    for node in &mut g.nodes {
        node.times = Default::default();
    }

    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); g.nodes.len()];
    for (i, e) in g.edges.iter().enumerate() {
        preds[e.dst.index()].push(i);
    }

    for id in order {
        let mut ready_min = 0u64;
        let mut ready_max = 0u64;
        for &ei in &preds[id.index()] {
            let e = &g.edges[ei];
            let src = &g.nodes[e.src.index()];
            let (lo, hi) = match e.ty {
                EdgeType::Solid => (
                    src.times.finish.min + e.latency as u64,
                    src.times.finish.max + e.latency as u64,
                ),
                EdgeType::Slashed => (
                    src.times.start.min + e.latency as u64,
                    src.times.start.max + e.latency as u64,
                ),
            };
            ready_min = ready_min.max(lo);
            ready_max = ready_max.max(hi);
        }
        let node = &mut g.nodes[id.index()];
        node.times.ready.min = ready_min;
        node.times.ready.max = ready_max;
        node.times.start = node.times.ready;
        node.times.finish.min = node.times.start.min + node.latency.min;
        node.times.finish.max = node.times.start.max + node.latency.max;
        debug_assert!(node.times.finish.min <= node.times.finish.max);
    }
}

/// Worst-case time of the sequence after [`solve`] ran: delta between the
/// last body commit and the last prologue commit.
pub fn sequence_time(g: &ExeGraph, commit_stage: usize) -> u64 {
    let end = match g.last_node_of(CodePart::Body, commit_stage) {
        Some(id) => g.node(id).times.finish.max,
        None => return 0,
    };
    let base = g
        .last_node_of(CodePart::Prologue, commit_stage)
        .map(|id| g.node(id).times.finish.max)
        .unwrap_or(0);
    end.saturating_sub(base)
}
