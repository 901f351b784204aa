//! Execution-graph construction for one instruction sequence.
//!
//! The sequence is a prefix (prologue) followed by the analyzed block and
//! an optional epilogue. Every instruction gets one node per pipeline
//! stage; execution stages route through the functional unit selected by
//! the dispatch table. Edges model pipelining, in-order progression under
//! the stage width, register read-after-write dependencies and contention
//! on non-pipelined units.

use super::{CodePart, EdgeType, ExeGraph, ExeNode, Interval, NodeId, Times};
use crate::hard::{Processor, StageType};
use crate::prog::{Inst, Register};
use ahash::AHashMap;

/// One element of the analyzed sequence.
#[derive(Debug, Clone)]
pub struct SeqInst {
    pub inst: Inst,
    pub part: CodePart,
}

pub struct ExeGraphBuilder<'a> {
    proc: &'a Processor,
}

impl<'a> ExeGraphBuilder<'a> {
    pub fn new(proc: &'a Processor) -> Self {
        Self { proc }
    }

    /// Builds the graph for the sequence. The returned grid maps
    /// (sequence index, stage) to the node id.
    pub fn build(&self, seq: &[SeqInst]) -> (ExeGraph, Vec<Vec<NodeId>>) {
        let mut g = ExeGraph::new();
        let stages = &self.proc.stages;
        let mut grid: Vec<Vec<NodeId>> = Vec::with_capacity(seq.len());

        // nodes
        for (i, si) in seq.iter().enumerate() {
            let mut row = Vec::with_capacity(stages.len());
            for (s, stage) in stages.iter().enumerate() {
                let (fu, latency) = if stage.ty == StageType::Exec {
                    let fu = self.proc.dispatch(s, si.inst.kind());
                    let lat = fu
                        .map(|f| stage.fus[f].latency)
                        .unwrap_or(stage.latency);
                    // annulled slots occupy the unit for a single cycle
                    if si.inst.kind().is_annulled() {
                        (fu, 1)
                    } else {
                        (fu, lat)
                    }
                } else {
                    (None, stage.latency)
                };
                let id = g.add_node(ExeNode {
                    inst: i,
                    stage: s,
                    fu,
                    part: si.part,
                    latency: Interval::point(latency as u64),
                    times: Times::default(),
                    contenders: Vec::new(),
                });
                row.push(id);
            }
            grid.push(row);
        }

        // pipelining: a node starts at or after the previous stage's node
        // of the same instruction finishes
        for row in &grid {
            for pair in row.windows(2) {
                g.add_edge(pair[0], pair[1], EdgeType::Solid, 0);
            }
        }

        // in-order progression per stage
        for (s, stage) in stages.iter().enumerate() {
            let w = stage.width.max(1);
            for i in 0..seq.len() {
                if i + w < seq.len() {
                    // width-w stage: i must leave before i+w enters
                    g.add_edge(grid[i][s], grid[i + w][s], EdgeType::Solid, 0);
                }
                if i + 1 < seq.len() {
                    // program order of starts within the stage
                    g.add_edge(grid[i][s], grid[i + 1][s], EdgeType::Slashed, 0);
                }
            }
        }

        // register read-after-write dependencies
        if let Some(exec) = self.proc.exec_stage() {
            let result_stage = self.result_stage(exec);
            let mut last_writer: AHashMap<Register, usize> = AHashMap::new();
            for (i, si) in seq.iter().enumerate() {
                if let Some(reads) = si.inst.reads_opt() {
                    for reg in reads {
                        if let Some(&w) = last_writer.get(reg) {
                            g.add_edge(grid[w][result_stage], grid[i][exec], EdgeType::Solid, 0);
                        }
                    }
                }
                if let Some(writes) = si.inst.writes_opt() {
                    for reg in writes {
                        last_writer.insert(*reg, i);
                    }
                }
            }
        }

        // contention on non-pipelined functional units
        if let Some(exec) = self.proc.exec_stage() {
            let fus = &stages[exec].fus;
            let mut last_on_fu: AHashMap<usize, usize> = AHashMap::new();
            for (i, _) in seq.iter().enumerate() {
                let node = g.node(grid[i][exec]).clone();
                if let Some(f) = node.fu {
                    if !fus[f].pipelined {
                        if let Some(&prev) = last_on_fu.get(&f) {
                            let lat = fus[f].latency;
                            g.add_edge(grid[prev][exec], grid[i][exec], EdgeType::Slashed, lat);
                            let prev_id = grid[prev][exec];
                            let cur_id = grid[i][exec];
                            g.node_mut(prev_id).contenders.push(cur_id);
                            g.node_mut(cur_id).contenders.push(prev_id);
                        }
                    }
                    last_on_fu.insert(f, i);
                }
            }
        }

        (g, grid)
    }

    /// Stage whose finish produces the register result: the first stage
    /// after execution, or the execution stage itself on a short pipeline.
    fn result_stage(&self, exec: usize) -> usize {
        if exec + 1 < self.proc.stages.len() {
            exec + 1
        } else {
            exec
        }
    }
}
