//! Per-edge timing of basic blocks under event configurations.
//!
//! For each CFG edge (prefix, block) a sequence is built from the prefix
//! instructions and the block instructions, the execution graph is solved
//! once per configuration of the enumerated `sometimes` events, and the
//! times split into the low time (no event fires) and the high time (worst
//! configuration). The ILP charges the low time to the edge count and the
//! difference to a dedicated high-time variable bounded by the event
//! occurrence estimates.

use super::{Event, EventMap, EventRc, EventType, Occurrence, StagePoint};
use crate::cfg::{BlockRef, CfgCollection, CfgRef};
use crate::exegraph::{
    solver, CodePart, EdgeType, ExeGraph, ExeGraphBuilder, NodeId, SeqInst,
};
use crate::hard::Processor;
use ahash::AHashMap;
use petgraph::graph::EdgeIndex;

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Cap on the number of exactly-enumerated events per sequence; the
    /// remaining lowest-weight events are folded into the base time.
    pub threshold: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { threshold: 8 }
    }
}

/// Timing of one (prefix, block) unit, counted on the connecting edge.
pub struct TimeUnit {
    pub cfg: CfgRef,
    pub edge: EdgeIndex,
    pub block: BlockRef,
    /// Time with no `sometimes` event firing.
    pub lts: u64,
    /// Worst time over all event configurations.
    pub hts: u64,
    /// Enumerated events that can push the unit into the high time.
    pub events: Vec<EventRc>,
    /// Per-configuration table (mask over `events` -> time).
    pub table: Vec<(u32, u64)>,
}

pub struct TimeUnits {
    pub units: Vec<TimeUnit>,
    /// Worst time of each block over its units.
    pub block_time: AHashMap<BlockRef, u64>,
    /// Standalone time of each block (no prefix, static events only),
    /// used by the delta method.
    pub solo: AHashMap<BlockRef, u64>,
}

impl TimeUnits {
    pub fn time_of(&self, at: BlockRef) -> u64 {
        self.block_time.get(&at).copied().unwrap_or(0)
    }
}

fn stage_index(proc: &Processor, place: StagePoint) -> usize {
    match place {
        StagePoint::Fetch => proc.fetch_stage().unwrap_or(0),
        StagePoint::Exec => proc.exec_stage().unwrap_or_else(|| proc.commit_stage()),
        StagePoint::Commit => proc.commit_stage(),
    }
}

/// Applies one event to the graph under construction.
fn apply_event(
    g: &mut ExeGraph,
    grid: &[Vec<NodeId>],
    seq: &[SeqInst],
    proc: &Processor,
    event: &dyn Event,
    part: CodePart,
) {
    let Some(i) = seq
        .iter()
        .position(|s| s.part == part && s.inst.address() == event.inst())
    else {
        return;
    };
    let stage = stage_index(proc, event.place());
    let target = grid[i][stage];
    match event.etype() {
        EventType::Local => {
            let node = g.node_mut(target);
            node.latency.min += event.cost();
            node.latency.max += event.cost();
        }
        EventType::After | EventType::NotBefore => {
            let Some((raddr, rplace)) = event.related() else {
                return;
            };
            let Some(j) = seq.iter().position(|s| s.inst.address() == raddr) else {
                return;
            };
            let rstage = stage_index(proc, rplace);
            let ty = if event.etype() == EventType::After {
                EdgeType::Solid
            } else {
                EdgeType::Slashed
            };
            g.add_edge(grid[j][rstage], target, ty, event.cost() as u32);
        }
    }
}

/// Computes every (prefix, block) unit of the collection.
pub fn build_times(
    coll: &CfgCollection,
    proc: &Processor,
    events: &EventMap,
    config: &TimingConfig,
) -> TimeUnits {
    let builder = ExeGraphBuilder::new(proc);
    let commit = proc.commit_stage();
    let mut units = Vec::new();
    let mut block_time: AHashMap<BlockRef, u64> = AHashMap::new();
    let mut solo: AHashMap<BlockRef, u64> = AHashMap::new();

    for (r, cfg) in coll.iter() {
        for n in cfg.basic_blocks() {
            let at = (r, n);

            // standalone time: the block alone, static events applied
            {
                let seq: Vec<SeqInst> = cfg
                    .block(n)
                    .insts()
                    .iter()
                    .map(|i| SeqInst {
                        inst: i.clone(),
                        part: CodePart::Body,
                    })
                    .collect();
                let (mut g, grid) = builder.build(&seq);
                for ev in events.of(at) {
                    if ev.occurrence() == Occurrence::Always {
                        apply_event(&mut g, &grid, &seq, proc, ev.as_ref(), CodePart::Body);
                    }
                }
                solver::solve(&mut g);
                solo.insert(at, solver::sequence_time(&g, commit));
            }
            for e in cfg.in_edges(n) {
                let (p, _) = cfg.endpoints(e);
                let prefix_at = (r, p);
                let prefix_is_basic = cfg.block(p).is_basic();

                // sequence: prologue (if the predecessor is a basic
                // block) followed by the analyzed block
                let mut seq: Vec<SeqInst> = Vec::new();
                if prefix_is_basic {
                    seq.extend(cfg.block(p).insts().iter().map(|i| SeqInst {
                        inst: i.clone(),
                        part: CodePart::Prologue,
                    }));
                }
                seq.extend(cfg.block(n).insts().iter().map(|i| SeqInst {
                    inst: i.clone(),
                    part: CodePart::Body,
                }));

                // events of both parts, with their part tags
                let mut applicable: Vec<(EventRc, CodePart)> = Vec::new();
                if prefix_is_basic {
                    for ev in events.of(prefix_at) {
                        applicable.push((ev.clone(), CodePart::Prologue));
                    }
                }
                for ev in events.of(at) {
                    applicable.push((ev.clone(), CodePart::Body));
                }

                // split: always events and folded low-weight sometimes
                // events go into the base; the rest is enumerated
                let mut always: Vec<(EventRc, CodePart)> = Vec::new();
                let mut sometimes: Vec<(EventRc, CodePart)> = Vec::new();
                for (ev, part) in applicable {
                    match ev.occurrence() {
                        Occurrence::Always => always.push((ev, part)),
                        Occurrence::Sometimes => sometimes.push((ev, part)),
                        Occurrence::Never => {}
                    }
                }
                sometimes.sort_by_key(|(ev, _)| std::cmp::Reverse(ev.weight()));
                let enumerated: Vec<(EventRc, CodePart)> = if sometimes.len() > config.threshold {
                    let folded = sometimes.split_off(config.threshold);
                    tracing::debug!(
                        folded = folded.len(),
                        "event threshold reached, folding low-weight events"
                    );
                    always.extend(folded);
                    sometimes
                } else {
                    sometimes
                };

                // template with the static events applied
                let (mut template, grid) = builder.build(&seq);
                for (ev, part) in &always {
                    apply_event(&mut template, &grid, &seq, proc, ev.as_ref(), *part);
                }

                // enumerate configurations
                let k = enumerated.len() as u32;
                let mut table = Vec::with_capacity(1usize << k);
                let mut lts = 0;
                let mut hts = 0;
                for mask in 0u32..(1u32 << k) {
                    let mut g = template.clone();
                    for (bit, (ev, part)) in enumerated.iter().enumerate() {
                        if mask & (1 << bit) != 0 {
                            apply_event(&mut g, &grid, &seq, proc, ev.as_ref(), *part);
                        }
                    }
                    solver::solve(&mut g);
                    let t = solver::sequence_time(&g, commit);
                    if mask == 0 {
                        lts = t;
                    }
                    hts = hts.max(t);
                    table.push((mask, t));
                }

                let entry = block_time.entry(at).or_insert(0);
                *entry = (*entry).max(hts);

                units.push(TimeUnit {
                    cfg: r,
                    edge: e,
                    block: at,
                    lts,
                    hts,
                    events: enumerated.into_iter().map(|(ev, _)| ev).collect(),
                    table,
                });
            }
        }
    }

    tracing::debug!(units = units.len(), "edge timing done");
    TimeUnits {
        units,
        block_time,
        solo,
    }
}
