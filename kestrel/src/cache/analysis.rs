//! Per-row cache analysis under the fixpoint engine.
//!
//! Each cache row is analyzed independently: the transfer function scans
//! the L-block accesses of the block in program order and injects the
//! accessed line into the composite MUST/MAY/PERSISTENCE state. Loop
//! context hooks push and pop persistence items.

use super::acs::Acs;
use super::lblock::LBlockPartition;
use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, Cfg, CfgCollection};
use crate::dfa::{ContextKind, FixPoint, HalfAbsInt};
use crate::error::Result;
use ahash::AHashMap;
use petgraph::graph::NodeIndex;
use std::sync::atomic::AtomicBool;

/// Fixpoint problem of one row.
pub struct RowProblem<'a> {
    row: usize,
    size: usize,
    assoc: usize,
    part: &'a LBlockPartition,
    /// Input state of each basic block at stabilization.
    pub inputs: AHashMap<BlockRef, Acs>,
}

impl<'a> RowProblem<'a> {
    pub fn new(row: usize, part: &'a LBlockPartition) -> Self {
        Self {
            row,
            size: part.row_size(row),
            assoc: part.cache().associativity,
            part,
            inputs: AHashMap::new(),
        }
    }
}

impl<'a> FixPoint for RowProblem<'a> {
    type Domain = Acs;

    fn bottom(&self) -> Acs {
        Acs::bottom(self.size, self.assoc)
    }

    fn top(&self) -> Acs {
        Acs::top(self.size, self.assoc)
    }

    fn entry(&self) -> Acs {
        // the cache content is unknown when the task starts
        Acs::top(self.size, self.assoc)
    }

    fn lub(&self, a: &mut Acs, b: &Acs) {
        a.lub(b);
    }

    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }

    fn update(&mut self, at: BlockRef, _cfg: &Cfg, input: &Acs) -> Acs {
        let mut out = input.clone();
        for lb in self.part.accesses(at) {
            if lb.row == self.row {
                out.inject(lb.set_index);
            }
        }
        out
    }

    fn enter_context(&mut self, dom: &mut Acs, _header: NodeIndex, kind: ContextKind) {
        if kind == ContextKind::Loop {
            dom.enter_context();
        }
    }

    fn leave_context(&mut self, dom: &mut Acs, _header: NodeIndex, kind: ContextKind) {
        if kind == ContextKind::Loop {
            dom.leave_context();
        }
    }

    fn block_done(&mut self, at: BlockRef, input: &Acs, _out: &Acs) {
        // a block traversed under several call contexts keeps the join of
        // every input it was evaluated with
        match self.inputs.get_mut(&at) {
            Some(acc) => acc.lub(input),
            None => {
                self.inputs.insert(at, input.clone());
            }
        }
    }
}

/// Stabilized input states of every live row.
pub struct CacheStates {
    /// `rows[row]` maps basic blocks to their input ACS.
    pub rows: Vec<AHashMap<BlockRef, Acs>>,
}

impl CacheStates {
    pub fn input(&self, row: usize, at: BlockRef) -> Option<&Acs> {
        self.rows.get(row).and_then(|m| m.get(&at))
    }
}

/// Runs MUST/MAY/PERSISTENCE per live row over the whole collection.
pub fn analyze(
    coll: &CfgCollection,
    loops: &LoopForest,
    part: &LBlockPartition,
    cancel: Option<&AtomicBool>,
) -> Result<CacheStates> {
    let mut rows: Vec<AHashMap<BlockRef, Acs>> = (0..part.rows()).map(|_| AHashMap::new()).collect();

    for row in part.live_rows() {
        let mut problem = RowProblem::new(row, part);
        {
            let mut engine = HalfAbsInt::new(&mut problem, coll, loops);
            if let Some(flag) = cancel {
                engine = engine.with_cancel(flag);
            }
            let iterations = engine.solve(None)?;
            tracing::debug!(row, iterations, "cache row stabilized");
        }
        rows[row] = problem.inputs;
    }

    Ok(CacheStates { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::hard::CacheConfig;
    use crate::prog::{Inst, InstKind, Process, Segment};

    fn icache(assoc: usize) -> CacheConfig {
        CacheConfig {
            block_bits: 4,
            row_bits: 2,
            associativity: assoc,
            replacement: crate::hard::ReplacementPolicy::Lru,
            hit_latency: 0,
            write_back: false,
        }
    }

    fn build(insts: Vec<Inst>) -> CfgCollection {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(Segment {
                name: ".text".into(),
                base: 0x100,
                data: vec![0; 512],
                executable: true,
            })
            .insts(insts)
            .build();
        CfgBuilder::new(&proc).build(0x100).unwrap()
    }

    #[test]
    fn test_loop_body_guaranteed_after_first_iteration() {
        // single-block loop fitting one line
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let cache = icache(1);
        let part = LBlockPartition::build(&coll, &cache);
        let states = analyze(&coll, &loops, &part, None).unwrap();

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let row = cache.row_of(0x100);
        let acs = states.input(row, (coll.entry(), header)).unwrap();

        // the loop line is persistent within the loop context
        let line_index = part.accesses((coll.entry(), header))[0].set_index;
        assert!(acs.pers.is_persistent(line_index, acs.pers.depth() - 1));
        // but the header input joins the cold entry path, so MUST cannot
        // guarantee it
        assert!(!acs.must.contains(line_index));
        // MAY knows it can be cached
        assert!(acs.may.contains(line_index));
    }

    #[test]
    fn test_conflicting_lines_evict() {
        // two blocks alternating on the same direct-mapped row:
        // 0x100 and 0x140 share row 0 with 16-byte lines and 4 rows
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x140),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
            Inst::new(0x140, 4, InstKind::ALU),
            Inst::new(0x144, 4, InstKind::CONTROL).with_target(0x100),
        ]);
        let loops = LoopForest::compute(&coll);
        let cache = icache(1);
        let part = LBlockPartition::build(&coll, &cache);
        let states = analyze(&coll, &loops, &part, None).unwrap();

        let cfg = coll.entry_cfg();
        let b100 = cfg.block_at(0x100).unwrap();
        let row = cache.row_of(0x100);
        let acs = states.input(row, (coll.entry(), b100)).unwrap();

        let idx_100 = part.accesses((coll.entry(), b100))[0].set_index;
        // after the 0x140 block ran, line 0x100 is evicted on the back path
        assert!(!acs.must.contains(idx_100));
    }
}
