//! Per-row BHT occupancy analysis.

use crate::cache::Acs;
use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, Cfg, CfgCollection};
use crate::dfa::{ContextKind, FixPoint, HalfAbsInt};
use crate::error::Result;
use crate::hard::Bht;
use crate::prog::Address;
use ahash::AHashMap;
use petgraph::graph::NodeIndex;
use std::sync::atomic::AtomicBool;

/// Conflict sets of the BHT rows: one slot per conditional branch mapping
/// to the row.
pub struct BranchPartition {
    bht: Bht,
    row_sets: Vec<Vec<Address>>,
    /// Conditional branch of each block, if any: (row, slot, address).
    per_block: AHashMap<BlockRef, (usize, usize, Address)>,
}

impl BranchPartition {
    pub fn build(coll: &CfgCollection, bht: &Bht) -> Self {
        let mut row_sets: Vec<Vec<Address>> = vec![Vec::new(); bht.rows()];
        let mut index: AHashMap<Address, usize> = AHashMap::new();
        let mut per_block = AHashMap::new();

        for (r, cfg) in coll.iter() {
            for n in cfg.basic_blocks() {
                let Some(last) = cfg.block(n).last_inst() else {
                    continue;
                };
                let kind = last.kind();
                if !(kind.is_branch() && kind.is_cond()) {
                    continue;
                }
                let addr = last.address();
                let row = bht.row_of(addr);
                let slot = *index.entry(addr).or_insert_with(|| {
                    row_sets[row].push(addr);
                    row_sets[row].len() - 1
                });
                per_block.insert((r, n), (row, slot, addr));
            }
        }

        Self {
            bht: bht.clone(),
            row_sets,
            per_block,
        }
    }

    pub fn bht(&self) -> &Bht {
        &self.bht
    }

    pub fn row_size(&self, row: usize) -> usize {
        self.row_sets[row].len()
    }

    pub fn branch_of(&self, at: BlockRef) -> Option<(usize, usize, Address)> {
        self.per_block.get(&at).copied()
    }

    pub fn live_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.row_sets.len()).filter(|&r| !self.row_sets[r].is_empty())
    }
}

/// Fixpoint problem of one BHT row; the composite domain ages entries the
/// way the cache rows age lines.
pub struct BranchRowProblem<'a> {
    row: usize,
    size: usize,
    ways: usize,
    part: &'a BranchPartition,
    pub inputs: AHashMap<BlockRef, Acs>,
}

impl<'a> BranchRowProblem<'a> {
    pub fn new(row: usize, part: &'a BranchPartition) -> Self {
        Self {
            row,
            size: part.row_size(row),
            ways: part.bht().ways,
            part,
            inputs: AHashMap::new(),
        }
    }
}

impl<'a> FixPoint for BranchRowProblem<'a> {
    type Domain = Acs;

    fn bottom(&self) -> Acs {
        Acs::bottom(self.size, self.ways)
    }

    fn top(&self) -> Acs {
        Acs::top(self.size, self.ways)
    }

    fn entry(&self) -> Acs {
        Acs::top(self.size, self.ways)
    }

    fn lub(&self, a: &mut Acs, b: &Acs) {
        a.lub(b);
    }

    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }

    fn update(&mut self, at: BlockRef, _cfg: &Cfg, input: &Acs) -> Acs {
        let mut out = input.clone();
        if let Some((row, slot, _)) = self.part.branch_of(at) {
            if row == self.row {
                out.inject(slot);
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
        // join across call contexts, as in the cache problems
        match self.inputs.get_mut(&at) {
            Some(acc) => acc.lub(input),
            None => {
                self.inputs.insert(at, input.clone());
            }
        }
    }
}

pub struct BranchStates {
    pub rows: Vec<AHashMap<BlockRef, Acs>>,
}

impl BranchStates {
    pub fn input(&self, row: usize, at: BlockRef) -> Option<&Acs> {
        self.rows.get(row).and_then(|m| m.get(&at))
    }
}

pub fn analyze(
    coll: &CfgCollection,
    loops: &LoopForest,
    part: &BranchPartition,
    cancel: Option<&AtomicBool>,
) -> Result<BranchStates> {
    let mut rows: Vec<AHashMap<BlockRef, Acs>> =
        (0..part.bht().rows()).map(|_| AHashMap::new()).collect();

    for row in part.live_rows() {
        let mut problem = BranchRowProblem::new(row, part);
        {
            let mut engine = HalfAbsInt::new(&mut problem, coll, loops);
            if let Some(flag) = cancel {
                engine = engine.with_cancel(flag);
            }
            let iterations = engine.solve(None)?;
            tracing::debug!(row, iterations, "BHT row stabilized");
        }
        rows[row] = problem.inputs;
    }

    Ok(BranchStates { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::hard::bht::DefaultPrediction;
    use crate::prog::{Inst, InstKind, Process, Segment};

    fn bht() -> Bht {
        Bht {
            row_bits: 2,
            ways: 1,
            penalty: 2,
            default_prediction: DefaultPrediction::NotTaken,
        }
    }

    fn build(insts: Vec<Inst>) -> CfgCollection {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(Segment {
                name: ".text".into(),
                base: 0x100,
                data: vec![0; 256],
                executable: true,
            })
            .insts(insts)
            .build();
        CfgBuilder::new(&proc).build(0x100).unwrap()
    }

    #[test]
    fn test_partition_collects_cond_branches() {
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let part = BranchPartition::build(&coll, &bht());

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let (row, slot, addr) = part.branch_of((coll.entry(), header)).unwrap();
        assert_eq!(addr, 0x104);
        assert_eq!(part.row_size(row), 1);
        assert_eq!(slot, 0);
        // the return is not a conditional branch
        let tail = cfg.block_at(0x108).unwrap();
        assert!(part.branch_of((coll.entry(), tail)).is_none());
    }

    #[test]
    fn test_loop_branch_entry_becomes_live() {
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let part = BranchPartition::build(&coll, &bht());
        let states = analyze(&coll, &loops, &part, None).unwrap();

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let (row, slot, _) = part.branch_of((coll.entry(), header)).unwrap();
        let acs = states.input(row, (coll.entry(), header)).unwrap();

        // entry persists within the loop once warmed
        assert!(acs.pers.is_persistent(slot, acs.pers.depth() - 1));
        // but the cold entry path keeps MUST from guaranteeing it
        assert!(!acs.must.contains(slot));
    }
}
