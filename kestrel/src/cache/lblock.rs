//! L-block partitioning.
//!
//! An L-block is the portion of a basic block contained in one instruction
//! cache line. Every distinct cache line touched by the program gets one
//! index in the conflict set of its row; the abstract cache states are
//! vectors over these indices.

use crate::cfg::{BlockRef, CfgCollection};
use crate::hard::CacheConfig;
use crate::prog::Address;
use ahash::AHashMap;

/// One line access inside a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LBlock {
    /// Row of the cache the line maps to.
    pub row: usize,
    /// Index of the line in the row's conflict set.
    pub set_index: usize,
    /// Line-aligned address.
    pub address: Address,
    /// Number of instructions of the block covered by this line.
    pub inst_count: usize,
}

/// Conflict sets of every row plus the per-block access sequences.
pub struct LBlockPartition {
    cache: CacheConfig,
    /// Distinct cache blocks per row.
    row_sets: Vec<Vec<u64>>,
    /// Line accesses of each basic block, in program order.
    per_block: AHashMap<BlockRef, Vec<LBlock>>,
}

impl LBlockPartition {
    pub fn build(coll: &CfgCollection, cache: &CacheConfig) -> Self {
        let mut row_sets: Vec<Vec<u64>> = vec![Vec::new(); cache.rows()];
        let mut index: AHashMap<u64, usize> = AHashMap::new();
        let mut per_block = AHashMap::new();

        for (r, cfg) in coll.iter() {
            for n in cfg.basic_blocks() {
                let mut accesses: Vec<LBlock> = Vec::new();
                for inst in cfg.block(n).insts() {
                    if inst.kind().is_annulled() {
                        // annulled slots fetch nothing
                        continue;
                    }
                    let line = cache.block_of(inst.address());
                    if let Some(last) = accesses.last_mut() {
                        if cache.block_of(last.address) == line {
                            last.inst_count += 1;
                            continue;
                        }
                    }
                    let row = cache.row_of(inst.address());
                    let set_index = *index.entry(line).or_insert_with(|| {
                        row_sets[row].push(line);
                        row_sets[row].len() - 1
                    });
                    accesses.push(LBlock {
                        row,
                        set_index,
                        address: line << cache.block_bits,
                        inst_count: 1,
                    });
                }
                per_block.insert((r, n), accesses);
            }
        }

        Self {
            cache: cache.clone(),
            row_sets,
            per_block,
        }
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn rows(&self) -> usize {
        self.row_sets.len()
    }

    /// Size of the conflict set of one row.
    pub fn row_size(&self, row: usize) -> usize {
        self.row_sets[row].len()
    }

    /// Line accesses of a basic block, program order.
    pub fn accesses(&self, at: BlockRef) -> &[LBlock] {
        self.per_block.get(&at).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Rows actually touched by the program.
    pub fn live_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.row_sets.len()).filter(|&r| !self.row_sets[r].is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::prog::{Inst, InstKind, Process, Segment};

    fn icache() -> CacheConfig {
        CacheConfig {
            block_bits: 4, // 16-byte lines: 4 instructions
            row_bits: 2,
            associativity: 1,
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
                data: vec![0; 256],
                executable: true,
            })
            .insts(insts)
            .build();
        CfgBuilder::new(&proc).build(0x100).unwrap()
    }

    #[test]
    fn test_one_line_block() {
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::ALU),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let part = LBlockPartition::build(&coll, &icache());

        let cfg = coll.entry_cfg();
        let bb = cfg.basic_blocks().next().unwrap();
        let acc = part.accesses((coll.entry(), bb));
        assert_eq!(acc.len(), 1);
        assert_eq!(acc[0].inst_count, 3);
        assert_eq!(acc[0].address, 0x100);
    }

    #[test]
    fn test_line_straddle() {
        let coll = build(vec![
            Inst::new(0x108, 4, InstKind::ALU),
            Inst::new(0x10c, 4, InstKind::ALU),
            Inst::new(0x110, 4, InstKind::ALU), // next line
            Inst::new(0x114, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let part = LBlockPartition::build(&coll, &icache());

        let cfg = coll.entry_cfg();
        let bb = cfg.basic_blocks().next().unwrap();
        let acc = part.accesses((coll.entry(), bb));
        assert_eq!(acc.len(), 2);
        assert_eq!(acc[0].address, 0x100);
        assert_eq!(acc[1].address, 0x110);
        // consecutive lines land in consecutive rows
        assert_ne!(acc[0].row, acc[1].row);
    }

    #[test]
    fn test_conflict_set_shared_across_blocks() {
        // loop: both blocks touch line 0x100
        let coll = build(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let part = LBlockPartition::build(&coll, &icache());

        // the line appears once in its row's conflict set
        let row = icache().row_of(0x100);
        assert_eq!(part.row_size(row), 1);
    }
}
