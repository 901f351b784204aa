//! Cache category decision.
//!
//! Maps the stabilized abstract states onto one category per L-block
//! access: always-hit when MUST guarantees presence, always-miss when MAY
//! rules it out, first-miss at the outermost loop level where PERSISTENCE
//! holds, first-unknown when only the whole-scope item is persistent (at
//! most one miss, at an unknown iteration), not-classified otherwise.

use super::acs::Acs;
use super::analysis::CacheStates;
use super::lblock::{LBlock, LBlockPartition};
use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, CfgCollection};
use ahash::AHashMap;

/// Category of one fetched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    AlwaysHit,
    AlwaysMiss,
    /// One miss per entry of the loop headed by the given block.
    FirstMiss { header: BlockRef },
    /// At most one miss over the whole run, iteration unknown.
    FirstUnknown,
    NotClassified,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessCategory {
    pub lblock: LBlock,
    pub category: Category,
}

/// Per-block access categories for the instruction cache.
pub struct CacheCategories {
    pub map: AHashMap<BlockRef, Vec<AccessCategory>>,
}

impl CacheCategories {
    pub fn of(&self, at: BlockRef) -> &[AccessCategory] {
        self.map.get(&at).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// (hits, misses, first-miss, unknown) counters for reporting.
    pub fn summary(&self) -> (usize, usize, usize, usize) {
        let mut hit = 0;
        let mut miss = 0;
        let mut first = 0;
        let mut other = 0;
        for cats in self.map.values() {
            for c in cats {
                match c.category {
                    Category::AlwaysHit => hit += 1,
                    Category::AlwaysMiss => miss += 1,
                    Category::FirstMiss { .. } | Category::FirstUnknown => first += 1,
                    Category::NotClassified => other += 1,
                }
            }
        }
        (hit, miss, first, other)
    }
}

/// Chain of loop headers enclosing a block, innermost first.
fn enclosing_headers(loops: &LoopForest, at: BlockRef) -> Vec<BlockRef> {
    let (r, n) = at;
    let info = loops.get(r);
    let mut out = Vec::new();
    let mut cur = info.loop_of(n);
    while let Some(h) = cur {
        out.push((r, h));
        cur = info.immediate_loop(h);
    }
    out
}

/// Decide the category of one access from the pre-access state.
fn classify(acs: &Acs, lb: &LBlock, enclosing: &[BlockRef]) -> Category {
    if acs.must.contains(lb.set_index) {
        return Category::AlwaysHit;
    }
    if !acs.may.contains(lb.set_index) {
        return Category::AlwaysMiss;
    }
    // the persistence stack grows one item per entered loop: the last item
    // is the innermost context; pick the outermost level still persistent
    let depth = acs.pers.depth();
    let levels = depth.min(enclosing.len());
    for i in (0..levels).rev() {
        let item = depth - 1 - i;
        if acs.pers.is_persistent(lb.set_index, item) {
            return Category::FirstMiss {
                header: enclosing[i],
            };
        }
    }
    if !acs.pers.is_bottom() && acs.pers.whole().is_persistent(lb.set_index) {
        return Category::FirstUnknown;
    }
    Category::NotClassified
}

/// Builds the categories for every basic block of the collection.
pub fn build(
    coll: &CfgCollection,
    loops: &LoopForest,
    part: &LBlockPartition,
    states: &CacheStates,
) -> CacheCategories {
    let mut map = AHashMap::new();

    for (r, cfg) in coll.iter() {
        for n in cfg.basic_blocks() {
            let at = (r, n);
            let accesses = part.accesses(at);
            if accesses.is_empty() {
                continue;
            }
            let enclosing = enclosing_headers(loops, at);

            // interleave the rows while walking the block accesses
            let mut working: AHashMap<usize, Acs> = AHashMap::new();
            let mut cats = Vec::with_capacity(accesses.len());
            for lb in accesses {
                let acs = working.entry(lb.row).or_insert_with(|| {
                    states
                        .input(lb.row, at)
                        .cloned()
                        .unwrap_or_else(|| Acs::top(part.row_size(lb.row), part.cache().associativity))
                });
                let category = classify(acs, lb, &enclosing);
                acs.inject(lb.set_index);
                cats.push(AccessCategory {
                    lblock: *lb,
                    category,
                });
            }
            map.insert(at, cats);
        }
    }

    CacheCategories { map }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::analysis;
    use crate::cfg::builder::CfgBuilder;
    use crate::hard::CacheConfig;
    use crate::prog::{Inst, InstKind, Process, Segment};

    fn icache() -> CacheConfig {
        CacheConfig {
            block_bits: 4,
            row_bits: 2,
            associativity: 1,
            replacement: crate::hard::ReplacementPolicy::Lru,
            hit_latency: 0,
            write_back: false,
        }
    }

    fn build_coll(insts: Vec<Inst>) -> CfgCollection {
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

    fn categorize(coll: &CfgCollection, cache: &CacheConfig) -> CacheCategories {
        let loops = LoopForest::compute(coll);
        let part = LBlockPartition::build(coll, cache);
        let states = analysis::analyze(coll, &loops, &part, None).unwrap();
        build(coll, &loops, &part, &states)
    }

    #[test]
    fn test_loop_line_first_miss() {
        // loop body fits one cache line: one miss for the whole loop
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let cats = categorize(&coll, &icache());

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let got = cats.of((coll.entry(), header));
        assert_eq!(got.len(), 1);
        match got[0].category {
            Category::FirstMiss { header: (r, h) } => {
                assert_eq!(r, coll.entry());
                assert_eq!(h, header);
            }
            other => panic!("expected first-miss, got {:?}", other),
        }
    }

    #[test]
    fn test_straight_line_second_access_hits() {
        // two blocks on the same line: the second fetch always hits
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x10c),
            Inst::new(0x108, 4, InstKind::ALU),
            Inst::new(0x10c, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let cats = categorize(&coll, &icache());

        let cfg = coll.entry_cfg();
        let join = cfg.block_at(0x10c).unwrap();
        let got = cats.of((coll.entry(), join));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].category, Category::AlwaysHit);
    }

    #[test]
    fn test_cold_single_access_not_hit() {
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let cats = categorize(&coll, &icache());

        let cfg = coll.entry_cfg();
        let bb = cfg.block_at(0x100).unwrap();
        let got = cats.of((coll.entry(), bb));
        assert_eq!(got.len(), 1);
        // the entry cache is unknown: never a guaranteed hit, and MAY
        // cannot rule the line out either after the unknown start
        assert_ne!(got[0].category, Category::AlwaysHit);
    }

    #[test]
    fn test_nested_loop_outer_persistence() {
        // outer header A at 0x100, inner loop B at 0x110, outer latch C at
        // 0x118; no line conflicts, so the inner body line is persistent
        // at the outer level: one miss for the whole nest
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::ALU),
            Inst::new(0x108, 4, InstKind::ALU),
            Inst::new(0x10c, 4, InstKind::ALU),
            Inst::new(0x110, 4, InstKind::ALU),
            Inst::new(0x114, 4, InstKind::CONTROL | InstKind::COND).with_target(0x110),
            Inst::new(0x118, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x11c, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let cats = categorize(&coll, &icache());

        let cfg = coll.entry_cfg();
        let outer = cfg.block_at(0x100).unwrap();
        let inner = cfg.block_at(0x110).unwrap();
        let got = cats.of((coll.entry(), inner));
        match got[0].category {
            Category::FirstMiss { header: (_, h) } => {
                assert_eq!(h, outer, "persistence should name the outer level");
            }
            other => panic!("expected first-miss, got {:?}", other),
        }
    }
}
