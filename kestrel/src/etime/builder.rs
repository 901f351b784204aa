//! Standard event builder.
//!
//! Walks every basic block and emits the events implied by the hardware
//! model and the classification results: fetch events per L-block (or per
//! instruction without a cache), data-access and purge events per memory
//! instruction, and branch-prediction events per conditional branch.
//! Requires the cache and branch categorizations to have run.

use super::{EstimateCtx, Event, EventKind, EventMap, EventRc, Occurrence, StagePoint};
use crate::branch::{BranchCategories, BranchCategory};
use crate::cache::{CacheCategories, Category};
use crate::cfg::{BlockRef, CfgCollection};
use crate::hard::Platform;
use crate::prog::Address;
use std::rc::Rc;

/// Instruction fetch stall.
struct FetchEvent {
    at: BlockRef,
    inst: Address,
    cost: u64,
    occurrence: Occurrence,
    category: Option<Category>,
    weight: u32,
}

impl Event for FetchEvent {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn detail(&self) -> String {
        match self.category {
            Some(cat) => format!("fetch {:?} @ {:#x}", cat, self.inst),
            None => format!("fetch stall @ {:#x}", self.inst),
        }
    }

    fn kind(&self) -> EventKind {
        EventKind::Fetch
    }

    fn inst(&self) -> Address {
        self.inst
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    fn occurrence(&self) -> Occurrence {
        self.occurrence
    }

    fn place(&self) -> StagePoint {
        StagePoint::Fetch
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn is_estimating(&self, on: bool) -> bool {
        on && !matches!(self.category, Some(Category::NotClassified) | None)
    }

    fn estimate(&self, ctx: &mut EstimateCtx<'_>, on: bool) {
        if !on {
            return;
        }
        match self.category {
            Some(Category::FirstMiss { header }) => ctx.add_loop_entries(header),
            Some(Category::FirstUnknown) => ctx.add_const(1.0),
            Some(Category::AlwaysMiss) | Some(Category::NotClassified) | None => {
                ctx.add_block_count(self.at)
            }
            Some(Category::AlwaysHit) => {}
        }
    }
}

/// Data access stall (load or store).
struct MemEvent {
    at: BlockRef,
    inst: Address,
    cost: u64,
    occurrence: Occurrence,
    store: bool,
}

impl Event for MemEvent {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn detail(&self) -> String {
        let dir = if self.store { "store" } else { "load" };
        format!("{} @ {:#x}", dir, self.inst)
    }

    fn kind(&self) -> EventKind {
        EventKind::Mem
    }

    fn inst(&self) -> Address {
        self.inst
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    fn occurrence(&self) -> Occurrence {
        self.occurrence
    }

    fn place(&self) -> StagePoint {
        StagePoint::Exec
    }

    fn weight(&self) -> u32 {
        2
    }

    fn is_estimating(&self, on: bool) -> bool {
        on
    }

    fn estimate(&self, ctx: &mut EstimateCtx<'_>, on: bool) {
        if on {
            ctx.add_block_count(self.at);
        }
    }
}

/// Dirty-line eviction on a write-back bank.
struct PurgeEvent {
    at: BlockRef,
    inst: Address,
    cost: u64,
}

impl Event for PurgeEvent {
    fn name(&self) -> &'static str {
        "purge"
    }

    fn detail(&self) -> String {
        format!("write-back purge @ {:#x}", self.inst)
    }

    fn kind(&self) -> EventKind {
        EventKind::Mem
    }

    fn inst(&self) -> Address {
        self.inst
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    fn occurrence(&self) -> Occurrence {
        Occurrence::Sometimes
    }

    fn place(&self) -> StagePoint {
        StagePoint::Exec
    }

    fn weight(&self) -> u32 {
        1
    }

    fn is_estimating(&self, on: bool) -> bool {
        on
    }

    fn estimate(&self, ctx: &mut EstimateCtx<'_>, on: bool) {
        if on {
            ctx.add_block_count(self.at);
        }
    }
}

/// Misprediction of one conditional branch, consumed by the ILP generator
/// (the penalty binds to dedicated per-edge variables, not to time units).
pub struct BranchEvent {
    pub at: BlockRef,
    pub inst: Address,
    pub penalty: u64,
    pub category: BranchCategory,
    pub predicts_taken: bool,
}

/// Builder output: per-block time-unit events plus the branch events.
pub struct EventMaps {
    pub units: EventMap,
    pub branches: Vec<BranchEvent>,
}

/// Emits all events for the collection.
pub fn build_events(
    coll: &CfgCollection,
    platform: &Platform,
    cache_cats: Option<&CacheCategories>,
    branch_cats: &BranchCategories,
) -> EventMaps {
    let mut units = EventMap::default();
    let mut branches = Vec::new();
    let mem = &platform.memory;

    for (r, cfg) in coll.iter() {
        for n in cfg.basic_blocks() {
            let at = (r, n);

            // fetch events
            match cache_cats {
                Some(cats) => {
                    for ac in cats.of(at) {
                        let (occurrence, weight) = match ac.category {
                            Category::AlwaysHit => continue,
                            Category::AlwaysMiss => (Occurrence::Always, 4),
                            Category::FirstMiss { .. } | Category::FirstUnknown => {
                                (Occurrence::Sometimes, 1)
                            }
                            Category::NotClassified => (Occurrence::Sometimes, 3),
                        };
                        // the stall lands on the first instruction the
                        // line covers inside this block
                        let inst = cfg
                            .block(n)
                            .insts()
                            .iter()
                            .find(|i| {
                                !i.kind().is_annulled()
                                    && platform
                                        .caches
                                        .as_ref()
                                        .and_then(|c| c.icache.as_ref())
                                        .map(|c| c.block_of(i.address()) << c.block_bits)
                                        == Some(ac.lblock.address)
                            })
                            .map(|i| i.address())
                            .unwrap_or(ac.lblock.address);
                        units.push(
                            at,
                            Rc::new(FetchEvent {
                                at,
                                inst,
                                cost: mem.read_latency(ac.lblock.address) as u64,
                                occurrence,
                                category: Some(ac.category),
                                weight,
                            }) as EventRc,
                        );
                    }
                }
                None => {
                    // no instruction cache: every fetch pays the memory
                    // latency beyond the pipelined cycle
                    for inst in cfg.block(n).insts() {
                        if inst.kind().is_annulled() {
                            continue;
                        }
                        let extra = mem.read_latency(inst.address()).saturating_sub(1) as u64;
                        if extra > 0 {
                            units.push(
                                at,
                                Rc::new(FetchEvent {
                                    at,
                                    inst: inst.address(),
                                    cost: extra,
                                    occurrence: Occurrence::Always,
                                    category: None,
                                    weight: 4,
                                }) as EventRc,
                            );
                        }
                    }
                }
            }

            // data access events: without an address analysis the data
            // cache answer is not-classified, so the full latency bounds
            // every access
            for inst in cfg.block(n).insts() {
                let kind = inst.kind();
                if kind.is_annulled() || !kind.is_mem() {
                    continue;
                }
                let store = kind.is_store();
                let has_dcache = platform
                    .caches
                    .as_ref()
                    .map(|c| c.dcache.is_some())
                    .unwrap_or(false);
                let lat = if store {
                    mem.write_latency(inst.address())
                } else {
                    mem.read_latency(inst.address())
                };
                let (cost, occurrence) = if has_dcache {
                    (lat as u64, Occurrence::Sometimes)
                } else {
                    (lat.saturating_sub(1) as u64, Occurrence::Always)
                };
                if cost > 0 {
                    units.push(
                        at,
                        Rc::new(MemEvent {
                            at,
                            inst: inst.address(),
                            cost,
                            occurrence,
                            store,
                        }) as EventRc,
                    );
                }
                // dirty-line purge on write-back data caches
                if store && has_dcache {
                    let wb = platform
                        .caches
                        .as_ref()
                        .and_then(|c| c.dcache.as_ref())
                        .map(|c| c.write_back)
                        .unwrap_or(false);
                    if wb {
                        units.push(
                            at,
                            Rc::new(PurgeEvent {
                                at,
                                inst: inst.address(),
                                cost: mem.write_latency(inst.address()) as u64,
                            }) as EventRc,
                        );
                    }
                }
            }

            // branch prediction events
            if let Some(info) = branch_cats.of(at) {
                let penalty = platform.bht.as_ref().map(|b| b.penalty).unwrap_or(2) as u64;
                branches.push(BranchEvent {
                    at,
                    inst: info.address,
                    penalty,
                    category: info.category,
                    predicts_taken: info.predicts_taken,
                });
            }
        }
    }

    EventMaps { units, branches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch;
    use crate::cache::{self, LBlockPartition};
    use crate::cfg::builder::CfgBuilder;
    use crate::cfg::loops::LoopForest;
    use crate::hard::{CacheConfig, CacheHierarchy, Memory};
    use crate::prog::{Inst, InstKind, Process, Segment};

    fn build_coll(insts: Vec<Inst>) -> CfgCollection {
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

    #[test]
    fn test_no_cache_fetch_events() {
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let platform = Platform {
            memory: Memory::flat(3),
            ..Default::default()
        };
        let branch_cats = branch::categorize(&coll, &loops, None, None, None);
        let maps = build_events(&coll, &platform, None, &branch_cats);

        let cfg = coll.entry_cfg();
        let bb = cfg.block_at(0x100).unwrap();
        let events = maps.units.of((coll.entry(), bb));
        // one stall of 2 extra cycles per instruction
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.cost() == 2 && e.occurrence() == Occurrence::Always));
    }

    #[test]
    fn test_cached_fetch_events_follow_categories() {
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let cache = icache();
        let part = LBlockPartition::build(&coll, &cache);
        let states = cache::analyze(&coll, &loops, &part, None).unwrap();
        let cats = cache::categorize(&coll, &loops, &part, &states);

        let platform = Platform {
            memory: Memory::flat(10),
            caches: Some(CacheHierarchy {
                icache: Some(cache),
                dcache: None,
            }),
            ..Default::default()
        };
        let branch_cats = branch::categorize(&coll, &loops, None, None, None);
        let maps = build_events(&coll, &platform, Some(&cats), &branch_cats);

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let events = maps.units.of((coll.entry(), header));
        assert_eq!(events.len(), 1);
        // first-miss: a sometimes event carrying the full miss penalty
        assert_eq!(events[0].occurrence(), Occurrence::Sometimes);
        assert_eq!(events[0].cost(), 10);
        assert!(events[0].is_estimating(true));
    }

    #[test]
    fn test_branch_events_emitted() {
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let platform = Platform::default();
        let branch_cats = branch::categorize(&coll, &loops, None, None, None);
        let maps = build_events(&coll, &platform, None, &branch_cats);

        assert_eq!(maps.branches.len(), 1);
        assert_eq!(maps.branches[0].inst, 0x104);
        assert_eq!(maps.branches[0].category, BranchCategory::StaticTaken);
    }
}
