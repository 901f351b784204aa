//! Branch category decision.

use super::problem::{BranchPartition, BranchStates};
use super::BranchCategory;
use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, CfgCollection, EdgeKind};
use crate::hard::Bht;
use crate::prog::Address;
use ahash::AHashMap;

/// Category plus the facts the event builder needs about one branch.
#[derive(Debug, Clone, Copy)]
pub struct BranchInfo {
    pub category: BranchCategory,
    pub address: Address,
    /// Branch target, used for the static direction heuristics.
    pub target: Option<Address>,
    /// Default prediction direction of the predictor for this branch.
    pub predicts_taken: bool,
}

pub struct BranchCategories {
    pub map: AHashMap<BlockRef, BranchInfo>,
}

impl BranchCategories {
    pub fn of(&self, at: BlockRef) -> Option<&BranchInfo> {
        self.map.get(&at)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Chain of headers enclosing a block, innermost first.
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

/// Classifies every conditional branch of the collection. Without a BHT
/// every branch degrades to the static direction scheme.
pub fn build(
    coll: &CfgCollection,
    loops: &LoopForest,
    bht: Option<&Bht>,
    part: Option<&BranchPartition>,
    states: Option<&BranchStates>,
) -> BranchCategories {
    let mut map = AHashMap::new();

    for (r, cfg) in coll.iter() {
        for n in cfg.basic_blocks() {
            let at = (r, n);
            let Some(last) = cfg.block(n).last_inst() else {
                continue;
            };
            let kind = last.kind();
            if !(kind.is_branch() && kind.is_cond()) {
                continue;
            }
            // a conditional branch with a single successor kind cannot
            // mispredict (degenerate CFG), skip it
            let has_taken = cfg
                .out_edges(n)
                .iter()
                .any(|&e| cfg.edge(e).kind == EdgeKind::Taken);
            let has_not_taken = cfg
                .out_edges(n)
                .iter()
                .any(|&e| cfg.edge(e).kind == EdgeKind::NotTaken);
            if !has_taken || !has_not_taken {
                continue;
            }

            let address = last.address();
            let target = last.target();

            let info = match (bht, part, states) {
                (Some(bht), Some(part), Some(states)) => {
                    let predicts_taken =
                        bht.predicts_taken(address, target.unwrap_or(address + 4));
                    let category = classify(at, part, states, loops);
                    BranchInfo {
                        category,
                        address,
                        target,
                        predicts_taken,
                    }
                }
                _ => {
                    // static scheme: backward taken, forward not taken
                    let backward = target.map(|t| t <= address).unwrap_or(false);
                    BranchInfo {
                        category: if backward {
                            BranchCategory::StaticTaken
                        } else {
                            BranchCategory::StaticNotTaken
                        },
                        address,
                        target,
                        predicts_taken: backward,
                    }
                }
            };
            map.insert(at, info);
        }
    }

    BranchCategories { map }
}

fn classify(
    at: BlockRef,
    part: &BranchPartition,
    states: &BranchStates,
    loops: &LoopForest,
) -> BranchCategory {
    let Some((row, slot, _)) = part.branch_of(at) else {
        return BranchCategory::NotClassified;
    };
    let Some(acs) = states.input(row, at) else {
        return BranchCategory::NotClassified;
    };

    if acs.must.contains(slot) {
        return BranchCategory::AlwaysHistory;
    }
    if !acs.may.contains(slot) {
        return BranchCategory::AlwaysDefault;
    }
    let enclosing = enclosing_headers(loops, at);
    let depth = acs.pers.depth();
    let levels = depth.min(enclosing.len());
    for i in (0..levels).rev() {
        let item = depth - 1 - i;
        if acs.pers.is_persistent(slot, item) {
            return BranchCategory::FirstUnknown {
                header: enclosing[i],
            };
        }
    }
    BranchCategory::NotClassified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::problem;
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

    fn loop_coll() -> CfgCollection {
        build_coll(vec![
            Inst::new(0x100, 4, InstKind::ALU),
            Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ])
    }

    #[test]
    fn test_loop_branch_first_unknown() {
        let coll = loop_coll();
        let loops = LoopForest::compute(&coll);
        let bht = bht();
        let part = BranchPartition::build(&coll, &bht);
        let states = problem::analyze(&coll, &loops, &part, None).unwrap();
        let cats = build(&coll, &loops, Some(&bht), Some(&part), Some(&states));

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let info = cats.of((coll.entry(), header)).unwrap();
        // warmed after the first access, unknown before
        assert!(matches!(info.category, BranchCategory::FirstUnknown { .. }));
        assert_eq!(info.address, 0x104);
    }

    #[test]
    fn test_static_scheme_without_bht() {
        let coll = loop_coll();
        let loops = LoopForest::compute(&coll);
        let cats = build(&coll, &loops, None, None, None);

        let cfg = coll.entry_cfg();
        let header = cfg.block_at(0x100).unwrap();
        let info = cats.of((coll.entry(), header)).unwrap();
        // backward branch: statically predicted taken
        assert_eq!(info.category, BranchCategory::StaticTaken);
        assert!(info.predicts_taken);
    }

    #[test]
    fn test_unconditional_branches_skipped() {
        let coll = build_coll(vec![
            Inst::new(0x100, 4, InstKind::CONTROL).with_target(0x108),
            Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
        ]);
        let loops = LoopForest::compute(&coll);
        let cats = build(&coll, &loops, None, None, None);
        assert!(cats.is_empty());
    }
}
