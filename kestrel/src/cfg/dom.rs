//! Dominance information over one CFG.

use super::Cfg;
use petgraph::algo::dominators::{simple_fast, Dominators};
use petgraph::graph::{EdgeIndex, NodeIndex};

/// Dominator tree computed once per CFG with the standard iterative
/// algorithm.
pub struct Dominance {
    doms: Dominators<NodeIndex>,
}

impl Dominance {
    pub fn compute(cfg: &Cfg) -> Self {
        Self {
            doms: simple_fast(&cfg.graph, cfg.entry()),
        }
    }

    /// Immediate dominator of `n`, `None` for the entry or unreachable
    /// blocks.
    pub fn idom(&self, n: NodeIndex) -> Option<NodeIndex> {
        self.doms.immediate_dominator(n)
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if a == b {
            return true;
        }
        match self.doms.dominators(b) {
            Some(mut iter) => iter.any(|d| d == a),
            None => false,
        }
    }

    /// Back edge in the dominance sense: the target dominates the source.
    pub fn is_back_edge(&self, cfg: &Cfg, e: EdgeIndex) -> bool {
        let (src, dst) = cfg.endpoints(e);
        self.dominates(dst, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Block, EdgeKind};
    use crate::prog::{Inst, InstKind};

    fn inst(addr: u64) -> Inst {
        Inst::new(addr, 4, InstKind::ALU)
    }

    #[test]
    fn test_diamond_dominance() {
        let mut cfg = Cfg::new("f", 0);
        let a = cfg.add_block(Block::basic(vec![inst(0x0)]));
        let b = cfg.add_block(Block::basic(vec![inst(0x10)]));
        let c = cfg.add_block(Block::basic(vec![inst(0x20)]));
        let d = cfg.add_block(Block::basic(vec![inst(0x30)]));
        cfg.add_edge(cfg.entry(), a, EdgeKind::Virtual);
        cfg.add_edge(a, b, EdgeKind::Taken);
        cfg.add_edge(a, c, EdgeKind::NotTaken);
        cfg.add_edge(b, d, EdgeKind::NotTaken);
        cfg.add_edge(c, d, EdgeKind::NotTaken);
        cfg.add_edge(d, cfg.exit(), EdgeKind::Virtual);

        let dom = Dominance::compute(&cfg);
        assert!(dom.dominates(a, d));
        assert!(!dom.dominates(b, d));
        assert_eq!(dom.idom(d), Some(a));
    }

    #[test]
    fn test_self_loop_back_edge() {
        let mut cfg = Cfg::new("f", 0);
        let a = cfg.add_block(Block::basic(vec![inst(0x0)]));
        cfg.add_edge(cfg.entry(), a, EdgeKind::Virtual);
        let back = cfg.add_edge(a, a, EdgeKind::Taken);
        cfg.add_edge(a, cfg.exit(), EdgeKind::NotTaken);

        let dom = Dominance::compute(&cfg);
        assert!(dom.is_back_edge(&cfg, back));
    }
}
