//! Loop identification.
//!
//! Implements the DFS algorithm of Wei, Mao, Zou and Chen, "A New Algorithm
//! for Identifying Loops in Decompilation" (SAS 2007). It identifies loop
//! headers and the innermost-loop relation in O(|V| + k·|E|), and supports
//! irreducible regions by qualifying secondary entries as re-entries.

use super::{Cfg, CfgRef};
use petgraph::graph::{EdgeIndex, NodeIndex};

#[derive(Debug)]
pub struct LoopInfo {
    header: Vec<bool>,
    reentry: Vec<bool>,
    irreducible: Vec<bool>,
    /// Innermost loop header containing the node (the node's own header is
    /// its enclosing loop when the node itself heads a loop).
    iloop: Vec<Option<NodeIndex>>,
    any_irreducible: bool,
}

struct Dfs<'a> {
    cfg: &'a Cfg,
    info: LoopInfo,
    traversed: Vec<bool>,
    dfsp: Vec<u32>,
}

impl LoopInfo {
    pub fn compute(cfg: &Cfg) -> Self {
        let n = cfg.graph.node_count();
        let mut dfs = Dfs {
            cfg,
            info: LoopInfo {
                header: vec![false; n],
                reentry: vec![false; n],
                irreducible: vec![false; n],
                iloop: vec![None; n],
                any_irreducible: false,
            },
            traversed: vec![false; n],
            dfsp: vec![0; n],
        };
        dfs.run(cfg.entry(), 1);
        dfs.info
    }

    pub fn is_header(&self, v: NodeIndex) -> bool {
        self.header[v.index()]
    }

    pub fn is_reentry(&self, v: NodeIndex) -> bool {
        self.reentry[v.index()]
    }

    pub fn is_irreducible(&self, header: NodeIndex) -> bool {
        self.irreducible[header.index()]
    }

    pub fn has_irreducible(&self) -> bool {
        self.any_irreducible
    }

    /// Immediate loop parent: the innermost header whose loop contains `v`
    /// strictly.
    pub fn immediate_loop(&self, v: NodeIndex) -> Option<NodeIndex> {
        self.iloop[v.index()]
    }

    /// Header of the innermost loop containing `v`; `v` itself when it is
    /// a header.
    pub fn loop_of(&self, v: NodeIndex) -> Option<NodeIndex> {
        if self.is_header(v) {
            Some(v)
        } else {
            self.immediate_loop(v)
        }
    }

    /// Whether `v` belongs to the loop headed by `h` (or a nested one).
    pub fn contains(&self, h: NodeIndex, v: NodeIndex) -> bool {
        if v == h {
            return true;
        }
        let mut cur = self.immediate_loop(v);
        while let Some(head) = cur {
            if head == h {
                return true;
            }
            cur = self.immediate_loop(head);
        }
        false
    }

    /// Loop nesting depth of `v` (0 outside any loop).
    pub fn depth(&self, v: NodeIndex) -> usize {
        let mut d = 0;
        let mut cur = self.loop_of(v);
        while let Some(head) = cur {
            d += 1;
            cur = self.immediate_loop(head);
        }
        d
    }

    pub fn headers(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.header
            .iter()
            .enumerate()
            .filter(|(_, &h)| h)
            .map(|(i, _)| NodeIndex::new(i))
    }

    /// Back edge: sinks into a header of a loop containing the source.
    pub fn is_back(&self, cfg: &Cfg, e: EdgeIndex) -> bool {
        let (src, dst) = cfg.endpoints(e);
        self.is_header(dst) && self.contains(dst, src)
    }

    /// Entry edge of a header: an in-edge that is not a back edge.
    pub fn is_entry(&self, cfg: &Cfg, e: EdgeIndex) -> bool {
        let (_, dst) = cfg.endpoints(e);
        self.is_header(dst) && !self.is_back(cfg, e)
    }

    /// Non-back in-edges of a header.
    pub fn entry_edges(&self, cfg: &Cfg, h: NodeIndex) -> Vec<EdgeIndex> {
        cfg.in_edges(h)
            .into_iter()
            .filter(|&e| !self.is_back(cfg, e))
            .collect()
    }

    pub fn back_edges(&self, cfg: &Cfg, h: NodeIndex) -> Vec<EdgeIndex> {
        cfg.in_edges(h)
            .into_iter()
            .filter(|&e| self.is_back(cfg, e))
            .collect()
    }

    /// Blocks of the loop headed by `h`, header included.
    pub fn members(&self, cfg: &Cfg, h: NodeIndex) -> Vec<NodeIndex> {
        cfg.blocks().filter(|&v| self.contains(h, v)).collect()
    }

    /// Edges leaving the loop headed by `h`.
    pub fn exit_edges(&self, cfg: &Cfg, h: NodeIndex) -> Vec<EdgeIndex> {
        let mut out = Vec::new();
        for v in cfg.blocks() {
            if !self.contains(h, v) {
                continue;
            }
            for e in cfg.out_edges(v) {
                let (_, dst) = cfg.endpoints(e);
                if !self.contains(h, dst) {
                    out.push(e);
                }
            }
        }
        out
    }

    /// Headers of all loops this edge exits, innermost first.
    pub fn exited_headers(&self, cfg: &Cfg, e: EdgeIndex) -> Vec<NodeIndex> {
        let (src, dst) = cfg.endpoints(e);
        let mut out = Vec::new();
        let mut cur = self.loop_of(src);
        while let Some(h) = cur {
            if self.contains(h, dst) {
                break;
            }
            out.push(h);
            cur = self.immediate_loop(h);
        }
        out
    }
}

impl<'a> Dfs<'a> {
    fn run(&mut self, v: NodeIndex, pos: u32) -> Option<NodeIndex> {
        self.traversed[v.index()] = true;
        self.dfsp[v.index()] = pos;

        for w in self.cfg.succs(v) {
            if !self.traversed[w.index()] {
                // case A: new node, recurse along the DFS path
                let nh = self.run(w, pos + 1);
                self.tag_head(w, nh);
            } else if self.dfsp[w.index()] > 0 {
                // case B: w is on the current DFS path, a loop closes here
                self.info.header[w.index()] = true;
                self.tag_head(v, Some(w));
            } else if self.info.iloop[w.index()].is_none() {
                // case C: plain path join, nothing to record
            } else {
                let h = self.info.iloop[w.index()].unwrap();
                if self.dfsp[h.index()] > 0 {
                    // case D: w's loop is on the DFS path, v is inside it
                    self.tag_head(v, Some(h));
                } else {
                    // case E: re-entering a loop from outside its header
                    self.info.reentry[w.index()] = true;
                    self.info.irreducible[h.index()] = true;
                    self.info.any_irreducible = true;
                    let mut h = h;
                    while let Some(ih) = self.info.iloop[h.index()] {
                        h = ih;
                        if self.dfsp[h.index()] > 0 {
                            self.tag_head(v, Some(h));
                            break;
                        }
                        self.info.irreducible[h.index()] = true;
                    }
                }
            }
        }

        self.dfsp[v.index()] = 0;
        self.info.iloop[v.index()]
    }

    fn tag_head(&mut self, v: NodeIndex, h: Option<NodeIndex>) {
        let mut h = match h {
            Some(h) if h != v => h,
            _ => return,
        };
        let mut v = v;
        while let Some(ih) = self.info.iloop[v.index()] {
            if ih == h {
                return;
            }
            if self.dfsp[ih.index()] < self.dfsp[h.index()] {
                // h is nested more deeply on the DFS path than the known
                // parent: insert it in between
                self.info.iloop[v.index()] = Some(h);
                v = h;
                h = ih;
            } else {
                v = ih;
            }
        }
        self.info.iloop[v.index()] = Some(h);
    }
}

/// Loop information for every CFG of a collection, indexed by [`CfgRef`].
pub struct LoopForest {
    per_cfg: Vec<LoopInfo>,
}

impl LoopForest {
    pub fn compute(coll: &super::CfgCollection) -> Self {
        Self {
            per_cfg: coll.iter().map(|(_, cfg)| LoopInfo::compute(cfg)).collect(),
        }
    }

    pub fn get(&self, r: CfgRef) -> &LoopInfo {
        &self.per_cfg[r.index()]
    }
}

/// Flow-fact key of a loop: enclosing function name and header address.
pub fn header_key(cfg: &Cfg, h: NodeIndex) -> (String, u64) {
    (cfg.name().to_string(), cfg.block(h).address().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Block, EdgeKind};
    use crate::prog::{Inst, InstKind};

    fn inst(addr: u64) -> Inst {
        Inst::new(addr, 4, InstKind::ALU)
    }

    fn node(cfg: &mut Cfg, addr: u64) -> NodeIndex {
        cfg.add_block(Block::basic(vec![inst(addr)]))
    }

    /// entry -> h -> b -> h (back), h -> exit
    fn single_loop() -> (Cfg, NodeIndex, NodeIndex) {
        let mut cfg = Cfg::new("f", 0);
        let h = node(&mut cfg, 0x100);
        let b = node(&mut cfg, 0x110);
        cfg.add_edge(cfg.entry(), h, EdgeKind::Virtual);
        cfg.add_edge(h, b, EdgeKind::Taken);
        cfg.add_edge(b, h, EdgeKind::Taken);
        cfg.add_edge(h, cfg.exit(), EdgeKind::NotTaken);
        (cfg, h, b)
    }

    #[test]
    fn test_single_loop() {
        let (cfg, h, b) = single_loop();
        let info = LoopInfo::compute(&cfg);

        assert!(info.is_header(h));
        assert!(!info.is_header(b));
        assert!(info.contains(h, b));
        assert_eq!(info.loop_of(b), Some(h));
        assert_eq!(info.depth(b), 1);
        assert_eq!(info.depth(cfg.entry()), 0);
        assert!(!info.has_irreducible());
    }

    #[test]
    fn test_back_and_entry_edges() {
        let (cfg, h, _) = single_loop();
        let info = LoopInfo::compute(&cfg);

        assert_eq!(info.back_edges(&cfg, h).len(), 1);
        assert_eq!(info.entry_edges(&cfg, h).len(), 1);
        for e in info.back_edges(&cfg, h) {
            assert!(info.is_back(&cfg, e));
            assert!(!info.is_entry(&cfg, e));
        }
    }

    #[test]
    fn test_nested_loops() {
        // entry -> oh -> ih -> body -> ih (back), ih -> oh (back), oh -> exit
        let mut cfg = Cfg::new("f", 0);
        let oh = node(&mut cfg, 0x100);
        let ih = node(&mut cfg, 0x110);
        let body = node(&mut cfg, 0x120);
        cfg.add_edge(cfg.entry(), oh, EdgeKind::Virtual);
        cfg.add_edge(oh, ih, EdgeKind::Taken);
        cfg.add_edge(ih, body, EdgeKind::Taken);
        cfg.add_edge(body, ih, EdgeKind::Taken);
        cfg.add_edge(ih, oh, EdgeKind::NotTaken);
        cfg.add_edge(oh, cfg.exit(), EdgeKind::NotTaken);

        let info = LoopInfo::compute(&cfg);
        assert!(info.is_header(oh));
        assert!(info.is_header(ih));
        assert_eq!(info.immediate_loop(ih), Some(oh));
        assert_eq!(info.depth(body), 2);
        assert!(info.contains(oh, body));
        assert!(!info.contains(ih, oh));
    }

    #[test]
    fn test_irreducible_reentry() {
        // Two entries into the same cycle: entry -> a -> b -> c -> b, a -> c
        let mut cfg = Cfg::new("f", 0);
        let a = node(&mut cfg, 0x100);
        let b = node(&mut cfg, 0x110);
        let c = node(&mut cfg, 0x120);
        cfg.add_edge(cfg.entry(), a, EdgeKind::Virtual);
        cfg.add_edge(a, b, EdgeKind::Taken);
        cfg.add_edge(b, c, EdgeKind::NotTaken);
        cfg.add_edge(c, b, EdgeKind::Taken);
        cfg.add_edge(a, c, EdgeKind::NotTaken);
        cfg.add_edge(b, cfg.exit(), EdgeKind::Taken);

        let info = LoopInfo::compute(&cfg);
        assert!(info.has_irreducible());
    }

    #[test]
    fn test_exit_edges() {
        let (cfg, h, b) = single_loop();
        let info = LoopInfo::compute(&cfg);
        let exits = info.exit_edges(&cfg, h);
        assert_eq!(exits.len(), 1);
        let (src, dst) = cfg.endpoints(exits[0]);
        assert_eq!(src, h);
        assert_eq!(dst, cfg.exit());
        assert_eq!(info.exited_headers(&cfg, exits[0]), vec![h]);
        let _ = b;
    }
}
