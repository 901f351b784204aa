//! Control-flow graph model.
//!
//! Each [`Cfg`] represents one function as a petgraph digraph of [`Block`]s
//! linked by typed [`Edge`]s, with distinguished entry and exit sentinels.
//! A [`CfgCollection`] owns every CFG reachable from the task entry; cross
//! CFG references (callers, callees) are weak [`CfgRef`] indices resolved
//! through the collection, so the object graph stays acyclic.

pub mod builder;
pub mod dom;
pub mod loops;
pub mod transform;

use crate::prog::{Address, Inst};
use crate::prop::PropList;
use ahash::AHashMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

/// Weak reference to a CFG inside its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CfgRef(pub u32);

impl CfgRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Edge typing. `Virtual` edges carry structural links that do not match a
/// machine-level control transfer (unknown targets, inlining seams).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Taken,
    NotTaken,
    Call,
    Return,
    Virtual,
}

/// Directed, typed edge with its annotation slots.
#[derive(Debug)]
pub struct Edge {
    pub kind: EdgeKind,
    pub props: PropList,
}

impl Edge {
    pub fn new(kind: EdgeKind) -> Self {
        Self {
            kind,
            props: PropList::new(),
        }
    }
}

/// Block payloads: entry/exit sentinels carry no instructions, basic blocks
/// carry a straight-line instruction run, synthetic blocks stand for calls.
#[derive(Debug)]
pub enum BlockKind {
    Entry,
    Exit,
    Basic {
        insts: Vec<Inst>,
    },
    Synth {
        callee: Option<CfgRef>,
        recursive: bool,
    },
}

#[derive(Debug)]
pub struct Block {
    pub kind: BlockKind,
    pub props: PropList,
}

impl Block {
    pub fn entry() -> Self {
        Self {
            kind: BlockKind::Entry,
            props: PropList::new(),
        }
    }

    pub fn exit() -> Self {
        Self {
            kind: BlockKind::Exit,
            props: PropList::new(),
        }
    }

    pub fn basic(insts: Vec<Inst>) -> Self {
        debug_assert!(!insts.is_empty(), "basic blocks are never empty");
        Self {
            kind: BlockKind::Basic { insts },
            props: PropList::new(),
        }
    }

    pub fn synth(callee: Option<CfgRef>, recursive: bool) -> Self {
        Self {
            kind: BlockKind::Synth { callee, recursive },
            props: PropList::new(),
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, BlockKind::Entry)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, BlockKind::Exit)
    }

    pub fn is_basic(&self) -> bool {
        matches!(self.kind, BlockKind::Basic { .. })
    }

    pub fn is_synth(&self) -> bool {
        matches!(self.kind, BlockKind::Synth { .. })
    }

    /// Callee of a synthetic block; `None` for other kinds or for unknown
    /// callees.
    pub fn callee(&self) -> Option<CfgRef> {
        match self.kind {
            BlockKind::Synth { callee, .. } => callee,
            _ => None,
        }
    }

    /// Call site closing a recursion cycle.
    pub fn is_recursive_call(&self) -> bool {
        matches!(self.kind, BlockKind::Synth { recursive: true, .. })
    }

    /// Instructions of a basic block; empty for sentinels and synthetics.
    pub fn insts(&self) -> &[Inst] {
        match &self.kind {
            BlockKind::Basic { insts } => insts,
            _ => &[],
        }
    }

    /// Address of the first instruction, if any.
    pub fn address(&self) -> Option<Address> {
        self.insts().first().map(|i| i.address())
    }

    pub fn last_inst(&self) -> Option<&Inst> {
        self.insts().last()
    }

    /// Size in bytes of the instruction run.
    pub fn size(&self) -> u64 {
        self.insts().iter().map(|i| i.size() as u64).sum()
    }
}

/// One function as a graph of blocks.
pub struct Cfg {
    name: String,
    address: Address,
    pub graph: DiGraph<Block, Edge>,
    entry: NodeIndex,
    exit: NodeIndex,
    /// Call sites referring to this CFG, as (caller, synth block) pairs.
    pub callers: Vec<(CfgRef, NodeIndex)>,
    pub props: PropList,
}

impl Cfg {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        let mut graph = DiGraph::new();
        let entry = graph.add_node(Block::entry());
        let exit = graph.add_node(Block::exit());
        Self {
            name: name.into(),
            address,
            graph,
            entry,
            exit,
            callers: Vec::new(),
            props: PropList::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn exit(&self) -> NodeIndex {
        self.exit
    }

    pub fn block(&self, n: NodeIndex) -> &Block {
        &self.graph[n]
    }

    pub fn block_mut(&mut self, n: NodeIndex) -> &mut Block {
        &mut self.graph[n]
    }

    pub fn edge(&self, e: EdgeIndex) -> &Edge {
        &self.graph[e]
    }

    pub fn edge_mut(&mut self, e: EdgeIndex) -> &mut Edge {
        &mut self.graph[e]
    }

    pub fn endpoints(&self, e: EdgeIndex) -> (NodeIndex, NodeIndex) {
        self.graph.edge_endpoints(e).expect("edge belongs to graph")
    }

    pub fn add_block(&mut self, block: Block) -> NodeIndex {
        self.graph.add_node(block)
    }

    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) -> EdgeIndex {
        self.graph.add_edge(from, to, Edge::new(kind))
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn blocks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Basic blocks only, in index order.
    pub fn basic_blocks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices().filter(|&n| self.graph[n].is_basic())
    }

    pub fn in_edges(&self, n: NodeIndex) -> Vec<EdgeIndex> {
        self.graph
            .edges_directed(n, Direction::Incoming)
            .map(|e| e.id())
            .collect()
    }

    pub fn out_edges(&self, n: NodeIndex) -> Vec<EdgeIndex> {
        self.graph
            .edges_directed(n, Direction::Outgoing)
            .map(|e| e.id())
            .collect()
    }

    pub fn preds(&self, n: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(n, Direction::Incoming)
            .collect()
    }

    pub fn succs(&self, n: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(n, Direction::Outgoing)
            .collect()
    }

    /// First block whose instruction run starts at the given address.
    pub fn block_at(&self, addr: Address) -> Option<NodeIndex> {
        self.blocks().find(|&n| self.graph[n].address() == Some(addr))
    }

    /// Checks the structural invariants: sentinels carry no instructions,
    /// entry has no predecessor, exit no successor, every other block is
    /// reachable through at least one predecessor and synthetic blocks have
    /// exactly one outgoing edge.
    pub fn check(&self) -> std::result::Result<(), String> {
        if !self.graph[self.entry].is_entry() || !self.graph[self.exit].is_exit() {
            return Err(format!("{}: sentinel blocks corrupted", self.name));
        }
        if !self.in_edges(self.entry).is_empty() {
            return Err(format!("{}: entry has predecessors", self.name));
        }
        if !self.out_edges(self.exit).is_empty() {
            return Err(format!("{}: exit has successors", self.name));
        }
        for n in self.blocks() {
            let block = &self.graph[n];
            if !block.is_entry() && self.in_edges(n).is_empty() {
                return Err(format!("{}: block {:?} unreachable", self.name, n));
            }
            if block.is_synth() && self.out_edges(n).len() != 1 {
                return Err(format!(
                    "{}: synthetic block {:?} must have one return point",
                    self.name, n
                ));
            }
            if let BlockKind::Basic { insts } = &block.kind {
                for pair in insts.windows(2) {
                    if pair[0].top_address() != pair[1].address() {
                        return Err(format!(
                            "{}: non-contiguous instructions at {:#x}",
                            self.name,
                            pair[1].address()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Cfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cfg({} @ {:#x}, {} blocks)",
            self.name,
            self.address,
            self.graph.node_count()
        )
    }
}

/// The set of CFGs reachable from a task entry. Position 0 is the entry CFG.
#[derive(Debug, Default)]
pub struct CfgCollection {
    cfgs: Vec<Cfg>,
    by_address: AHashMap<Address, CfgRef>,
}

impl CfgCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cfg: Cfg) -> CfgRef {
        let r = CfgRef(self.cfgs.len() as u32);
        self.by_address.insert(cfg.address(), r);
        self.cfgs.push(cfg);
        r
    }

    pub fn entry(&self) -> CfgRef {
        CfgRef(0)
    }

    pub fn entry_cfg(&self) -> &Cfg {
        &self.cfgs[0]
    }

    pub fn get(&self, r: CfgRef) -> &Cfg {
        &self.cfgs[r.index()]
    }

    pub fn get_mut(&mut self, r: CfgRef) -> &mut Cfg {
        &mut self.cfgs[r.index()]
    }

    pub fn by_address(&self, addr: Address) -> Option<CfgRef> {
        self.by_address.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.cfgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cfgs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CfgRef, &Cfg)> {
        self.cfgs
            .iter()
            .enumerate()
            .map(|(i, c)| (CfgRef(i as u32), c))
    }

    pub fn refs(&self) -> impl Iterator<Item = CfgRef> {
        (0..self.cfgs.len() as u32).map(CfgRef)
    }
}

/// Global identifier of one block across the collection.
pub type BlockRef = (CfgRef, NodeIndex);
