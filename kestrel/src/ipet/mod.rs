//! IPET: variable assignment and ILP generation.

pub mod flowfacts;
pub mod generate;

pub use flowfacts::FlowFacts;
pub use generate::generate;

use crate::cfg::{BlockRef, CfgCollection, CfgRef};
use crate::ilp::{System, VarId, VarType};
use ahash::AHashMap;
use petgraph::graph::EdgeIndex;

/// Execution-count variables: one per block, one per edge.
pub struct IpetVars {
    pub block: AHashMap<BlockRef, VarId>,
    pub edge: AHashMap<(CfgRef, EdgeIndex), VarId>,
}

impl IpetVars {
    /// Creates all structural variables in the system.
    pub fn assign(coll: &CfgCollection, sys: &mut System) -> Self {
        let mut block = AHashMap::new();
        let mut edge = AHashMap::new();

        for (r, cfg) in coll.iter() {
            for n in cfg.blocks() {
                // the (cfg, block) pair keeps names unique even when
                // transformations clone blocks sharing an address
                let name = match cfg.block(n).address() {
                    Some(addr) => format!("x{}_{}_{}_{:x}", r.0, n.index(), cfg.name(), addr),
                    None => format!("x{}_{}_{}", r.0, n.index(), cfg.name()),
                };
                block.insert((r, n), sys.new_var(name, VarType::Int));
            }
            for e in cfg.graph.edge_indices() {
                let (src, dst) = cfg.endpoints(e);
                let name = format!("e{}_{}_{}", r.0, src.index(), dst.index());
                edge.insert((r, e), sys.new_var(name, VarType::Int));
            }
        }

        Self { block, edge }
    }

    pub fn of_block(&self, at: BlockRef) -> VarId {
        self.block[&at]
    }

    pub fn of_edge(&self, r: CfgRef, e: EdgeIndex) -> VarId {
        self.edge[&(r, e)]
    }
}
