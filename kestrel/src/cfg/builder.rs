//! CFG reconstruction from the instruction stream.
//!
//! Starting at the task entry, the builder follows fall-through and branch
//! targets to slice the function into basic blocks, creating a synthetic
//! block per call site and recursively building callee CFGs. Recursive
//! calls produce a back-reference to the CFG under construction and are
//! marked as such. Computed branches without a resolved target terminate
//! the block with a virtual edge to the exit sentinel.

use super::{Block, Cfg, CfgCollection, CfgRef, EdgeKind};
use crate::error::{Error, Result};
use crate::prog::{Address, Inst, Process};
use ahash::{AHashMap, AHashSet};
use petgraph::graph::NodeIndex;

pub struct CfgBuilder<'a> {
    process: &'a Process,
    /// Function address -> CFG, filled as call targets are discovered.
    built: AHashMap<Address, CfgRef>,
    /// Functions currently on the build stack, for recursion detection.
    in_progress: AHashSet<Address>,
}

impl<'a> CfgBuilder<'a> {
    pub fn new(process: &'a Process) -> Self {
        Self {
            process,
            built: AHashMap::new(),
            in_progress: AHashSet::new(),
        }
    }

    /// Build the collection of CFGs reachable from `entry`. The entry CFG
    /// sits at position 0.
    pub fn build(mut self, entry: Address) -> Result<CfgCollection> {
        let mut coll = CfgCollection::new();
        self.build_function(&mut coll, entry)?;
        for (_, cfg) in coll.iter() {
            cfg.check().map_err(Error::Config)?;
        }
        Ok(coll)
    }

    fn function_name(&self, addr: Address) -> String {
        self.process
            .symbol_at(addr)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("f_{:x}", addr))
    }

    fn build_function(&mut self, coll: &mut CfgCollection, addr: Address) -> Result<CfgRef> {
        if let Some(&r) = self.built.get(&addr) {
            return Ok(r);
        }

        let r = coll.add(Cfg::new(self.function_name(addr), addr));
        self.built.insert(addr, r);
        self.in_progress.insert(addr);
        tracing::debug!("building CFG for {} at {:#x}", coll.get(r).name(), addr);

        let (leaders, insts) = self.scan_function(addr)?;
        self.slice_blocks(coll, r, addr, &leaders, &insts)?;

        self.in_progress.remove(&addr);
        Ok(r)
    }

    /// First pass: walk the function instructions, collecting block leaders
    /// and the set of instruction addresses belonging to the function.
    fn scan_function(&self, entry: Address) -> Result<(AHashSet<Address>, Vec<Inst>)> {
        let mut leaders = AHashSet::new();
        let mut seen = AHashSet::new();
        let mut insts = Vec::new();
        let mut work = vec![entry];
        leaders.insert(entry);

        while let Some(mut pc) = work.pop() {
            while !seen.contains(&pc) {
                let inst = self.process.inst_at(pc).ok_or_else(|| {
                    Error::Config(format!("no instruction at {:#x} (truncated image?)", pc))
                })?;
                seen.insert(pc);
                insts.push(inst.clone());
                let kind = inst.kind();

                if kind.is_return() {
                    break;
                }
                if kind.is_call() {
                    // continuation after the call starts a new block
                    leaders.insert(inst.top_address());
                    work.push(inst.top_address());
                    break;
                }
                if kind.is_branch() {
                    if let Some(target) = inst.target() {
                        leaders.insert(target);
                        work.push(target);
                    }
                    if kind.is_cond() {
                        leaders.insert(inst.top_address());
                        work.push(inst.top_address());
                    }
                    break;
                }
                pc = inst.top_address();
            }
        }

        insts.sort_by_key(|i| i.address());
        Ok((leaders, insts))
    }

    /// Second pass: cut the instruction run at leaders and control
    /// transfers, create the blocks and wire the edges.
    fn slice_blocks(
        &mut self,
        coll: &mut CfgCollection,
        r: CfgRef,
        entry: Address,
        leaders: &AHashSet<Address>,
        insts: &[Inst],
    ) -> Result<()> {
        // cut into basic blocks
        let mut blocks: Vec<Vec<Inst>> = Vec::new();
        let mut current: Vec<Inst> = Vec::new();
        for inst in insts {
            let starts_block = leaders.contains(&inst.address());
            let broken = current
                .last()
                .map(|p: &Inst| p.top_address() != inst.address())
                .unwrap_or(false);
            if (starts_block || broken) && !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            current.push(inst.clone());
            if inst.kind().is_control() {
                blocks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        // materialize nodes
        let mut at: AHashMap<Address, NodeIndex> = AHashMap::new();
        let mut nodes = Vec::new();
        for insts in blocks {
            let addr = insts[0].address();
            let node = coll.get_mut(r).add_block(Block::basic(insts));
            at.insert(addr, node);
            nodes.push(node);
        }

        // wire edges
        let cfg_entry = coll.get(r).entry();
        let cfg_exit = coll.get(r).exit();
        let entry_node = *at
            .get(&entry)
            .ok_or_else(|| Error::Config(format!("entry block missing at {:#x}", entry)))?;
        coll.get_mut(r).add_edge(cfg_entry, entry_node, EdgeKind::Virtual);

        for node in nodes {
            let last = coll
                .get(r)
                .block(node)
                .last_inst()
                .expect("basic block not empty")
                .clone();
            let fall = last.top_address();
            let kind = last.kind();

            if kind.is_return() {
                coll.get_mut(r).add_edge(node, cfg_exit, EdgeKind::Return);
                continue;
            }

            if kind.is_call() {
                let callee_ref = match last.target() {
                    Some(target) => {
                        if self.in_progress.contains(&target) {
                            // recursion: back-reference, no rebuild
                            Some(self.built[&target])
                        } else {
                            Some(self.build_function(coll, target)?)
                        }
                    }
                    None => None,
                };
                let recursive = last
                    .target()
                    .map(|t| self.in_progress.contains(&t))
                    .unwrap_or(false);

                let synth = coll.get_mut(r).add_block(Block::synth(callee_ref, recursive));
                coll.get_mut(r).add_edge(node, synth, EdgeKind::Call);
                if let Some(callee) = callee_ref {
                    coll.get_mut(callee).callers.push((r, synth));
                }
                match at.get(&fall) {
                    Some(&cont) => {
                        coll.get_mut(r).add_edge(synth, cont, EdgeKind::Return);
                    }
                    None => {
                        // call never returns into known code
                        coll.get_mut(r).add_edge(synth, cfg_exit, EdgeKind::Virtual);
                    }
                }
                continue;
            }

            if kind.is_branch() {
                match last.target() {
                    Some(target) => {
                        let target_node = *at.get(&target).ok_or_else(|| {
                            Error::Config(format!("branch target {:#x} outside function", target))
                        })?;
                        coll.get_mut(r).add_edge(node, target_node, EdgeKind::Taken);
                    }
                    None => {
                        // computed branch without annotation: unknown
                        // successor, callers accept worst case
                        tracing::warn!("unresolved computed branch at {:#x}", last.address());
                        coll.get_mut(r).add_edge(node, cfg_exit, EdgeKind::Virtual);
                    }
                }
                if kind.is_cond() {
                    if let Some(&cont) = at.get(&fall) {
                        coll.get_mut(r).add_edge(node, cont, EdgeKind::NotTaken);
                    }
                }
                continue;
            }

            // plain fall-through
            match at.get(&fall) {
                Some(&cont) => {
                    coll.get_mut(r).add_edge(node, cont, EdgeKind::NotTaken);
                }
                None => {
                    coll.get_mut(r).add_edge(node, cfg_exit, EdgeKind::Virtual);
                }
            }
        }

        Ok(())
    }
}

/// Whether this basic block ends on a computed branch whose target the
/// loader could not resolve.
pub fn has_unknown_successor(block: &Block) -> bool {
    block
        .last_inst()
        .map(|i| i.kind().is_branch() && i.target().is_none())
        .unwrap_or(false)
}
