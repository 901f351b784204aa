//! Event system.
//!
//! An event is an occurrence/cost contribution attached to an instruction:
//! a cache miss, an extra memory latency, a dirty-line purge, a branch
//! misprediction. Events are produced by the standard event builder, fed
//! to the execution-graph timing (which enumerates the `sometimes` ones)
//! and contribute bounds on their occurrence counts to the ILP.

pub mod builder;
pub mod time;

pub use builder::{build_events, BranchEvent, EventMaps};
pub use time::{build_times, TimeUnit, TimeUnits, TimingConfig};

use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, CfgCollection};
use crate::ilp::{ConsId, System, VarId};
use crate::ipet::IpetVars;
use crate::prog::Address;
use ahash::AHashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Fetch,
    Mem,
    Branch,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Occurrence {
    Never,
    Sometimes,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Adds latency to one pipeline node.
    Local,
    /// The target cannot start before the related node finished (plus the
    /// cost).
    After,
    /// The target cannot start before the related node started.
    NotBefore,
}

/// Pipeline point an event anchors to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePoint {
    Fetch,
    Exec,
    Commit,
}

/// Access to the ILP under construction for event contributions.
pub struct EstimateCtx<'a> {
    pub sys: &'a mut System,
    pub cons: ConsId,
    pub vars: &'a IpetVars,
    pub coll: &'a CfgCollection,
    pub loops: &'a LoopForest,
}

impl<'a> EstimateCtx<'a> {
    /// Adds an execution-count variable to the bound.
    pub fn add_count(&mut self, var: VarId) {
        self.sys.add_term(self.cons, var, -1.0);
    }

    /// Adds a constant number of occurrences to the bound.
    pub fn add_const(&mut self, k: f64) {
        self.sys.add_constant(self.cons, k);
    }

    pub fn add_block_count(&mut self, at: BlockRef) {
        if let Some(&v) = self.vars.block.get(&at) {
            self.add_count(v);
        }
    }

    /// Adds the entry count of the loop headed by `header`: the sum of its
    /// non-back in-edge variables.
    pub fn add_loop_entries(&mut self, header: BlockRef) {
        let (r, h) = header;
        let cfg = self.coll.get(r);
        for e in self.loops.get(r).entry_edges(cfg, h) {
            if let Some(&v) = self.vars.edge.get(&(r, e)) {
                self.add_count(v);
            }
        }
    }
}

/// An occurrence/cost contribution attached to one instruction.
pub trait Event {
    fn name(&self) -> &'static str;
    fn detail(&self) -> String;
    fn kind(&self) -> EventKind;

    /// Address of the instruction the event applies to.
    fn inst(&self) -> Address;

    /// Cost in cycles when the event occurs.
    fn cost(&self) -> u64;

    fn occurrence(&self) -> Occurrence;

    fn etype(&self) -> EventType {
        EventType::Local
    }

    /// Anchor of a local event.
    fn place(&self) -> StagePoint;

    /// Related instruction and stage for after/not-before events.
    fn related(&self) -> Option<(Address, StagePoint)> {
        None
    }

    /// Coarse occurrence-frequency estimate used to pick which events are
    /// enumerated exactly.
    fn weight(&self) -> u32 {
        1
    }

    /// Whether the event can refine the occurrence bound in the given
    /// activation direction.
    fn is_estimating(&self, _on: bool) -> bool {
        false
    }

    /// Adds the occurrence bound terms to the constraint under
    /// construction.
    fn estimate(&self, _ctx: &mut EstimateCtx<'_>, _on: bool) {}
}

pub type EventRc = Rc<dyn Event>;

/// Events attached per block.
#[derive(Default)]
pub struct EventMap {
    pub per_block: AHashMap<BlockRef, Vec<EventRc>>,
}

impl EventMap {
    pub fn of(&self, at: BlockRef) -> &[EventRc] {
        self.per_block.get(&at).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn push(&mut self, at: BlockRef, event: EventRc) {
        self.per_block.entry(at).or_default().push(event);
    }

    pub fn total(&self) -> usize {
        self.per_block.values().map(|v| v.len()).sum()
    }
}
