//! Half-abstract-interpretation fixpoint engine.
//!
//! The engine iterates a client problem over a whole [`CfgCollection`]:
//! blocks are scheduled so that a block runs only after all its non-back
//! predecessors produced a value, loop headers are revisited until their
//! input stabilizes, and synthetic blocks are traversed by pushing a call
//! context and walking the callee. Per-edge domain values are released as
//! soon as their consumer has read them to bound live memory.
//!
//! Clients must provide monotone transfer functions over a finite-height
//! lattice; neither property is checked and non-monotone updates are
//! undefined behavior.

use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockRef, Cfg, CfgCollection, CfgRef};
use crate::error::{Error, Result};
use ahash::AHashMap;
use petgraph::graph::{EdgeIndex, NodeIndex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Context kind passed to the enter/leave hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Loop,
    Function,
}

/// Client problem of the engine.
pub trait FixPoint {
    type Domain: Clone;

    /// Neutral element of the join.
    fn bottom(&self) -> Self::Domain;
    /// Absence of information, used for unknown callees.
    fn top(&self) -> Self::Domain;
    /// State at the task entry.
    fn entry(&self) -> Self::Domain;

    fn lub(&self, a: &mut Self::Domain, b: &Self::Domain);
    fn equals(&self, a: &Self::Domain, b: &Self::Domain) -> bool;

    /// Transfer function of one block.
    fn update(&mut self, at: BlockRef, cfg: &Cfg, input: &Self::Domain) -> Self::Domain;

    /// Invoked when entering a loop (on the header input) or a function
    /// (on the call-site state).
    fn enter_context(&mut self, _dom: &mut Self::Domain, _header: NodeIndex, _kind: ContextKind) {}

    /// Invoked on each loop-exit edge once the loop stabilized, and on the
    /// return state of a call.
    fn leave_context(&mut self, _dom: &mut Self::Domain, _header: NodeIndex, _kind: ContextKind) {}

    /// Observation hook called once per stabilized basic-block evaluation.
    fn block_done(&mut self, _at: BlockRef, _input: &Self::Domain, _output: &Self::Domain) {}
}

/// Per-header fixpoint state: the cached entry join and the last header
/// input, compared across iterations to detect stabilization.
struct HeaderState<D> {
    entry_join: D,
    input: D,
}

pub struct HalfAbsInt<'a, P: FixPoint> {
    problem: &'a mut P,
    coll: &'a CfgCollection,
    loops: &'a LoopForest,
    /// In-flight per-edge domain values, freed eagerly.
    marks: AHashMap<(CfgRef, EdgeIndex), P::Domain>,
    /// Value waiting on a callee entry.
    entry_marks: AHashMap<CfgRef, P::Domain>,
    headers: AHashMap<BlockRef, HeaderState<P::Domain>>,
    first_iter: AHashMap<BlockRef, bool>,
    fixed: AHashMap<BlockRef, bool>,
    worklist: Vec<BlockRef>,
    call_stack: Vec<(CfgRef, EdgeIndex)>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, P: FixPoint> HalfAbsInt<'a, P> {
    pub fn new(problem: &'a mut P, coll: &'a CfgCollection, loops: &'a LoopForest) -> Self {
        Self {
            problem,
            coll,
            loops,
            marks: AHashMap::new(),
            entry_marks: AHashMap::new(),
            headers: AHashMap::new(),
            first_iter: AHashMap::new(),
            fixed: AHashMap::new(),
            worklist: Vec::new(),
            call_stack: Vec::new(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Runs to fixpoint from the collection entry. Returns the number of
    /// block evaluations.
    pub fn solve(&mut self, entry_dom: Option<P::Domain>) -> Result<usize> {
        let entry_cfg = self.coll.entry();
        let start = (entry_cfg, self.coll.entry_cfg().entry());
        let mut iterations = 0usize;
        let mut main_entry = true;

        self.worklist.push(start);
        while let Some((r, n)) = self.worklist.pop() {
            if let Some(flag) = self.cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }
            iterations += 1;

            let cfg = self.coll.get(r);
            let block = cfg.block(n);

            // ---- input phase ----
            let mut fixpoint = false;
            let input = if main_entry && (r, n) == start {
                main_entry = false;
                entry_dom.clone().unwrap_or_else(|| self.problem.entry())
            } else if block.is_entry() {
                self.entry_marks
                    .remove(&r)
                    .expect("call context propagated a state to the callee entry")
            } else if self.loops.get(r).is_header(n) {
                self.header_input(r, n, &mut fixpoint)
            } else {
                self.join_in_edges(r, n, |_, _, _| true)
            };

            // ---- output phase ----
            if self.loops.get(r).is_header(n) && fixpoint {
                self.finish_loop(r, n);
                continue;
            }

            if block.is_exit() && !self.call_stack.is_empty() {
                let mut out = self.problem.update((r, n), cfg, &input);
                let (caller, ret_edge) = self.call_stack.pop().expect("checked non-empty");
                let caller_entry = self.coll.get(caller).entry();
                self.problem
                    .leave_context(&mut out, caller_entry, ContextKind::Function);
                let (_, ret_target) = self.coll.get(caller).endpoints(ret_edge);
                self.marks.insert((caller, ret_edge), out);
                self.try_add(caller, ret_target);
                continue;
            }

            if block.is_synth() {
                let ret_edge = *cfg
                    .out_edges(n)
                    .first()
                    .expect("synthetic blocks carry one return edge");
                // unknown callees force the output to top; so do recursive
                // call sites, whose traversal would never bottom out here
                match block.callee().filter(|_| !block.is_recursive_call()) {
                    None => {
                        let (_, ret_target) = cfg.endpoints(ret_edge);
                        self.marks.insert((r, ret_edge), self.problem.top());
                        self.try_add(r, ret_target);
                    }
                    Some(callee) => {
                        self.call_stack.push((r, ret_edge));
                        let callee_entry = self.coll.get(callee).entry();
                        let mut state = input.clone();
                        self.problem
                            .enter_context(&mut state, callee_entry, ContextKind::Function);
                        self.entry_marks.insert(callee, state);
                        self.worklist.push((callee, callee_entry));
                    }
                }
                continue;
            }

            // standard block: update and propagate to successors
            let out = self.problem.update((r, n), cfg, &input);
            if block.is_basic() {
                self.problem.block_done((r, n), &input, &out);
            }
            for e in cfg.out_edges(n) {
                let (_, target) = cfg.endpoints(e);
                self.marks.insert((r, e), out.clone());
                self.try_add(r, target);
            }
        }

        Ok(iterations)
    }

    /// Header input: entry join (cached over the whole loop run) joined
    /// with the union of back-edge values. Sets `fixpoint` when the input
    /// matches the previous iteration.
    fn header_input(&mut self, r: CfgRef, n: NodeIndex, fixpoint: &mut bool) -> P::Domain {
        let first = *self.first_iter.get(&(r, n)).unwrap_or(&true);
        if first {
            self.first_iter.insert((r, n), false);
            self.fixed.insert((r, n), false);
            let mut entry_join = self.join_in_edges(r, n, |info, cfg, e| !info.is_back(cfg, e));
            self.problem
                .enter_context(&mut entry_join, n, ContextKind::Loop);
            let input = entry_join.clone();
            self.headers.insert(
                (r, n),
                HeaderState {
                    entry_join,
                    input: input.clone(),
                },
            );
            input
        } else {
            let back = self.join_in_edges(r, n, |info, cfg, e| info.is_back(cfg, e));
            let state = self.headers.get(&(r, n)).expect("header visited before");
            let mut input = state.entry_join.clone();
            self.problem.lub(&mut input, &back);
            if self.problem.equals(&input, &state.input) {
                *fixpoint = true;
                self.fixed.insert((r, n), true);
            } else {
                self.headers
                    .get_mut(&(r, n))
                    .expect("header visited before")
                    .input = input.clone();
            }
            input
        }
    }

    /// Loop stabilized: release the header state, call `leave_context` on
    /// every exit-edge value and schedule the exit targets.
    fn finish_loop(&mut self, r: CfgRef, n: NodeIndex) {
        self.headers.remove(&(r, n));
        self.first_iter.insert((r, n), true);

        let cfg = self.coll.get(r);
        let exits = self.loops.get(r).exit_edges(cfg, n);
        if exits.is_empty() {
            tracing::warn!(cfg = cfg.name(), "infinite loop: no exit edge from header");
        }
        let mut scheduled = Vec::new();
        for e in exits {
            if let Some(dom) = self.marks.get_mut(&(r, e)) {
                self.problem.leave_context(dom, n, ContextKind::Loop);
            }
            let (_, target) = cfg.endpoints(e);
            if !scheduled.contains(&target) && self.try_add(r, target) {
                scheduled.push(target);
            }
        }
    }

    /// Joins (and eagerly frees) the marks of the in-edges selected by the
    /// filter.
    fn join_in_edges(
        &mut self,
        r: CfgRef,
        n: NodeIndex,
        filter: impl Fn(&crate::cfg::loops::LoopInfo, &Cfg, EdgeIndex) -> bool,
    ) -> P::Domain {
        let cfg = self.coll.get(r);
        let info = self.loops.get(r);
        let mut acc = self.problem.bottom();
        for e in cfg.in_edges(n) {
            if !filter(info, cfg, e) {
                continue;
            }
            if let Some(dom) = self.marks.remove(&(r, e)) {
                self.problem.lub(&mut acc, &dom);
            }
        }
        acc
    }

    /// Schedules a block once every needed in-edge carries a value. An
    /// unmarked edge does not block a header in flight: back edges are
    /// exempt on the first iteration and entry edges were consumed when
    /// the loop was entered. Exit edges of loops not yet stabilized keep
    /// their target waiting.
    fn try_add(&mut self, r: CfgRef, n: NodeIndex) -> bool {
        let cfg = self.coll.get(r);
        let info = self.loops.get(r);
        let in_flight = self.headers.contains_key(&(r, n));

        for e in cfg.in_edges(n) {
            let done = if self.marks.contains_key(&(r, e)) {
                info.exited_headers(cfg, e)
                    .iter()
                    .all(|h| *self.fixed.get(&(r, *h)).unwrap_or(&false))
            } else if info.is_back(cfg, e) {
                // exempt only before the loop is entered; in flight the
                // header waits for every latch of the iteration
                !in_flight && *self.first_iter.get(&(r, n)).unwrap_or(&true)
            } else {
                in_flight
            };
            if !done {
                return false;
            }
        }
        if !self.worklist.contains(&(r, n)) {
            self.worklist.push((r, n));
        }
        true
    }
}
