//! Driver/store/graph dataflow engine.
//!
//! The newer engine splits the fixpoint computation into three exchangeable
//! pieces: a [`Graph`] adapter providing the traversal (one CFG, or the
//! whole collection with transparent call traversal), a [`Store`] holding
//! per-vertex output states, and the [`WorkListDriver`] that repeatedly
//! selects a vertex whose input changed, runs the client update and marks
//! the successors dirty. For deterministic monotone domains it computes
//! the same results as the half-abstract-interpretation engine.

use crate::cfg::{BlockRef, Cfg, CfgCollection};
use ahash::AHashMap;
use petgraph::graph::NodeIndex;
use std::hash::Hash;

/// Graph adapter over which the driver iterates.
pub trait Graph {
    type Vertex: Copy + Eq + Hash;

    fn entry(&self) -> Self::Vertex;
    fn preds(&self, v: Self::Vertex) -> Vec<Self::Vertex>;
    fn succs(&self, v: Self::Vertex) -> Vec<Self::Vertex>;
}

/// Client analysis: a monotone transfer function over a join semi-lattice.
pub trait Analysis<G: Graph> {
    type Domain: Clone;

    fn bottom(&self) -> Self::Domain;
    fn entry(&self) -> Self::Domain;
    fn lub(&self, a: &mut Self::Domain, b: &Self::Domain);
    fn equals(&self, a: &Self::Domain, b: &Self::Domain) -> bool;
    fn update(&mut self, graph: &G, v: G::Vertex, input: &Self::Domain) -> Self::Domain;
}

/// Per-vertex output storage.
pub trait Store<V, D> {
    fn get(&self, v: V) -> Option<&D>;
    fn set(&mut self, v: V, d: D);
}

/// Dense store indexed by block position, for single-CFG runs.
pub struct ArrayStore<D> {
    slots: Vec<Option<D>>,
}

impl<D> ArrayStore<D> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
        }
    }
}

impl<D> Store<NodeIndex, D> for ArrayStore<D> {
    fn get(&self, v: NodeIndex) -> Option<&D> {
        self.slots.get(v.index()).and_then(|s| s.as_ref())
    }

    fn set(&mut self, v: NodeIndex, d: D) {
        self.slots[v.index()] = Some(d);
    }
}

/// Sparse store for collection-wide runs.
pub struct MapStore<V, D> {
    map: AHashMap<V, D>,
}

impl<V: Eq + Hash, D> Default for MapStore<V, D> {
    fn default() -> Self {
        Self {
            map: AHashMap::new(),
        }
    }
}

impl<V: Eq + Hash, D> MapStore<V, D> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Copy + Eq + Hash, D> Store<V, D> for MapStore<V, D> {
    fn get(&self, v: V) -> Option<&D> {
        self.map.get(&v)
    }

    fn set(&mut self, v: V, d: D) {
        self.map.insert(v, d);
    }
}

/// Adapter over a single CFG.
pub struct CfgGraph<'a> {
    pub cfg: &'a Cfg,
}

impl<'a> Graph for CfgGraph<'a> {
    type Vertex = NodeIndex;

    fn entry(&self) -> NodeIndex {
        self.cfg.entry()
    }

    fn preds(&self, v: NodeIndex) -> Vec<NodeIndex> {
        self.cfg.preds(v)
    }

    fn succs(&self, v: NodeIndex) -> Vec<NodeIndex> {
        self.cfg.succs(v)
    }
}

/// Adapter over the whole collection: synthetic blocks flow into their
/// callee's entry, callee exits flow back to every return point.
pub struct CollectionGraph<'a> {
    pub coll: &'a CfgCollection,
}

impl<'a> Graph for CollectionGraph<'a> {
    type Vertex = BlockRef;

    fn entry(&self) -> BlockRef {
        (self.coll.entry(), self.coll.entry_cfg().entry())
    }

    fn preds(&self, (r, n): BlockRef) -> Vec<BlockRef> {
        let cfg = self.coll.get(r);
        if cfg.block(n).is_entry() {
            // flows in from every call site
            return cfg
                .callers
                .iter()
                .map(|&(caller, site)| (caller, site))
                .collect();
        }
        let mut out = Vec::new();
        for p in cfg.preds(n) {
            if let Some(callee) = cfg.block(p).callee() {
                // the value reaching us comes out of the callee
                out.push((callee, self.coll.get(callee).exit()));
            } else {
                out.push((r, p));
            }
        }
        out
    }

    fn succs(&self, (r, n): BlockRef) -> Vec<BlockRef> {
        let cfg = self.coll.get(r);
        if let Some(callee) = cfg.block(n).callee() {
            return vec![(callee, self.coll.get(callee).entry())];
        }
        if cfg.block(n).is_exit() {
            // resume at the return point of each call site
            return cfg
                .callers
                .iter()
                .flat_map(|&(caller, site)| {
                    self.coll
                        .get(caller)
                        .succs(site)
                        .into_iter()
                        .map(move |t| (caller, t))
                })
                .collect();
        }
        cfg.succs(n).into_iter().map(|t| (r, t)).collect()
    }
}

/// The worklist driver.
pub struct WorkListDriver;

impl WorkListDriver {
    /// Iterates to fixpoint. Returns the number of vertex evaluations.
    pub fn run<G, A, S>(graph: &G, analysis: &mut A, store: &mut S) -> usize
    where
        G: Graph,
        A: Analysis<G>,
        S: Store<G::Vertex, A::Domain>,
    {
        let mut worklist = vec![graph.entry()];
        let mut evaluations = 0;

        while let Some(v) = worklist.pop() {
            evaluations += 1;

            let input = if v == graph.entry() {
                analysis.entry()
            } else {
                let mut acc = analysis.bottom();
                for p in graph.preds(v) {
                    if let Some(d) = store.get(p) {
                        analysis.lub(&mut acc, d);
                    }
                }
                acc
            };

            let out = analysis.update(graph, v, &input);
            let changed = match store.get(v) {
                Some(old) => !analysis.equals(old, &out),
                None => true,
            };
            if changed {
                store.set(v, out);
                for s in graph.succs(v) {
                    if !worklist.contains(&s) {
                        worklist.push(s);
                    }
                }
            }
        }
        evaluations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::cfg::loops::LoopForest;
    use crate::dfa::hai::{FixPoint, HalfAbsInt};
    use crate::prog::{Inst, InstKind, Process, Segment};
    use std::collections::BTreeSet;

    fn seg(base: u64, len: usize) -> Segment {
        Segment {
            name: ".text".into(),
            base,
            data: vec![0; len],
            executable: true,
        }
    }

    fn alu(addr: u64) -> Inst {
        Inst::new(addr, 4, InstKind::ALU)
    }

    fn ret(addr: u64) -> Inst {
        Inst::new(addr, 4, InstKind::CONTROL | InstKind::RETURN)
    }

    fn cond_branch(addr: u64, target: u64) -> Inst {
        Inst::new(addr, 4, InstKind::CONTROL | InstKind::COND).with_target(target)
    }

    /// Reached-addresses domain, shared by both engines under test.
    struct Reach;

    impl<'a> Analysis<CfgGraph<'a>> for Reach {
        type Domain = BTreeSet<u64>;

        fn bottom(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn entry(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn lub(&self, a: &mut BTreeSet<u64>, b: &BTreeSet<u64>) {
            a.extend(b.iter().copied());
        }
        fn equals(&self, a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> bool {
            a == b
        }
        fn update(&mut self, g: &CfgGraph<'a>, v: NodeIndex, input: &BTreeSet<u64>) -> BTreeSet<u64> {
            let mut out = input.clone();
            if let Some(addr) = g.cfg.block(v).address() {
                out.insert(addr);
            }
            out
        }
    }

    struct ReachHai {
        outputs: AHashMap<BlockRef, BTreeSet<u64>>,
    }

    impl FixPoint for ReachHai {
        type Domain = BTreeSet<u64>;

        fn bottom(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn top(&self) -> BTreeSet<u64> {
            [u64::MAX].into_iter().collect()
        }
        fn entry(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn lub(&self, a: &mut BTreeSet<u64>, b: &BTreeSet<u64>) {
            a.extend(b.iter().copied());
        }
        fn equals(&self, a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> bool {
            a == b
        }
        fn update(&mut self, at: BlockRef, cfg: &Cfg, input: &BTreeSet<u64>) -> BTreeSet<u64> {
            let mut out = input.clone();
            if let Some(addr) = cfg.block(at.1).address() {
                out.insert(addr);
            }
            self.outputs.insert(at, out.clone());
            out
        }
    }

    #[test]
    fn test_driver_reaches_fixpoint_on_loop() {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(seg(0x100, 64))
            .insts(vec![alu(0x100), cond_branch(0x104, 0x100), ret(0x108)])
            .build();
        let coll = CfgBuilder::new(&proc).build(0x100).unwrap();
        let cfg = coll.entry_cfg();

        let graph = CfgGraph { cfg };
        let mut store = ArrayStore::new(cfg.block_count());
        let evals = WorkListDriver::run(&graph, &mut Reach, &mut store);
        assert!(evals >= cfg.block_count());

        let exit_out = store.get(cfg.exit()).unwrap();
        assert!(exit_out.contains(&0x100));
        assert!(exit_out.contains(&0x108));
    }

    #[test]
    fn test_engines_agree() {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(seg(0x100, 64))
            .insts(vec![alu(0x100), cond_branch(0x104, 0x100), ret(0x108)])
            .build();
        let coll = CfgBuilder::new(&proc).build(0x100).unwrap();
        let cfg = coll.entry_cfg();

        // driver engine
        let graph = CfgGraph { cfg };
        let mut store = ArrayStore::new(cfg.block_count());
        WorkListDriver::run(&graph, &mut Reach, &mut store);

        // classic engine
        let loops = LoopForest::compute(&coll);
        let mut p = ReachHai {
            outputs: AHashMap::new(),
        };
        HalfAbsInt::new(&mut p, &coll, &loops).solve(None).unwrap();

        for n in cfg.blocks() {
            if !cfg.block(n).is_basic() {
                continue;
            }
            let a = store.get(n).expect("driver produced a value");
            let b = p
                .outputs
                .get(&(coll.entry(), n))
                .expect("engine produced a value");
            assert_eq!(a, b, "engines disagree at {:?}", n);
        }
    }

    #[test]
    fn test_map_store() {
        let mut store: MapStore<(u32, u32), u64> = MapStore::new();
        store.set((0, 1), 42);
        assert_eq!(store.get((0, 1)), Some(&42));
        assert_eq!(store.get((1, 1)), None);
    }

    /// Whole-collection adapter: values flow through calls transparently.
    struct ReachAll;

    impl<'a> Analysis<CollectionGraph<'a>> for ReachAll {
        type Domain = BTreeSet<u64>;

        fn bottom(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn entry(&self) -> BTreeSet<u64> {
            BTreeSet::new()
        }
        fn lub(&self, a: &mut BTreeSet<u64>, b: &BTreeSet<u64>) {
            a.extend(b.iter().copied());
        }
        fn equals(&self, a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> bool {
            a == b
        }
        fn update(
            &mut self,
            g: &CollectionGraph<'a>,
            (r, n): BlockRef,
            input: &BTreeSet<u64>,
        ) -> BTreeSet<u64> {
            let mut out = input.clone();
            if let Some(addr) = g.coll.get(r).block(n).address() {
                out.insert(addr);
            }
            out
        }
    }

    #[test]
    fn test_collection_graph_traverses_calls() {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(seg(0x100, 0x200))
            .insts(vec![
                Inst::new(0x100, 4, InstKind::CONTROL | InstKind::CALL).with_target(0x200),
                ret(0x104),
                alu(0x200),
                ret(0x204),
            ])
            .build();
        let coll = CfgBuilder::new(&proc).build(0x100).unwrap();

        let graph = CollectionGraph { coll: &coll };
        let mut store: MapStore<BlockRef, BTreeSet<u64>> = MapStore::new();
        WorkListDriver::run(&graph, &mut ReachAll, &mut store);

        // the block after the call saw the callee body
        let main = coll.entry_cfg();
        let after = main.block_at(0x104).unwrap();
        let state = store.get((coll.entry(), after)).expect("return point reached");
        assert!(state.contains(&0x200));
        assert!(state.contains(&0x100));
    }
}
