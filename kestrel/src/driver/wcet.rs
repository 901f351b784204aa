//! The WCET driver: the standard pass set and its orchestration.
//!
//! Order of the computation: CFG construction and normalization,
//! optional virtualization and restructuring, loop identification,
//! per-row cache and branch analyses, categorization, event building,
//! execution-graph timing, ILP generation, solving. The ILP generation
//! runs last before the solver: it reads every upstream annotation.

use super::pass::{
    BlockOutcome, Context, Pass, Pipeline, BRANCH_CATEGORY_FEATURE, CACHE_CATEGORY_FEATURE,
    CFG_FEATURE, EVENTS_FEATURE, FLOW_FACTS_FEATURE, ILP_SYSTEM_FEATURE, LOOP_FEATURE,
    SHAPED_CFG_FEATURE, TIME_FEATURE, WCET_FEATURE,
};
use super::workspace::WorkSpace;
use crate::branch;
use crate::cache;
use crate::cfg::builder::CfgBuilder;
use crate::cfg::loops::LoopForest;
use crate::cfg::transform::{
    CfgTransformer, ConditionalRestructurer, LoopUnroller, Normalizer, Virtualizer,
};
use crate::error::{Error, Result};
use crate::etime;
use crate::ilp::{self, System};
use crate::ipet::{self, FlowFacts};
use crate::prog::Address;

/// Driver configuration assembled by the front end.
pub struct WcetConfig {
    pub entry: Address,
    pub virtualize: bool,
    pub unroll: bool,
    pub facts: FlowFacts,
    pub timing: etime::TimingConfig,
    pub delta: bool,
    pub backend: String,
}

impl Default for WcetConfig {
    fn default() -> Self {
        Self {
            entry: 0,
            virtualize: true,
            unroll: false,
            facts: FlowFacts::default(),
            timing: etime::TimingConfig::default(),
            delta: false,
            backend: "cbc".into(),
        }
    }
}

pub struct WcetResult {
    pub wcet: u64,
    pub blocks: Vec<BlockOutcome>,
}

// ---------------------------------------------------------------------------
// passes
// ---------------------------------------------------------------------------

struct BuildCfg;

impl Pass for BuildCfg {
    fn name(&self) -> &'static str {
        "cfg-builder"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[CFG_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let coll = CfgBuilder::new(&ws.process).build(ctx.entry)?;
        let coll = Normalizer.transform(&coll)?;
        tracing::debug!(cfgs = coll.len(), "CFG collection built");
        ws.coll = Some(coll);
        Ok(())
    }
}

struct ShapeCfg;

impl Pass for ShapeCfg {
    fn name(&self) -> &'static str {
        "cfg-shaper"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[SHAPED_CFG_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[CFG_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let mut coll = ws.coll.take().expect("cfg feature provided");
        coll = ConditionalRestructurer.transform(&coll)?;
        if ctx.virtualize {
            coll = Virtualizer::default().transform(&coll)?;
        }
        if ctx.unroll {
            coll = LoopUnroller.transform(&coll)?;
        }
        ws.coll = Some(coll);
        Ok(())
    }
}

struct IdentifyLoops;

impl Pass for IdentifyLoops {
    fn name(&self) -> &'static str {
        "loop-identifier"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[LOOP_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[SHAPED_CFG_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let coll = ws.coll.as_mut().expect("shaped cfg provided");
        let forest = LoopForest::compute(coll);

        // publish header/back-edge marks on the blocks and edges
        for r in coll.refs().collect::<Vec<_>>() {
            if forest.get(r).has_irreducible() {
                tracing::warn!(
                    cfg = coll.get(r).name(),
                    "irreducible region: re-entry paths are analyzed conservatively"
                );
            }
            let headers: Vec<_> = forest.get(r).headers().collect();
            let info = forest.get(r);
            let back: Vec<_> = coll
                .get(r)
                .graph
                .edge_indices()
                .filter(|&e| info.is_back(coll.get(r), e))
                .collect();
            let irreducible: Vec<_> = headers
                .iter()
                .copied()
                .filter(|&h| info.is_irreducible(h))
                .collect();
            let reentries: Vec<_> = coll
                .get(r)
                .blocks()
                .filter(|&n| info.is_reentry(n))
                .collect();
            let cfg = coll.get_mut(r);
            for h in headers {
                cfg.block_mut(h).props.set(ctx.ids.loop_header, true);
            }
            for e in back {
                cfg.edge_mut(e).props.set(ctx.ids.back_edge, true);
            }
            for h in irreducible {
                cfg.block_mut(h).props.set(ctx.ids.irreducible, true);
            }
            for n in reentries {
                cfg.block_mut(n).props.set(ctx.ids.reentry, true);
            }
        }

        ctx.loops = Some(forest);
        Ok(())
    }
}

struct LoadFlowFacts;

impl Pass for LoadFlowFacts {
    fn name(&self) -> &'static str {
        "flow-facts"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[FLOW_FACTS_FEATURE]
    }

    fn run(&mut self, _ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        // facts are injected by the front end; this pass only reports
        tracing::debug!(
            loops = ctx.facts.loops.len(),
            blocks = ctx.facts.blocks.len(),
            "flow facts available"
        );
        Ok(())
    }
}

struct ClassifyCache;

impl Pass for ClassifyCache {
    fn name(&self) -> &'static str {
        "cache-classifier"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[CACHE_CATEGORY_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[LOOP_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let Some(icache) = ws.platform.caches.as_ref().and_then(|c| c.icache.clone()) else {
            tracing::debug!("no instruction cache configured");
            return Ok(());
        };
        icache.validate()?;

        let coll = ws.coll.as_ref().expect("shaped cfg provided");
        let loops = ctx.loops();
        let part = cache::LBlockPartition::build(coll, &icache);
        let states = cache::analyze(coll, loops, &part, Some(ws.cancel_flag()))?;
        let cats = cache::categorize(coll, loops, &part, &states);

        let (hit, miss, first, nc) = cats.summary();
        tracing::info!(hit, miss, first, nc, "instruction cache categorized");

        // publish per-block categories
        let per_block: Vec<_> = cats
            .map
            .iter()
            .map(|(&(r, n), v)| ((r, n), v.iter().map(|a| a.category).collect::<Vec<_>>()))
            .collect();
        let coll = ws.coll.as_mut().expect("shaped cfg provided");
        for ((r, n), list) in per_block {
            coll.get_mut(r)
                .block_mut(n)
                .props
                .set(ctx.ids.categories, list);
        }

        ctx.lblocks = Some(part);
        ctx.cache_states = Some(states);
        ctx.cache_categories = Some(cats);
        Ok(())
    }
}

struct ClassifyBranches;

impl Pass for ClassifyBranches {
    fn name(&self) -> &'static str {
        "branch-classifier"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[BRANCH_CATEGORY_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[LOOP_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let coll = ws.coll.as_ref().expect("shaped cfg provided");
        let loops = ctx.loops();

        let cats = match ws.platform.bht.clone() {
            Some(bht) => {
                let part = branch::BranchPartition::build(coll, &bht);
                let states = branch::analyze(coll, loops, &part, Some(ws.cancel_flag()))?;
                let cats =
                    branch::categorize(coll, loops, Some(&bht), Some(&part), Some(&states));
                ctx.branch_partition = Some(part);
                ctx.branch_states = Some(states);
                cats
            }
            None => branch::categorize(coll, loops, None, None, None),
        };

        let per_block: Vec<_> = cats.map.iter().map(|(&at, info)| (at, info.category)).collect();
        let coll = ws.coll.as_mut().expect("shaped cfg provided");
        for ((r, n), category) in per_block {
            coll.get_mut(r)
                .block_mut(n)
                .props
                .set(ctx.ids.branch_category, category);
        }

        ctx.branch_categories = Some(cats);
        Ok(())
    }
}

struct BuildEvents;

impl Pass for BuildEvents {
    fn name(&self) -> &'static str {
        "event-builder"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[EVENTS_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[CACHE_CATEGORY_FEATURE, BRANCH_CATEGORY_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let coll = ws.coll.as_ref().expect("shaped cfg provided");
        let maps = etime::build_events(
            coll,
            &ws.platform,
            ctx.cache_categories.as_ref(),
            ctx.branch_categories
                .as_ref()
                .expect("branch categorization ran"),
        );
        tracing::info!(
            unit_events = maps.units.total(),
            branch_events = maps.branches.len(),
            "events built"
        );
        ctx.events = Some(maps);
        Ok(())
    }
}

struct ComputeTimes;

impl Pass for ComputeTimes {
    fn name(&self) -> &'static str {
        "edge-time-builder"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[TIME_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[EVENTS_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let proc = match &ws.platform.processor {
            Some(p) => p.clone(),
            None => crate::hard::Processor::scalar(5),
        };
        proc.validate()?;

        let coll = ws.coll.as_ref().expect("shaped cfg provided");
        let times = etime::build_times(
            coll,
            &proc,
            &ctx.events.as_ref().expect("events built").units,
            &ctx.timing,
        );

        let published: Vec<_> = times.block_time.iter().map(|(&at, &t)| (at, t)).collect();
        let coll = ws.coll.as_mut().expect("shaped cfg provided");
        for ((r, n), t) in published {
            coll.get_mut(r).block_mut(n).props.set(ctx.ids.time, t);
        }

        ctx.times = Some(times);
        Ok(())
    }
}

struct GenerateIlp;

impl Pass for GenerateIlp {
    fn name(&self) -> &'static str {
        "ilp-generator"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[ILP_SYSTEM_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[TIME_FEATURE, FLOW_FACTS_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        let coll = ws.coll.as_ref().expect("shaped cfg provided");
        let mut sys = System::maximize();
        let vars = ipet::generate(
            coll,
            ctx.loops.as_ref().expect("loops identified"),
            ctx.times.as_ref().expect("times computed"),
            ctx.events.as_ref().expect("events built"),
            &ctx.facts,
            &ctx.generate,
            &mut sys,
        )?;

        // publish the variables on the annotated objects
        let blocks: Vec<_> = vars.block.iter().map(|(&at, &v)| (at, v)).collect();
        let edges: Vec<_> = vars.edge.iter().map(|(&k, &v)| (k, v)).collect();
        let coll = ws.coll.as_mut().expect("shaped cfg provided");
        for ((r, n), v) in blocks {
            coll.get_mut(r).block_mut(n).props.set(ctx.ids.block_var, v);
        }
        for ((r, e), v) in edges {
            coll.get_mut(r).edge_mut(e).props.set(ctx.ids.edge_var, v);
        }

        ctx.system = Some(sys);
        ctx.vars = Some(vars);
        Ok(())
    }
}

struct Solve {
    backend: String,
}

impl Pass for Solve {
    fn name(&self) -> &'static str {
        "wcet-solver"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[WCET_FEATURE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[ILP_SYSTEM_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()> {
        if ws.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let backend = ilp::backend_by_name(&self.backend)?;
        let sys = ctx.system.as_ref().expect("system generated");
        tracing::info!(
            backend = backend.name(),
            vars = sys.var_count(),
            constraints = sys.cons_count(),
            "solving"
        );
        let solution = backend.solve(sys)?;
        let wcet = solution.objective.round().max(0.0) as u64;
        ws.props.set(ctx.ids.wcet, wcet);
        ctx.wcet = Some(wcet);

        // retain per-block counts for post-mortem inspection
        if let (Some(vars), Some(coll)) = (ctx.vars.as_ref(), ws.coll.as_ref()) {
            let mut outcomes = Vec::new();
            for (&(r, n), &v) in &vars.block {
                let cfg = coll.get(r);
                if !cfg.block(n).is_basic() {
                    continue;
                }
                outcomes.push(BlockOutcome {
                    function: cfg.name().to_string(),
                    address: cfg.block(n).address().unwrap_or(0),
                    count: solution.count(v),
                    time: ctx
                        .times
                        .as_ref()
                        .map(|t| t.time_of((r, n)))
                        .unwrap_or(0),
                });
            }
            outcomes.sort_by_key(|o| o.address);
            ctx.outcomes = outcomes;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// driver
// ---------------------------------------------------------------------------

pub struct WcetDriver;

impl WcetDriver {
    /// Standard pipeline over the workspace. Returns the WCET and the
    /// per-block outcomes.
    pub fn run(ws: &mut WorkSpace, config: WcetConfig) -> Result<WcetResult> {
        let mut ctx = Context::new(config.entry);
        ctx.virtualize = config.virtualize;
        ctx.unroll = config.unroll;
        ctx.facts = config.facts;
        ctx.timing = config.timing;
        ctx.generate.delta = config.delta;

        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(BuildCfg));
        pipeline.register(Box::new(ShapeCfg));
        pipeline.register(Box::new(IdentifyLoops));
        pipeline.register(Box::new(LoadFlowFacts));
        pipeline.register(Box::new(ClassifyCache));
        pipeline.register(Box::new(ClassifyBranches));
        pipeline.register(Box::new(BuildEvents));
        pipeline.register(Box::new(ComputeTimes));
        pipeline.register(Box::new(GenerateIlp));
        pipeline.register(Box::new(Solve {
            backend: config.backend.clone(),
        }));

        pipeline.require(WCET_FEATURE, ws, &mut ctx)?;

        Ok(WcetResult {
            wcet: ctx.wcet.expect("solver pass ran"),
            blocks: ctx.outcomes,
        })
    }

    /// Generation-only entry used by `--dump-cons`: runs everything up to
    /// the ILP system without solving.
    pub fn generate_only(ws: &mut WorkSpace, config: WcetConfig) -> Result<(Context, System)> {
        let mut ctx = Context::new(config.entry);
        ctx.virtualize = config.virtualize;
        ctx.unroll = config.unroll;
        ctx.facts = config.facts;
        ctx.timing = config.timing;
        ctx.generate.delta = config.delta;

        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(BuildCfg));
        pipeline.register(Box::new(ShapeCfg));
        pipeline.register(Box::new(IdentifyLoops));
        pipeline.register(Box::new(LoadFlowFacts));
        pipeline.register(Box::new(ClassifyCache));
        pipeline.register(Box::new(ClassifyBranches));
        pipeline.register(Box::new(BuildEvents));
        pipeline.register(Box::new(ComputeTimes));
        pipeline.register(Box::new(GenerateIlp));

        pipeline.require(ILP_SYSTEM_FEATURE, ws, &mut ctx)?;
        let sys = ctx.system.take().expect("system generated");
        Ok((ctx, sys))
    }
}
