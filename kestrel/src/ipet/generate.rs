//! ILP generation.
//!
//! Encodes the CFG flow structure, the flow facts, the per-edge times and
//! the event penalties into a maximization problem whose optimum is the
//! WCET. This pass must run last: it reads every annotation produced
//! upstream.

use super::{FlowFacts, IpetVars};
use crate::branch::BranchCategory;
use crate::cfg::loops::LoopForest;
use crate::cfg::{CfgCollection, EdgeKind};
use crate::error::{Error, Result};
use crate::etime::builder::EventMaps;
use crate::etime::{EstimateCtx, TimeUnits};
use crate::ilp::{Comp, System, VarType};

#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    /// Use the delta method: block coefficients carry the standalone block
    /// time and edges only the (possibly negative) pipelining correction.
    pub delta: bool,
}

/// Generates the complete system and returns the variable assignment.
pub fn generate(
    coll: &CfgCollection,
    loops: &LoopForest,
    times: &TimeUnits,
    events: &EventMaps,
    facts: &FlowFacts,
    config: &GenerateConfig,
    sys: &mut System,
) -> Result<IpetVars> {
    let vars = IpetVars::assign(coll, sys);

    structural_constraints(coll, &vars, sys);
    flow_fact_constraints(coll, loops, facts, &vars, sys)?;
    objective_and_event_constraints(coll, loops, times, &vars, config, sys);
    branch_constraints(coll, loops, events, &vars, sys);

    tracing::debug!(
        vars = sys.var_count(),
        constraints = sys.cons_count(),
        "ILP system generated"
    );
    Ok(vars)
}

/// Entry count and flow conservation.
fn structural_constraints(coll: &CfgCollection, vars: &IpetVars, sys: &mut System) {
    let entry_cfg = coll.entry();
    let entry_block = coll.entry_cfg().entry();
    let c = sys.new_constraint(Some("entry".into()), Comp::Eq, 1.0);
    sys.add_term(c, vars.of_block((entry_cfg, entry_block)), 1.0);

    for (r, cfg) in coll.iter() {
        for n in cfg.blocks() {
            let xb = vars.of_block((r, n));
            let block = cfg.block(n);

            if !block.is_entry() {
                let c = sys.new_constraint(
                    Some(format!("flow in {}:{}", cfg.name(), n.index())),
                    Comp::Eq,
                    0.0,
                );
                sys.add_term(c, xb, 1.0);
                for e in cfg.in_edges(n) {
                    sys.add_term(c, vars.of_edge(r, e), -1.0);
                }
            } else if r != entry_cfg {
                // a callee entry executes once per call-site activation
                let c = sys.new_constraint(
                    Some(format!("calls of {}", cfg.name())),
                    Comp::Eq,
                    0.0,
                );
                sys.add_term(c, xb, 1.0);
                for &(caller, site) in &cfg.callers {
                    sys.add_term(c, vars.of_block((caller, site)), -1.0);
                }
            }

            if !block.is_exit() {
                let c = sys.new_constraint(
                    Some(format!("flow out {}:{}", cfg.name(), n.index())),
                    Comp::Eq,
                    0.0,
                );
                sys.add_term(c, xb, 1.0);
                for e in cfg.out_edges(n) {
                    sys.add_term(c, vars.of_edge(r, e), -1.0);
                }
            }
        }
    }
}

/// Loop bounds and block facts. A loop without a bound is fatal: the
/// system would be unbounded.
fn flow_fact_constraints(
    coll: &CfgCollection,
    loops: &LoopForest,
    facts: &FlowFacts,
    vars: &IpetVars,
    sys: &mut System,
) -> Result<()> {
    for (r, cfg) in coll.iter() {
        let info = loops.get(r);
        for h in info.headers() {
            let addr = cfg.block(h).address().unwrap_or(0);
            let bound = facts.loop_bound(cfg.name(), addr).ok_or(Error::FlowFact {
                function: cfg.name().to_string(),
                header: addr,
            })?;

            // x_header <= N * (sum of entry-edge counts)
            let c = sys.new_constraint(
                Some(format!("loop bound {:#x} <= {}", addr, bound.max)),
                Comp::Le,
                0.0,
            );
            sys.add_term(c, vars.of_block((r, h)), 1.0);
            for e in info.entry_edges(cfg, h) {
                sys.add_term(c, vars.of_edge(r, e), -(bound.max as f64));
            }

            if let Some(min) = bound.min {
                let c = sys.new_constraint(
                    Some(format!("loop floor {:#x} >= {}", addr, min)),
                    Comp::Ge,
                    0.0,
                );
                sys.add_term(c, vars.of_block((r, h)), 1.0);
                for e in info.entry_edges(cfg, h) {
                    sys.add_term(c, vars.of_edge(r, e), -(min as f64));
                }
            }
        }

        for n in cfg.basic_blocks() {
            let Some(addr) = cfg.block(n).address() else {
                continue;
            };
            for fact in facts.blocks.iter().filter(|f| f.address == addr) {
                if let Some(max) = fact.max {
                    let c = sys.new_constraint(
                        Some(format!("fact {:#x} <= {}", addr, max)),
                        Comp::Le,
                        max as f64,
                    );
                    sys.add_term(c, vars.of_block((r, n)), 1.0);
                }
                if let Some(min) = fact.min {
                    let c = sys.new_constraint(
                        Some(format!("fact {:#x} >= {}", addr, min)),
                        Comp::Ge,
                        min as f64,
                    );
                    sys.add_term(c, vars.of_block((r, n)), 1.0);
                }
            }
        }
    }
    Ok(())
}

/// Per-unit time coefficients and the high-time event constraints.
fn objective_and_event_constraints(
    coll: &CfgCollection,
    loops: &LoopForest,
    times: &TimeUnits,
    vars: &IpetVars,
    config: &GenerateConfig,
    sys: &mut System,
) {
    if config.delta {
        // block coefficient carries the standalone time once
        for (&at, &solo) in &times.solo {
            sys.add_objective(solo as f64, vars.of_block(at));
        }
    }

    for unit in &times.units {
        let xe = vars.of_edge(unit.cfg, unit.edge);

        if config.delta {
            let solo = times.solo.get(&unit.block).copied().unwrap_or(0) as i64;
            let delta = unit.lts as i64 - solo;
            if delta != 0 {
                sys.add_objective(delta as f64, xe);
            }
        } else {
            sys.add_objective(unit.lts as f64, xe);
        }

        if unit.hts > unit.lts {
            let name = {
                let cfg = coll.get(unit.cfg);
                let (src, dst) = cfg.endpoints(unit.edge);
                format!("h_{}_{}_{}", cfg.name(), src.index(), dst.index())
            };
            let xh = sys.new_var(name, VarType::Int);

            // the high path cannot be taken more often than the edge
            let c = sys.new_constraint(Some("hts cap".into()), Comp::Le, 0.0);
            sys.add_term(c, xh, 1.0);
            sys.add_term(c, xe, -1.0);

            // refine with the event occurrence bounds when every event
            // can estimate its count
            if !unit.events.is_empty() && unit.events.iter().all(|e| e.is_estimating(true)) {
                let c = sys.new_constraint(Some("hts events".into()), Comp::Le, 0.0);
                sys.add_term(c, xh, 1.0);
                let mut ctx = EstimateCtx {
                    sys: &mut *sys,
                    cons: c,
                    vars,
                    coll,
                    loops,
                };
                for ev in &unit.events {
                    ev.estimate(&mut ctx, true);
                }
            }

            sys.add_objective((unit.hts - unit.lts) as f64, xh);
        }
    }
}

/// Misprediction variables: `x_mp = Σ x_mp_edge`, each edge variable
/// bounded by its edge count, refined by the branch category.
fn branch_constraints(
    coll: &CfgCollection,
    loops: &LoopForest,
    events: &EventMaps,
    vars: &IpetVars,
    sys: &mut System,
) {
    for be in &events.branches {
        let (r, n) = be.at;
        let cfg = coll.get(r);

        // edges that mispredict under a fixed prediction direction
        let wrong_kind = if be.predicts_taken {
            EdgeKind::NotTaken
        } else {
            EdgeKind::Taken
        };

        match be.category {
            BranchCategory::AlwaysHistory => {
                // warmed history predicts correctly: no penalty
            }
            BranchCategory::AlwaysDefault
            | BranchCategory::StaticTaken
            | BranchCategory::StaticNotTaken => {
                // mispredicts exactly on the wrong-direction edge
                let xmp = sys.new_var(format!("mp_{:x}", be.inst), VarType::Int);
                let c = sys.new_constraint(
                    Some(format!("mp {:#x}", be.inst)),
                    Comp::Eq,
                    0.0,
                );
                sys.add_term(c, xmp, 1.0);
                for e in cfg.out_edges(n) {
                    if cfg.edge(e).kind == wrong_kind {
                        sys.add_term(c, vars.of_edge(r, e), -1.0);
                    }
                }
                sys.add_objective(be.penalty as f64, xmp);
            }
            BranchCategory::FirstUnknown { header } => {
                let xmp = mp_edge_family(coll, be, vars, sys);
                // at most one unknown prediction per entry of the loop
                // keeping the entry live
                let (hr, h) = header;
                let hcfg = coll.get(hr);
                let c = sys.new_constraint(
                    Some(format!("mp first {:#x}", be.inst)),
                    Comp::Le,
                    0.0,
                );
                sys.add_term(c, xmp, 1.0);
                for e in loops.get(hr).entry_edges(hcfg, h) {
                    sys.add_term(c, vars.of_edge(hr, e), -1.0);
                }
                sys.add_objective(be.penalty as f64, xmp);
            }
            BranchCategory::NotClassified => {
                let xmp = mp_edge_family(coll, be, vars, sys);
                sys.add_objective(be.penalty as f64, xmp);
            }
        }
    }
}

/// Creates `x_mp` with its per-edge family and the structural ties
/// `x_mp = Σ x_mp_edge`, `x_mp_edge <= x_edge`.
fn mp_edge_family(
    coll: &CfgCollection,
    be: &crate::etime::builder::BranchEvent,
    vars: &IpetVars,
    sys: &mut System,
) -> crate::ilp::VarId {
    let (r, n) = be.at;
    let cfg = coll.get(r);
    let xmp = sys.new_var(format!("mp_{:x}", be.inst), VarType::Int);
    let tie = sys.new_constraint(Some(format!("mp tie {:#x}", be.inst)), Comp::Eq, 0.0);
    sys.add_term(tie, xmp, 1.0);

    for e in cfg.out_edges(n) {
        let kind = cfg.edge(e).kind;
        if kind != EdgeKind::Taken && kind != EdgeKind::NotTaken {
            continue;
        }
        let xe = vars.of_edge(r, e);
        let xmpe = sys.new_var(format!("mp_{:x}_e{}", be.inst, e.index()), VarType::Int);
        sys.add_term(tie, xmpe, -1.0);
        let cap = sys.new_constraint(None, Comp::Le, 0.0);
        sys.add_term(cap, xmpe, 1.0);
        sys.add_term(cap, xe, -1.0);
    }
    xmp
}
