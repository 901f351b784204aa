//! Pass framework.
//!
//! Every pipeline step advertises the features it requires and provides.
//! Requiring a feature triggers the registered provider (and its own
//! requirements, transitively); each pass runs at most once per session.
//! Two passes providing the same feature are mutually exclusive: the
//! first registered wins.

use super::workspace::WorkSpace;
use crate::branch::{BranchCategories, BranchCategory, BranchPartition, BranchStates};
use crate::cache::{CacheCategories, CacheStates, Category, LBlockPartition};
use crate::cfg::loops::LoopForest;
use crate::error::{Error, Result};
use crate::etime::builder::EventMaps;
use crate::etime::{TimeUnits, TimingConfig};
use crate::ilp::{System, VarId};
use crate::ipet::generate::GenerateConfig;
use crate::ipet::{FlowFacts, IpetVars};
use crate::prog::Address;
use crate::prop::PropId;
use ahash::AHashSet;

pub type Feature = &'static str;

pub const CFG_FEATURE: Feature = "cfg";
pub const SHAPED_CFG_FEATURE: Feature = "shaped-cfg";
pub const LOOP_FEATURE: Feature = "loops";
pub const FLOW_FACTS_FEATURE: Feature = "flow-facts";
pub const CACHE_CATEGORY_FEATURE: Feature = "cache-categories";
pub const BRANCH_CATEGORY_FEATURE: Feature = "branch-categories";
pub const EVENTS_FEATURE: Feature = "events";
pub const TIME_FEATURE: Feature = "times";
pub const ILP_SYSTEM_FEATURE: Feature = "ilp-system";
pub const WCET_FEATURE: Feature = "wcet";

/// Annotation identifiers shared by the pipeline, allocated once per
/// session and threaded through the passes.
pub struct Ids {
    pub loop_header: PropId<bool>,
    pub back_edge: PropId<bool>,
    pub irreducible: PropId<bool>,
    pub reentry: PropId<bool>,
    pub categories: PropId<Vec<Category>>,
    pub branch_category: PropId<BranchCategory>,
    pub time: PropId<u64>,
    pub block_var: PropId<VarId>,
    pub edge_var: PropId<VarId>,
    pub wcet: PropId<u64>,
}

impl Default for Ids {
    fn default() -> Self {
        Self {
            loop_header: PropId::new("loop-header"),
            back_edge: PropId::new("back-edge"),
            irreducible: PropId::new("irreducible"),
            reentry: PropId::new("re-entry"),
            categories: PropId::new("cache-categories"),
            branch_category: PropId::new("branch-category"),
            time: PropId::new("time"),
            block_var: PropId::new("block-var"),
            edge_var: PropId::new("edge-var"),
            wcet: PropId::new("wcet"),
        }
    }
}

/// Per-block outcome retained for reports and post-mortem inspection.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub function: String,
    pub address: Address,
    pub count: u64,
    pub time: u64,
}

/// Pipeline state threaded through the passes: configuration, annotation
/// identifiers and the bulky pass products.
pub struct Context {
    pub entry: Address,
    pub virtualize: bool,
    pub unroll: bool,
    pub timing: TimingConfig,
    pub generate: GenerateConfig,
    pub ids: Ids,

    pub facts: FlowFacts,
    pub loops: Option<LoopForest>,
    pub lblocks: Option<LBlockPartition>,
    pub cache_states: Option<CacheStates>,
    pub cache_categories: Option<CacheCategories>,
    pub branch_partition: Option<BranchPartition>,
    pub branch_states: Option<BranchStates>,
    pub branch_categories: Option<BranchCategories>,
    pub events: Option<EventMaps>,
    pub times: Option<TimeUnits>,
    pub system: Option<System>,
    pub vars: Option<IpetVars>,
    pub wcet: Option<u64>,
    pub outcomes: Vec<BlockOutcome>,
}

impl Context {
    pub fn new(entry: Address) -> Self {
        Self {
            entry,
            virtualize: true,
            unroll: false,
            timing: TimingConfig::default(),
            generate: GenerateConfig::default(),
            ids: Ids::default(),
            facts: FlowFacts::default(),
            loops: None,
            lblocks: None,
            cache_states: None,
            cache_categories: None,
            branch_partition: None,
            branch_states: None,
            branch_categories: None,
            events: None,
            times: None,
            system: None,
            vars: None,
            wcet: None,
            outcomes: Vec::new(),
        }
    }

    pub fn loops(&self) -> &LoopForest {
        self.loops.as_ref().expect("loop analysis ran")
    }
}

/// One pipeline step.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn provides(&self) -> &'static [Feature];
    fn requires(&self) -> &'static [Feature] {
        &[]
    }
    fn run(&mut self, ws: &mut WorkSpace, ctx: &mut Context) -> Result<()>;
}

/// Pass registry and scheduler.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Option<Box<dyn Pass>>>,
    provided: AHashSet<Feature>,
    resolving: Vec<Feature>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(Some(pass));
    }

    /// Ensures the feature is provided, triggering its provider and the
    /// provider's requirements first.
    pub fn require(
        &mut self,
        feature: Feature,
        ws: &mut WorkSpace,
        ctx: &mut Context,
    ) -> Result<()> {
        if self.provided.contains(feature) {
            return Ok(());
        }
        if self.resolving.contains(&feature) {
            return Err(Error::Config(format!(
                "feature dependency cycle through '{}'",
                feature
            )));
        }

        let idx = self
            .passes
            .iter()
            .position(|p| {
                p.as_ref()
                    .map(|p| p.provides().contains(&feature))
                    .unwrap_or(false)
            })
            .ok_or(Error::MissingFeature(feature))?;

        self.resolving.push(feature);
        // take the pass out to run its requirements through &mut self
        let mut pass = self.passes[idx].take().expect("position checked above");
        let result = (|| {
            for &req in pass.requires() {
                self.require(req, ws, ctx)?;
            }
            if ws.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracing::info!(pass = pass.name(), "running");
            pass.run(ws, ctx)
        })();
        if result.is_ok() {
            for &f in pass.provides() {
                self.provided.insert(f);
            }
        }
        self.passes[idx] = Some(pass);
        self.resolving.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hard::Platform;
    use crate::prog::Process;

    struct Recorder {
        name: &'static str,
        provides: &'static [Feature],
        requires: &'static [Feature],
        log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
    }

    impl Pass for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn provides(&self) -> &'static [Feature] {
            self.provides
        }
        fn requires(&self) -> &'static [Feature] {
            self.requires
        }
        fn run(&mut self, _ws: &mut WorkSpace, _ctx: &mut Context) -> Result<()> {
            self.log.borrow_mut().push(self.name);
            Ok(())
        }
    }

    fn ws() -> WorkSpace {
        WorkSpace::new(Process::builder("t").build(), Platform::default())
    }

    #[test]
    fn test_requirements_trigger_providers_in_order() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "late",
            provides: &["b"],
            requires: &["a"],
            log: log.clone(),
        }));
        pipeline.register(Box::new(Recorder {
            name: "early",
            provides: &["a"],
            requires: &[],
            log: log.clone(),
        }));

        let mut ws = ws();
        let mut ctx = Context::new(0);
        pipeline.require("b", &mut ws, &mut ctx).unwrap();
        assert_eq!(*log.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn test_each_pass_runs_once() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "only",
            provides: &["a"],
            requires: &[],
            log: log.clone(),
        }));

        let mut ws = ws();
        let mut ctx = Context::new(0);
        pipeline.require("a", &mut ws, &mut ctx).unwrap();
        pipeline.require("a", &mut ws, &mut ctx).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_missing_provider() {
        let mut pipeline = Pipeline::new();
        let mut ws = ws();
        let mut ctx = Context::new(0);
        let err = pipeline.require("nothing", &mut ws, &mut ctx).unwrap_err();
        assert!(matches!(err, Error::MissingFeature("nothing")));
    }

    #[test]
    fn test_cycle_detected() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "a",
            provides: &["a"],
            requires: &["b"],
            log: log.clone(),
        }));
        pipeline.register(Box::new(Recorder {
            name: "b",
            provides: &["b"],
            requires: &["a"],
            log: log.clone(),
        }));

        let mut ws = ws();
        let mut ctx = Context::new(0);
        assert!(pipeline.require("a", &mut ws, &mut ctx).is_err());
    }
}
