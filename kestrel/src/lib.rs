//! Static worst-case execution time (WCET) analysis framework.
//!
//! The pipeline reconstructs control flow from a loaded binary image,
//! classifies instruction-cache and branch-predictor behavior with
//! MUST/MAY/PERSISTENCE abstract interpretation, times basic blocks on a
//! modeled pipeline through execution graphs, and encodes the whole task
//! as an integer linear program whose maximum is the WCET (implicit path
//! enumeration).

pub mod branch;
pub mod cache;
pub mod cfg;
pub mod dfa;
pub mod driver;
pub mod error;
pub mod etime;
pub mod exegraph;
pub mod hard;
pub mod ilp;
pub mod io;
pub mod ipet;
pub mod output;
pub mod prog;
pub mod prop;

// Re-export commonly used types
pub use branch::{BranchCategories, BranchCategory};
pub use cache::{CacheCategories, Category};
pub use cfg::{Cfg, CfgCollection, CfgRef};
pub use driver::{WcetConfig, WcetDriver, WcetResult, WorkSpace};
pub use error::{Error, Result};
pub use hard::Platform;
pub use ilp::{DumpFormat, System};
pub use ipet::FlowFacts;
pub use output::AnalysisReport;
pub use prog::loader::{LoaderConfig, LoaderRegistry};
pub use prog::Process;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
