//! Instruction cache analysis: abstract domains, L-block partitioning,
//! per-row fixpoint problems and the category decision.
//!
//! Data accesses are handled by the event builder directly: without an
//! address analysis the sound data-cache answer is not-classified, so no
//! per-row data problem is run.

pub mod acs;
pub mod analysis;
pub mod category;
pub mod lblock;

pub use acs::{Acs, MayAcs, MustAcs, PersAcs, PersItem};
pub use analysis::{analyze, CacheStates};
pub use category::{build as categorize, AccessCategory, CacheCategories, Category};
pub use lblock::{LBlock, LBlockPartition};
