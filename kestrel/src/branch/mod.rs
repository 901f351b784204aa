//! Branch-predictor classification.
//!
//! Runs the same MUST/MAY/PERSISTENCE machinery as the instruction cache,
//! but over branch-history-table rows: the conflict set of a row is the
//! set of conditional branches mapping to it, and "presence" means the
//! branch owns a live BHT entry. Categories drive the misprediction
//! events.

pub mod builder;
pub mod problem;

pub use builder::{build as categorize, BranchCategories, BranchInfo};
pub use problem::{analyze, BranchPartition, BranchStates};

use crate::cfg::BlockRef;

/// Prediction category of one conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCategory {
    /// The BHT entry can never be live: the default prediction applies.
    AlwaysDefault,
    /// The BHT entry is always live: history prediction applies.
    AlwaysHistory,
    /// The entry is persistent in some loop: unknown on the first access
    /// only.
    FirstUnknown { header: BlockRef },
    NotClassified,
    /// Statically predicted taken (no dynamic predictor involved).
    StaticTaken,
    /// Statically predicted not taken.
    StaticNotTaken,
}
