//! Pipeline driver: workspace, pass framework and the WCET computation.

pub mod pass;
pub mod wcet;
pub mod workspace;

pub use pass::{BlockOutcome, Context, Feature, Ids, Pass, Pipeline};
pub use wcet::{WcetConfig, WcetDriver, WcetResult};
pub use workspace::WorkSpace;
