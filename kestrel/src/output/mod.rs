//! Analysis reports and graph dumps.

pub mod graphviz;
pub mod report;

pub use graphviz::{cfg_to_dot, exegraph_to_dot};
pub use report::AnalysisReport;
