//! Dataflow engines.
//!
//! [`hai`] hosts the half-abstract-interpretation worklist engine used by
//! the cache and branch analyses; [`worklist`] is the newer driver/store/
//! graph engine. Both produce identical results for deterministic monotone
//! domains.

pub mod hai;
pub mod worklist;

pub use hai::{ContextKind, FixPoint, HalfAbsInt};
