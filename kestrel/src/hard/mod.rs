//! Hardware description model, consumed by the timing analyses.
//!
//! Processor, cache, memory and branch-history descriptions are typed
//! structures deserialized from TOML documents (or built in memory by
//! tests and front ends). This module only models the hardware; nothing
//! here computes.

pub mod bht;
pub mod cache;
pub mod memory;
pub mod processor;

pub use bht::Bht;
pub use cache::{CacheConfig, CacheHierarchy, ReplacementPolicy};
pub use memory::{Bank, BankType, Memory, WritePolicy};
pub use processor::{Dispatch, FunctionalUnit, Processor, Queue, Stage, StageType};

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Loads one hardware description document.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// The full hardware platform consumed by the pipeline. Every part is
/// optional; absent parts degrade to the simplest sound model (no cache,
/// flat memory, no predictor).
#[derive(Debug, Clone, Default)]
pub struct Platform {
    pub processor: Option<Processor>,
    pub caches: Option<CacheHierarchy>,
    pub memory: Memory,
    pub bht: Option<Bht>,
}

impl Platform {
    pub fn processor(&self) -> Result<&Processor> {
        self.processor
            .as_ref()
            .ok_or_else(|| Error::Config("no processor description loaded".into()))
    }
}
