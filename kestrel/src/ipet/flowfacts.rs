//! Flow facts: user-provided execution-count knowledge.
//!
//! Loop bounds are mandatory for every loop reachable from the task entry
//! (the ILP is unbounded otherwise); block facts pin or bound the count of
//! individual blocks, e.g. to encode a known branch outcome.

use crate::error::{Error, Result};
use crate::prog::Address;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct LoopBound {
    /// Address of the loop header block.
    pub address: Address,
    /// Maximum iteration count per loop entry.
    pub max: u64,
    #[serde(default)]
    pub min: Option<u64>,
    /// Restricts the bound to one function when several share an address
    /// range (after inlining clones).
    #[serde(default)]
    pub function: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockFact {
    pub address: Address,
    #[serde(default)]
    pub min: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowFacts {
    #[serde(default, rename = "loop")]
    pub loops: Vec<LoopBound>,
    #[serde(default, rename = "block")]
    pub blocks: Vec<BlockFact>,
}

impl FlowFacts {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("flow facts: {}", e)))
    }

    /// Loop bound for a header address, honoring the function filter.
    pub fn loop_bound(&self, function: &str, address: Address) -> Option<&LoopBound> {
        self.loops
            .iter()
            .find(|b| {
                b.address == address
                    && b.function
                        .as_deref()
                        .map(|f| f == function)
                        .unwrap_or(true)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let facts = FlowFacts::parse(
            r#"
[[loop]]
address = 0x100
max = 10

[[loop]]
address = 0x200
max = 5
function = "filter"

[[block]]
address = 0x140
min = 1

[[block]]
address = 0x150
max = 0
"#,
        )
        .unwrap();

        assert_eq!(facts.loops.len(), 2);
        assert_eq!(facts.blocks.len(), 2);
        assert_eq!(facts.loop_bound("main", 0x100).unwrap().max, 10);
        // function-scoped bound only applies there
        assert!(facts.loop_bound("main", 0x200).is_none());
        assert!(facts.loop_bound("filter", 0x200).is_some());
        assert!(facts.loop_bound("main", 0x300).is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(FlowFacts::parse("loop = 3").is_err());
    }
}
