//! Cache geometry description.

use crate::error::{Error, Result};
use crate::prog::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    Lru,
    Plru,
    Fifo,
    Random,
}

/// One cache level. Geometry is given in powers of two: `block_bits` is
/// log2 of the line size, `row_bits` log2 of the row (set) count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_block_bits")]
    pub block_bits: u32,
    #[serde(default = "default_row_bits")]
    pub row_bits: u32,
    #[serde(default = "default_assoc")]
    pub associativity: usize,
    #[serde(default = "default_policy")]
    pub replacement: ReplacementPolicy,
    /// Extra cycles served on a hit (0 means single-cycle access).
    #[serde(default)]
    pub hit_latency: u32,
    /// Write-back caches emit purge events on dirty eviction.
    #[serde(default)]
    pub write_back: bool,
}

fn default_block_bits() -> u32 {
    4
}

fn default_row_bits() -> u32 {
    4
}

fn default_assoc() -> usize {
    1
}

fn default_policy() -> ReplacementPolicy {
    ReplacementPolicy::Lru
}

impl CacheConfig {
    pub fn block_size(&self) -> u64 {
        1 << self.block_bits
    }

    pub fn rows(&self) -> usize {
        1 << self.row_bits
    }

    /// Cache block (line) number of an address.
    pub fn block_of(&self, addr: Address) -> u64 {
        addr >> self.block_bits
    }

    /// Row the address maps to.
    pub fn row_of(&self, addr: Address) -> usize {
        (self.block_of(addr) as usize) & (self.rows() - 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.associativity == 0 {
            return Err(Error::Config("cache associativity must be positive".into()));
        }
        if self.block_bits == 0 || self.block_bits > 12 {
            return Err(Error::Config(format!(
                "unreasonable cache block bits: {}",
                self.block_bits
            )));
        }
        Ok(())
    }
}

/// Instruction and data caches of the first level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHierarchy {
    pub icache: Option<CacheConfig>,
    pub dcache: Option<CacheConfig>,
}

impl CacheHierarchy {
    pub fn validate(&self) -> Result<()> {
        if let Some(c) = &self.icache {
            c.validate()?;
        }
        if let Some(c) = &self.dcache {
            c.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let cache = CacheConfig {
            block_bits: 5, // 32-byte lines
            row_bits: 7,   // 128 rows
            associativity: 4,
            replacement: ReplacementPolicy::Lru,
            hit_latency: 0,
            write_back: false,
        };
        assert_eq!(cache.block_size(), 32);
        assert_eq!(cache.rows(), 128);
        // same line
        assert_eq!(cache.block_of(0x1000), cache.block_of(0x101f));
        // next line, next row
        assert_eq!(cache.row_of(0x1020), cache.row_of(0x1000) + 1);
        cache.validate().unwrap();
    }

    #[test]
    fn test_parse() {
        let h: CacheHierarchy = toml::from_str(
            r#"
[icache]
block_bits = 4
row_bits = 6
associativity = 2
replacement = "lru"
"#,
        )
        .unwrap();
        assert!(h.icache.is_some());
        assert!(h.dcache.is_none());
        h.validate().unwrap();
    }
}
