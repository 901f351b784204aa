//! Memory bank description.

use crate::prog::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BankType {
    Dram,
    Spm,
    Rom,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    WriteBack,
    WriteThrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bank {
    pub name: String,
    pub address: Address,
    pub size: u64,
    #[serde(rename = "type")]
    pub ty: BankType,
    #[serde(default = "default_latency")]
    pub read_latency: u32,
    #[serde(default = "default_latency")]
    pub write_latency: u32,
    /// Whether accesses to this bank go through the caches.
    #[serde(default = "default_true")]
    pub cached: bool,
    #[serde(default = "default_write_policy")]
    pub write_policy: WritePolicy,
}

fn default_latency() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_write_policy() -> WritePolicy {
    WritePolicy::WriteThrough
}

impl Bank {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.address + self.size
    }
}

/// The memory space as a list of banks. An empty description behaves as a
/// single flat bank with unit latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub banks: Vec<Bank>,
}

impl Default for Memory {
    fn default() -> Self {
        Self { banks: Vec::new() }
    }
}

impl Memory {
    pub fn flat(latency: u32) -> Self {
        Self {
            banks: vec![Bank {
                name: "flat".into(),
                address: 0,
                size: u64::MAX,
                ty: BankType::Dram,
                read_latency: latency,
                write_latency: latency,
                cached: true,
                write_policy: WritePolicy::WriteThrough,
            }],
        }
    }

    pub fn bank_of(&self, addr: Address) -> Option<&Bank> {
        self.banks.iter().find(|b| b.contains(addr))
    }

    pub fn read_latency(&self, addr: Address) -> u32 {
        self.bank_of(addr).map(|b| b.read_latency).unwrap_or(1)
    }

    pub fn write_latency(&self, addr: Address) -> u32 {
        self.bank_of(addr).map(|b| b.write_latency).unwrap_or(1)
    }

    pub fn is_cached(&self, addr: Address) -> bool {
        self.bank_of(addr).map(|b| b.cached).unwrap_or(true)
    }

    pub fn is_write_back(&self, addr: Address) -> bool {
        self.bank_of(addr)
            .map(|b| b.write_policy == WritePolicy::WriteBack)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_lookup() {
        let mem: Memory = toml::from_str(
            r#"
[[banks]]
name = "flash"
address = 0x0800_0000
size = 0x10_0000
type = "ROM"
read_latency = 5
write_latency = 5

[[banks]]
name = "sram"
address = 0x2000_0000
size = 0x2_0000
type = "SPM"
cached = false
"#,
        )
        .unwrap();

        assert_eq!(mem.read_latency(0x0800_0010), 5);
        assert_eq!(mem.read_latency(0x2000_0000), 1);
        assert!(!mem.is_cached(0x2000_0000));
        assert!(mem.bank_of(0x4000_0000).is_none());
        // unmapped addresses default to unit latency
        assert_eq!(mem.read_latency(0x4000_0000), 1);
    }

    #[test]
    fn test_flat_memory() {
        let mem = Memory::flat(3);
        assert_eq!(mem.read_latency(0x1234), 3);
        assert!(mem.is_cached(0x1234));
    }
}
