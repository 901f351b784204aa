//! Branch history table description.

use crate::prog::Address;
use serde::{Deserialize, Serialize};

/// Prediction used when no history entry applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPrediction {
    Taken,
    NotTaken,
    /// Backward branches taken, forward branches not taken.
    Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bht {
    /// log2 of the row count.
    #[serde(default = "default_row_bits")]
    pub row_bits: u32,
    /// Entries per row.
    #[serde(default = "default_ways")]
    pub ways: usize,
    /// Cycles lost on a misprediction.
    #[serde(default = "default_penalty")]
    pub penalty: u32,
    #[serde(default = "default_prediction")]
    pub default_prediction: DefaultPrediction,
}

fn default_row_bits() -> u32 {
    4
}

fn default_ways() -> usize {
    1
}

fn default_penalty() -> u32 {
    2
}

fn default_prediction() -> DefaultPrediction {
    DefaultPrediction::NotTaken
}

impl Bht {
    pub fn rows(&self) -> usize {
        1 << self.row_bits
    }

    /// Row a branch address maps to. Word-aligned addresses share the low
    /// bits, so the index skips them.
    pub fn row_of(&self, addr: Address) -> usize {
        ((addr >> 2) as usize) & (self.rows() - 1)
    }

    /// Whether the default prediction is "taken" for a branch from `from`
    /// to `to`.
    pub fn predicts_taken(&self, from: Address, to: Address) -> bool {
        match self.default_prediction {
            DefaultPrediction::Taken => true,
            DefaultPrediction::NotTaken => false,
            DefaultPrediction::Direction => to <= from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows() {
        let bht: Bht = toml::from_str("row_bits = 3\npenalty = 4").unwrap();
        assert_eq!(bht.rows(), 8);
        assert_eq!(bht.penalty, 4);
        // same row modulo the table size
        assert_eq!(bht.row_of(0x100), bht.row_of(0x100 + (8 << 2)));
    }

    #[test]
    fn test_static_direction() {
        let bht = Bht {
            row_bits: 4,
            ways: 1,
            penalty: 2,
            default_prediction: DefaultPrediction::Direction,
        };
        assert!(bht.predicts_taken(0x200, 0x100)); // backward
        assert!(!bht.predicts_taken(0x100, 0x200)); // forward
    }
}
