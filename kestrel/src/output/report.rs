//! JSON analysis report.

use crate::driver::{BlockOutcome, WcetResult};
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockReport {
    pub function: String,
    pub address: String,
    pub count: u64,
    pub time: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub binary: String,
    pub task: String,
    pub wcet_cycles: u64,
    pub generated_at: String,
    pub blocks: Vec<BlockReport>,
}

impl AnalysisReport {
    pub fn new(binary: &str, task: &str, result: &WcetResult) -> Self {
        Self {
            binary: binary.to_string(),
            task: task.to_string(),
            wcet_cycles: result.wcet,
            generated_at: Utc::now().to_rfc3339(),
            blocks: result.blocks.iter().map(BlockReport::from).collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "report written");
        Ok(())
    }
}

impl From<&BlockOutcome> for BlockReport {
    fn from(o: &BlockOutcome) -> Self {
        Self {
            function: o.function.clone(),
            address: format!("{:#x}", o.address),
            count: o.count,
            time: o.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_roundtrip() {
        let result = WcetResult {
            wcet: 1234,
            blocks: vec![BlockOutcome {
                function: "main".into(),
                address: 0x100,
                count: 10,
                time: 7,
            }],
        };
        let report = AnalysisReport::new("task.toml", "main", &result);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write(&path).unwrap();

        let loaded: AnalysisReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.wcet_cycles, 1234);
        assert_eq!(loaded.blocks.len(), 1);
        assert_eq!(loaded.blocks[0].address, "0x100");
    }
}
