//! Pipeline description: stages, functional units and queues.

use crate::error::{Error, Result};
use crate::prog::InstKind;
use serde::{Deserialize, Serialize};

/// Stage behavior class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageType {
    /// Fetches from the instruction memory.
    Fetch,
    /// Simple in-order buffer stage (decode, dispatch, write-back).
    Lazy,
    /// Executes through functional units.
    Exec,
    /// Retires instructions in order.
    Commit,
}

/// One functional unit of an execution stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalUnit {
    pub name: String,
    #[serde(default = "one")]
    pub latency: u32,
    #[serde(default = "one_usize")]
    pub width: usize,
    #[serde(default)]
    pub pipelined: bool,
}

fn one() -> u32 {
    1
}

fn one_usize() -> usize {
    1
}

/// Routes an instruction class to a functional unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    /// Instruction classes served, by kind name (`mem`, `mul`, `float`,
    /// `control`, `alu`).
    pub kinds: Vec<String>,
    /// Target unit name.
    pub fu: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: StageType,
    #[serde(default = "one_usize")]
    pub width: usize,
    #[serde(default = "one")]
    pub latency: u32,
    #[serde(default)]
    pub fus: Vec<FunctionalUnit>,
    #[serde(default)]
    pub dispatch: Vec<Dispatch>,
}

/// Queue between two stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub size: usize,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    pub name: String,
    #[serde(default)]
    pub frequency_mhz: Option<u32>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub queues: Vec<Queue>,
}

impl Processor {
    /// A scalar in-order pipeline with one-cycle stages, the fallback used
    /// when no description is given on the command line.
    pub fn scalar(depth: usize) -> Self {
        let mut stages = vec![Stage {
            name: "FE".into(),
            ty: StageType::Fetch,
            width: 1,
            latency: 1,
            fus: Vec::new(),
            dispatch: Vec::new(),
        }];
        for i in 0..depth.saturating_sub(3) {
            stages.push(Stage {
                name: format!("S{}", i + 1),
                ty: StageType::Lazy,
                width: 1,
                latency: 1,
                fus: Vec::new(),
                dispatch: Vec::new(),
            });
        }
        stages.push(Stage {
            name: "EX".into(),
            ty: StageType::Exec,
            width: 1,
            latency: 1,
            fus: vec![FunctionalUnit {
                name: "ALU".into(),
                latency: 1,
                width: 1,
                pipelined: true,
            }],
            dispatch: Vec::new(),
        });
        stages.push(Stage {
            name: "CM".into(),
            ty: StageType::Commit,
            width: 1,
            latency: 1,
            fus: Vec::new(),
            dispatch: Vec::new(),
        });
        Self {
            name: format!("scalar-{}", depth),
            frequency_mhz: None,
            stages,
            queues: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    pub fn exec_stage(&self) -> Option<usize> {
        self.stages.iter().position(|s| s.ty == StageType::Exec)
    }

    pub fn fetch_stage(&self) -> Option<usize> {
        self.stages.iter().position(|s| s.ty == StageType::Fetch)
    }

    /// Last stage an instruction is guaranteed to traverse; the commit
    /// stage if present, the last stage otherwise.
    pub fn commit_stage(&self) -> usize {
        self.stages
            .iter()
            .position(|s| s.ty == StageType::Commit)
            .unwrap_or(self.stages.len() - 1)
    }

    /// Functional unit serving the given instruction kind in an execution
    /// stage. Follows the dispatch table first, then falls back to the
    /// first unit.
    pub fn dispatch(&self, stage: usize, kind: InstKind) -> Option<usize> {
        let stage = &self.stages[stage];
        if stage.fus.is_empty() {
            return None;
        }
        let class = if kind.is_mem() {
            "mem"
        } else if kind.contains(InstKind::MUL) {
            "mul"
        } else if kind.contains(InstKind::FLOAT) {
            "float"
        } else if kind.is_control() {
            "control"
        } else {
            "alu"
        };
        for rule in &stage.dispatch {
            if rule.kinds.iter().any(|k| k == class) {
                if let Some(i) = stage.fus.iter().position(|f| f.name == rule.fu) {
                    return Some(i);
                }
            }
        }
        Some(0)
    }

    /// Sanity checks done at configuration time.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config(format!("processor {}: no stage", self.name)));
        }
        if self.fetch_stage() != Some(0) {
            return Err(Error::Config(format!(
                "processor {}: first stage must fetch",
                self.name
            )));
        }
        for stage in &self.stages {
            if stage.ty == StageType::Exec && stage.fus.is_empty() {
                return Err(Error::Config(format!(
                    "processor {}: execution stage {} has no functional unit",
                    self.name, stage.name
                )));
            }
            for rule in &stage.dispatch {
                if !stage.fus.iter().any(|f| f.name == rule.fu) {
                    return Err(Error::Config(format!(
                        "processor {}: dispatch to unknown unit {}",
                        self.name, rule.fu
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_STAGE: &str = r#"
name = "rv5"

[[stages]]
name = "FE"
type = "fetch"

[[stages]]
name = "DE"
type = "lazy"

[[stages]]
name = "EX"
type = "exec"
fus = [
    { name = "ALU", latency = 1, pipelined = true },
    { name = "MUL", latency = 3, pipelined = false },
]
dispatch = [
    { kinds = ["mul"], fu = "MUL" },
    { kinds = ["alu", "mem", "control"], fu = "ALU" },
]

[[stages]]
name = "ME"
type = "lazy"

[[stages]]
name = "CM"
type = "commit"
"#;

    #[test]
    fn test_parse_five_stage() {
        let proc: Processor = toml::from_str(FIVE_STAGE).unwrap();
        assert_eq!(proc.depth(), 5);
        assert_eq!(proc.fetch_stage(), Some(0));
        assert_eq!(proc.exec_stage(), Some(2));
        assert_eq!(proc.commit_stage(), 4);
        proc.validate().unwrap();
    }

    #[test]
    fn test_dispatch_table() {
        let proc: Processor = toml::from_str(FIVE_STAGE).unwrap();
        let exec = proc.exec_stage().unwrap();
        assert_eq!(proc.dispatch(exec, InstKind::MUL), Some(1));
        assert_eq!(proc.dispatch(exec, InstKind::ALU), Some(0));
        assert_eq!(proc.dispatch(exec, InstKind::LOAD), Some(0));
    }

    #[test]
    fn test_scalar_fallback() {
        let proc = Processor::scalar(5);
        assert_eq!(proc.depth(), 5);
        proc.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_fetchless() {
        let bad: Processor = toml::from_str(
            r#"
name = "bad"
[[stages]]
name = "EX"
type = "exec"
fus = [{ name = "ALU" }]
"#,
        )
        .unwrap();
        assert!(bad.validate().is_err());
    }
}
