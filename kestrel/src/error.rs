use std::path::PathBuf;
use thiserror::Error;

/// Analysis error taxonomy. All errors surface at the driver level;
/// components never recover silently.
#[derive(Debug, Error)]
pub enum Error {
    /// Binary image could not be loaded (missing file, wrong architecture,
    /// truncated contents).
    #[error("cannot load {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    /// Hardware description or tool configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required feature has no registered provider.
    #[error("no processor provides feature '{0}'")]
    MissingFeature(&'static str),

    /// An operation was requested that the loader did not provide
    /// (e.g. register sets on a capability-less instruction).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The ILP back-end failed (infeasible, unbounded or numerical).
    #[error("solver error: {0}")]
    Solver(String),

    /// A loop reachable from the task entry has no bound, which would make
    /// the ILP unbounded.
    #[error("missing loop bound in '{function}' for header at {header:#x}")]
    FlowFact { function: String, header: u64 },

    /// The computation was cancelled through the workspace flag.
    #[error("analysis cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for the CLI: 2 for analysis errors, 3 for solver
    /// errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Solver(_) => 3,
            _ => 2,
        }
    }
}
