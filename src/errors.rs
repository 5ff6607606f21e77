use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Hard failures at the sandbox boundary.
///
/// Almost everything that can go wrong during a run (timeouts, failed
/// installs, unreadable output files) is folded into the result values as
/// advisory text instead of surfacing here. This enum covers only the cases
/// where the sandbox cannot meaningfully produce a result at all.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("failed to prepare working directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
