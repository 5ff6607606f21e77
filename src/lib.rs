//! Execution core for a hosted Python IDE.
//!
//! Takes untrusted user source text, materializes it alongside its project
//! files in a per-project working directory, auto-installs likely-missing
//! dependencies, runs it in a child interpreter with a controlled
//! environment and a wall-clock timeout, and reconciles the filesystem side
//! effects back into the caller's project view. A separate command gate
//! mediates an interactive terminal's access to pip and a short list of
//! read-only utilities.
//!
//! This is containment for learners running broken scripts, not a security
//! boundary against a determined attacker.
//!
//! # Example
//! ```rust,no_run
//! use pycell::{ExecutionRequest, Sandbox, SandboxConfig};
//!
//! # async fn demo() -> Result<(), pycell::SandboxError> {
//! let sandbox = Sandbox::new(SandboxConfig::new()?);
//! let result = sandbox
//!     .execute(ExecutionRequest {
//!         code: "print('hello')".to_string(),
//!         project_id: Some("proj-1".to_string()),
//!         files: Vec::new(),
//!     })
//!     .await;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

mod config;
mod errors;
mod gate;
mod installer;
mod reconciler;
mod resolver;
mod runner;
mod sandbox;
mod session;

pub use config::{default_alias_table, default_install_catalog, AliasMapping, SandboxConfig};
pub use errors::{Result, SandboxError};
pub use gate::{
    allowed_commands, package_name, CommandGate, CommandVerdict, NullLedger, PackageLedger,
    TerminalRequest, TerminalResult,
};
pub use installer::{InstallReport, PackageInstaller};
pub use reconciler::{FileMetadataStore, FilesystemReconciler, NewFile, NullMetadataStore};
pub use resolver::DependencyResolver;
pub use runner::{detect_graphics, GraphicsUse, ProcessRunner, RunOutcome, RunStatus};
pub use sandbox::{BulkInstallResult, Sandbox};
pub use session::{
    ExecutionRequest, ExecutionResult, ExecutionSession, ProjectFile, SessionBuilder,
};
