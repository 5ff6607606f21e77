use crate::config::SandboxConfig;
use crate::errors::{Result, SandboxError};
use crate::runner::detect_graphics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// One file leaf from the caller's project tree, flattened for execution.
/// `content` is authoritative at execution time; `upload_path` is only a
/// back-reference to persisted storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_path: Option<String>,
}

/// A request to run one script, with the sibling files it may read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Project files other than the active one, materialized on disk before
    /// the script runs.
    #[serde(default)]
    pub files: Vec<ProjectFile>,
}

/// The outcome handed back to the caller: combined stdout, stderr or a
/// synthesized message when the process never ran, and the directory the
/// run used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Everything the runner needs for one run: the final script text, the
/// resolved working directory, and which sibling names were written.
#[derive(Debug)]
pub struct ExecutionSession {
    pub script: String,
    pub working_dir: PathBuf,
    pub materialized: Vec<String>,
}

/// Synthesizes the runnable session for a request: resolves the per-project
/// working directory, writes sibling files to disk ahead of execution, and
/// wraps plotting code with a headless-safe preamble.
///
/// Siblings are written by the orchestrating process before the interpreter
/// is spawned, so the active code can open them by name with no embedding
/// or escaping involved.
pub struct SessionBuilder<'a> {
    config: &'a SandboxConfig,
}

impl<'a> SessionBuilder<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self { config }
    }

    /// Directory name a project id maps to. Deterministic; anything not
    /// filesystem-safe is replaced so an id can never escape the uploads
    /// root. Absent ids share the `default` directory.
    pub fn directory_key(project_id: Option<&str>) -> String {
        let sanitized: String = project_id
            .unwrap_or("")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if sanitized.is_empty() {
            "default".to_string()
        } else {
            sanitized
        }
    }

    /// Resolve and create the working directory for a project.
    pub fn ensure_working_dir(&self, project_id: Option<&str>) -> Result<PathBuf> {
        let dir = self
            .config
            .uploads_root
            .join(Self::directory_key(project_id));
        std::fs::create_dir_all(&dir).map_err(|source| SandboxError::Workspace {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    pub fn prepare(&self, request: &ExecutionRequest) -> Result<ExecutionSession> {
        let working_dir = self.ensure_working_dir(request.project_id.as_deref())?;

        let mut materialized = Vec::new();
        for file in &request.files {
            if !safe_file_name(&file.name) {
                warn!(name = %file.name, "skipping sibling with unsafe name");
                continue;
            }
            let path = working_dir.join(&file.name);
            if path.exists() {
                // Already on disk from an upload or a previous run; the
                // on-disk copy wins for this execution.
                continue;
            }
            if file.content.is_empty() && file.upload_path.is_some() {
                // Uploaded file whose text was never loaded into memory.
                // Materializes empty rather than faulting; content is not
                // re-fetched from storage at execution time.
                warn!(name = %file.name, "sibling has no resident content, writing empty file");
            }
            std::fs::write(&path, &file.content)?;
            debug!(name = %file.name, "materialized sibling file");
            materialized.push(file.name.clone());
        }

        Ok(ExecutionSession {
            script: compose_script(&request.code),
            working_dir,
            materialized,
        })
    }
}

/// Plotting code gets a non-interactive backend selected before anything
/// else runs. Harmless when matplotlib is absent; the user's own import
/// will raise the real error.
fn compose_script(code: &str) -> String {
    if detect_graphics(code).plotting {
        format!(
            "try:\n    import matplotlib\n    matplotlib.use('Agg')\nexcept ImportError:\n    pass\n{}",
            code
        )
    } else {
        code.to_string()
    }
}

fn safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
