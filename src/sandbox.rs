use crate::config::SandboxConfig;
use crate::gate::{
    package_name, CommandGate, CommandVerdict, NullLedger, PackageLedger, TerminalRequest,
    TerminalResult,
};
use crate::installer::PackageInstaller;
use crate::reconciler::{FileMetadataStore, FilesystemReconciler, NewFile, NullMetadataStore};
use crate::resolver::DependencyResolver;
use crate::runner::{ProcessRunner, RunStatus};
use crate::session::{ExecutionRequest, ExecutionResult, SessionBuilder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Outcome of installing the fixed package catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkInstallResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub installed_packages: Vec<String>,
}

/// The execution sandbox facade: one method per operation the host
/// application calls.
///
/// Executions against the same project are serialized with a per-project
/// lock held across sibling materialization, the run itself, and any
/// follow-up reconciliation, so concurrent requests cannot race on the
/// shared working directory. Different projects run freely in parallel.
///
/// Failure policy throughout is graceful degradation: environment problems
/// degrade to advisory text in the normal output channel rather than
/// aborting the request. Learners run broken scripts all day; the sandbox
/// stays up.
pub struct Sandbox {
    config: SandboxConfig,
    runner: ProcessRunner,
    resolver: DependencyResolver,
    store: Arc<dyn FileMetadataStore>,
    ledger: Arc<dyn PackageLedger>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_collaborators(config, Arc::new(NullMetadataStore), Arc::new(NullLedger))
    }

    /// Wire in the host application's persistence collaborators.
    pub fn with_collaborators(
        config: SandboxConfig,
        store: Arc<dyn FileMetadataStore>,
        ledger: Arc<dyn PackageLedger>,
    ) -> Self {
        let runner = ProcessRunner::new(&config);
        let resolver = DependencyResolver::new(&config);
        Self {
            config,
            runner,
            resolver,
            store,
            ledger,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn project_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // An entry nobody holds has only the map's reference left; drop it
        // so the map tracks live projects rather than every id ever seen.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Run submitted source text in its project's working directory.
    ///
    /// Sibling files are written first, likely-missing dependencies are
    /// installed best-effort, then the script runs under the default
    /// timeout. Install problems become advisory text appended to the
    /// output; the script runs regardless and raises its own import error
    /// if a dependency truly could not be installed.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let key = SessionBuilder::directory_key(request.project_id.as_deref());
        let lock = self.project_lock(&key).await;
        let _guard = lock.lock().await;

        let builder = SessionBuilder::new(&self.config);
        let session = match builder.prepare(&request) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "could not prepare execution session");
                return ExecutionResult {
                    output: String::new(),
                    error: Some(e.to_string()),
                    working_dir: None,
                };
            }
        };

        let mut advisory = String::new();
        let missing = self.resolver.missing_packages(&request.code).await;
        if !missing.is_empty() {
            info!(packages = ?missing, "auto-installing detected dependencies");
            let installer = PackageInstaller::new(&self.config);
            let report = installer.install(&missing, &session.working_dir).await;
            if let Some(text) = report.advisory {
                advisory.push_str(&text);
            }
        }

        let outcome = self
            .runner
            .run_script(
                &session.script,
                &session.working_dir,
                self.config.execute_timeout,
            )
            .await;

        let output = compose_output(outcome.stdout, &advisory);
        let error = match outcome.status {
            RunStatus::Completed => {
                if outcome.stderr.is_empty() {
                    None
                } else {
                    Some(outcome.stderr)
                }
            }
            RunStatus::TimedOut => Some(format!(
                "Execution timed out after {} seconds",
                self.config.execute_timeout.as_secs()
            )),
            RunStatus::SpawnFailed => Some(outcome.stderr),
        };

        ExecutionResult {
            output,
            error,
            working_dir: Some(session.working_dir.display().to_string()),
        }
    }

    /// Return files in the project's working directory that `existing` does
    /// not already name. The caller owns merging them into its tree.
    pub async fn detect_new_files(&self, project_id: &str, existing: &[String]) -> Vec<NewFile> {
        let key = SessionBuilder::directory_key(Some(project_id));
        let lock = self.project_lock(&key).await;
        let _guard = lock.lock().await;

        FilesystemReconciler::new(&self.config)
            .detect_new_files(project_id, existing, self.store.as_ref())
            .await
    }

    /// Evaluate one terminal command against the allow-list and run it in
    /// the project's working directory if admitted.
    pub async fn terminal_execute(&self, request: TerminalRequest) -> TerminalResult {
        let gate = CommandGate::new(&self.config);
        let (program, args, timeout, installs) = match gate.evaluate(&request.command) {
            CommandVerdict::Rejected { allowed } => {
                return TerminalResult::Rejected {
                    success: false,
                    error: "Command not allowed. Only the commands below are permitted."
                        .to_string(),
                    allowed,
                };
            }
            CommandVerdict::Allowed {
                program,
                args,
                timeout,
                installs,
            } => (program, args, timeout, installs),
        };

        let builder = SessionBuilder::new(&self.config);
        let working_dir = match builder.ensure_working_dir(request.project_id.as_deref()) {
            Ok(dir) => dir,
            Err(e) => {
                return TerminalResult::Completed {
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    exit_code: -1,
                };
            }
        };

        let outcome = self
            .runner
            .run_command(&program, &args, &working_dir, timeout)
            .await;

        match outcome.status {
            RunStatus::TimedOut => TerminalResult::TimedOut {
                success: false,
                output: outcome.stdout,
                error: format!("Command timed out after {} seconds", timeout.as_secs()),
            },
            RunStatus::SpawnFailed => TerminalResult::Completed {
                success: false,
                output: outcome.stdout,
                error: Some(outcome.stderr),
                exit_code: -1,
            },
            RunStatus::Completed => {
                let success = outcome.exit_code == Some(0);
                if success && !installs.is_empty() {
                    self.record_installs(
                        request.project_id.as_deref(),
                        request.user_id.as_deref(),
                        &installs,
                    )
                    .await;
                }
                TerminalResult::Completed {
                    success,
                    output: outcome.stdout,
                    error: if outcome.stderr.is_empty() {
                        None
                    } else {
                        Some(outcome.stderr)
                    },
                    exit_code: outcome.exit_code.unwrap_or(-1),
                }
            }
        }
    }

    /// Install the fixed package catalog for a project.
    pub async fn bulk_install(&self, project_id: &str, user_id: &str) -> BulkInstallResult {
        let key = SessionBuilder::directory_key(Some(project_id));
        let lock = self.project_lock(&key).await;
        let _guard = lock.lock().await;

        let builder = SessionBuilder::new(&self.config);
        let working_dir = match builder.ensure_working_dir(Some(project_id)) {
            Ok(dir) => dir,
            Err(e) => {
                return BulkInstallResult {
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    exit_code: -1,
                    installed_packages: Vec::new(),
                };
            }
        };

        let installer = PackageInstaller::new(&self.config);
        let report = installer.install_catalog(&working_dir).await;

        if !report.installed.is_empty() {
            self.record_installs(Some(project_id), Some(user_id), &report.installed)
                .await;
        }

        let all_succeeded = report.all_succeeded();
        BulkInstallResult {
            success: all_succeeded,
            output: report.output,
            error: report.advisory,
            exit_code: if all_succeeded { 0 } else { 1 },
            installed_packages: report.installed,
        }
    }

    /// Ledger upserts are pure bookkeeping; failures are logged only.
    async fn record_installs(
        &self,
        project_id: Option<&str>,
        user_id: Option<&str>,
        specs: &[String],
    ) {
        let project = project_id.unwrap_or("default");
        let user = user_id.unwrap_or("anonymous");
        let now = Utc::now();
        for spec in specs {
            let package = package_name(spec);
            if let Err(e) = self
                .ledger
                .record_install(project, user, package, spec, now)
                .await
            {
                error!(package, error = %e, "failed to record install in ledger");
            }
        }
    }
}

/// Program output first, then any install advisory, so the advisory reads
/// as a footnote rather than displacing what the program printed.
fn compose_output(stdout: String, advisory: &str) -> String {
    if advisory.is_empty() {
        return stdout;
    }
    let mut output = stdout;
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(advisory);
    output
}
