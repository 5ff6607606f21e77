use crate::config::SandboxConfig;
use crate::runner::ProcessRunner;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// What a round of installs accomplished. `advisory` carries the
/// user-facing warning text for anything that failed; the installer itself
/// never aborts an execution.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub output: String,
    pub advisory: Option<String>,
}

impl InstallReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Installs packages with pip: a bulk attempt first, then an individual
/// retry per package when the bulk invocation fails, so one broken package
/// cannot block the rest.
///
/// Installs always target the per-user site directory, never a system-wide
/// location, and prefer prebuilt wheels over source builds. Because every
/// execution spawns a fresh interpreter whose environment keeps the user
/// site visible, anything installed here is importable on the very next run
/// without restarting anything.
pub struct PackageInstaller<'a> {
    config: &'a SandboxConfig,
    runner: ProcessRunner,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self {
            config,
            runner: ProcessRunner::new(config),
        }
    }

    /// Install `packages`, reporting per-package success where possible.
    pub async fn install(&self, packages: &[String], workdir: &Path) -> InstallReport {
        if packages.is_empty() {
            return InstallReport::default();
        }
        self.upgrade_bootstrap(workdir).await;
        self.install_with_budget(packages, workdir, self.config.install_timeout)
            .await
    }

    /// Install the fixed catalog (the bulk-install operation). Same
    /// semantics as `install`, with the larger first-run budget.
    pub async fn install_catalog(&self, workdir: &Path) -> InstallReport {
        self.upgrade_bootstrap(workdir).await;
        let catalog = self.config.install_catalog.clone();
        self.install_with_budget(&catalog, workdir, self.config.catalog_timeout)
            .await
    }

    /// Best-effort pip self-upgrade. A stale installer never aborts a run.
    async fn upgrade_bootstrap(&self, workdir: &Path) {
        let args = pip_args(&["install", "--upgrade", "pip"]);
        let outcome = self
            .runner
            .run_command(
                &self.config.python_path,
                &args,
                workdir,
                self.config.bootstrap_timeout,
            )
            .await;
        if !outcome.success() {
            warn!(
                stderr = %truncate(&outcome.stderr, 400),
                "pip self-upgrade failed, continuing with current version"
            );
        }
    }

    async fn install_with_budget(
        &self,
        packages: &[String],
        workdir: &Path,
        bulk_timeout: Duration,
    ) -> InstallReport {
        info!(?packages, "installing packages");

        let mut args = pip_args(&["install", "--user", "--prefer-binary"]);
        args.extend(packages.iter().cloned());
        let bulk = self
            .runner
            .run_command(&self.config.python_path, &args, workdir, bulk_timeout)
            .await;

        if bulk.success() {
            return InstallReport {
                installed: packages.to_vec(),
                failed: Vec::new(),
                output: bulk.stdout,
                advisory: None,
            };
        }

        warn!(
            exit_code = ?bulk.exit_code,
            "bulk install failed, retrying packages individually"
        );

        let mut report = InstallReport {
            output: bulk.stdout,
            ..Default::default()
        };
        for package in packages {
            let mut args = pip_args(&["install", "--user", "--prefer-binary"]);
            args.push(package.clone());
            let single = self
                .runner
                .run_command(
                    &self.config.python_path,
                    &args,
                    workdir,
                    self.config.package_timeout,
                )
                .await;
            if !single.stdout.is_empty() {
                report.output.push('\n');
                report.output.push_str(&single.stdout);
            }
            if single.success() {
                report.installed.push(package.clone());
            } else {
                warn!(package, exit_code = ?single.exit_code, "package install failed");
                report.failed.push(package.clone());
            }
        }

        if !report.failed.is_empty() {
            report.advisory = Some(format!(
                "Warning: could not install {}. The program will run anyway and may fail with its own import error.",
                report.failed.join(", ")
            ));
        }
        report
    }
}

/// `python -m pip` rather than a bare `pip` binary, which may not be on the
/// path on every platform.
fn pip_args(tail: &[&str]) -> Vec<String> {
    let mut args = vec!["-m".to_string(), "pip".to_string()];
    args.extend(tail.iter().map(|s| s.to_string()));
    args
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
