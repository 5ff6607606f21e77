use crate::config::SandboxConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Terminal states of a subprocess run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The process exited on its own (any exit code).
    Completed,
    /// The wall-clock budget expired and the process was killed.
    TimedOut,
    /// The binary could not be launched at all.
    SpawnFailed,
}

/// Everything collected from one subprocess run. Output captured before a
/// timeout kill is preserved.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed && self.exit_code == Some(0)
    }

    fn spawn_failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            status: RunStatus::SpawnFailed,
            exit_code: None,
        }
    }
}

/// Which graphical libraries a piece of source text appears to use.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphicsUse {
    /// matplotlib / pyplot: gets a headless backend forced.
    pub plotting: bool,
    /// General GUI toolkits: allowed a real display, but teardown is
    /// asynchronous so the runner waits before returning.
    pub gui: bool,
}

impl GraphicsUse {
    pub fn any(&self) -> bool {
        self.plotting || self.gui
    }
}

/// Same heuristic text scan the dependency resolver uses: word-boundary
/// mentions, comments and strings included.
pub fn detect_graphics(code: &str) -> GraphicsUse {
    use regex::Regex;
    use std::sync::OnceLock;

    static PLOTTING: OnceLock<Regex> = OnceLock::new();
    static GUI: OnceLock<Regex> = OnceLock::new();

    let plotting = PLOTTING
        .get_or_init(|| Regex::new(r"\b(matplotlib|pyplot|plt)\b").expect("valid regex"));
    let gui = GUI.get_or_init(|| {
        Regex::new(r"\b(tkinter|Tkinter|PyQt5|PySide2|pygame|turtle|PySimpleGUI)\b")
            .expect("valid regex")
    });

    GraphicsUse {
        plotting: plotting.is_match(code),
        gui: gui.is_match(code),
    }
}

/// Spawns interpreter subprocesses with a controlled environment, streams
/// output incrementally, and enforces wall-clock timeouts with a forced
/// kill.
pub struct ProcessRunner {
    python_path: PathBuf,
    graphics_settle: Duration,
}

impl ProcessRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            python_path: config.python_path.clone(),
            graphics_settle: config.graphics_settle,
        }
    }

    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    /// Execute a script of Python text in `workdir`.
    ///
    /// The child environment forces UTF-8 I/O and strips any inherited
    /// override of the user site-packages location, so packages installed by
    /// the installer stay importable. Plotting code gets a non-interactive
    /// backend; general GUI code keeps its display but earns the settle
    /// delay after exit.
    pub async fn run_script(&self, script: &str, workdir: &Path, timeout: Duration) -> RunOutcome {
        let graphics = detect_graphics(script);

        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-c").arg(script).current_dir(workdir);
        if graphics.plotting {
            cmd.env("MPLBACKEND", "Agg");
        }
        self.run(cmd, timeout, graphics.any()).await
    }

    /// Execute an arbitrary program (pip, allow-listed utilities) in
    /// `workdir` under the same environment and timeout rules.
    pub async fn run_command(
        &self,
        program: &Path,
        args: &[String],
        workdir: &Path,
        timeout: Duration,
    ) -> RunOutcome {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        self.run(cmd, timeout, false).await
    }

    async fn run(&self, mut cmd: Command, timeout: Duration, settle: bool) -> RunOutcome {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .env_remove("PYTHONNOUSERSITE")
            .env_remove("PYTHONUSERBASE")
            .kill_on_drop(true);

        // New process group so a timeout kill takes child processes with it.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to spawn interpreter");
                return RunOutcome::spawn_failed(format!("Failed to start process: {}", e));
            }
        };
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child.stdout.take().map(|r| drain(r, stdout_buf.clone()));
        let stderr_task = child.stderr.take().map(|r| drain(r, stderr_buf.clone()));

        let (status, exit_code) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(exit)) => {
                join_readers(stdout_task, stderr_task).await;
                if settle {
                    // Give window/backend teardown a moment before reading
                    // the buffers as final.
                    tokio::time::sleep(self.graphics_settle).await;
                }
                (RunStatus::Completed, exit.code())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "waiting on child failed");
                join_readers(stdout_task, stderr_task).await;
                (RunStatus::SpawnFailed, None)
            }
            Err(_) => {
                info!(timeout_secs = timeout.as_secs(), "killing timed-out process");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                let _ = child.kill().await;
                join_readers(stdout_task, stderr_task).await;
                (RunStatus::TimedOut, None)
            }
        };

        let stdout = String::from_utf8_lossy(stdout_buf.lock().await.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(stderr_buf.lock().await.as_slice()).into_owned();

        RunOutcome {
            stdout,
            stderr,
            status,
            exit_code,
        }
    }
}

/// Append chunks to the shared buffer as they arrive, so partial output
/// survives a later kill.
fn drain<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

async fn join_readers(stdout: Option<JoinHandle<()>>, stderr: Option<JoinHandle<()>>) {
    // The pipes hit EOF once the process (group) is gone; the extra timeout
    // guards against a straggler grandchild holding the write end open.
    for task in [stdout, stderr].into_iter().flatten() {
        let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::time::Instant;

    fn config() -> Option<SandboxConfig> {
        SandboxConfig::new().ok()
    }

    #[test]
    fn graphics_detection() {
        let plot = detect_graphics("import matplotlib.pyplot as plt\nplt.plot([1])");
        assert!(plot.plotting);
        assert!(!plot.gui);

        let gui = detect_graphics("import tkinter\ntkinter.Tk()");
        assert!(gui.gui);
        assert!(!gui.plotting);

        assert!(!detect_graphics("print('hello')").any());
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let Some(config) = config() else { return };
        let runner = ProcessRunner::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let outcome = runner
            .run_script("print('hello')", dir.path(), Duration::from_secs(30))
            .await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_completed_not_error() {
        let Some(config) = config() else { return };
        let runner = ProcessRunner::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let outcome = runner
            .run_script("import sys\nsys.exit(3)", dir.path(), Duration::from_secs(30))
            .await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let Some(config) = config() else { return };
        let runner = ProcessRunner::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let started = Instant::now();
        let outcome = runner
            .run_script(
                "print('early', flush=True)\nimport time\ntime.sleep(60)",
                dir.path(),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(outcome.stdout.contains("early"));
        // timeout + small epsilon, never the full sleep
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let config =
            SandboxConfig::with_python_path(PathBuf::from("/nonexistent/python-binary"));
        let runner = ProcessRunner::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let outcome = runner
            .run_script("print('x')", dir.path(), Duration::from_secs(5))
            .await;
        assert_eq!(outcome.status, RunStatus::SpawnFailed);
        assert!(outcome.stderr.contains("Failed to start process"));
    }
}
