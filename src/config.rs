use crate::errors::{Result, SandboxError};
use std::path::PathBuf;
use std::time::Duration;

/// A recognizable import token and the pip package that provides it.
///
/// `alias` is the token scanned for in user code (e.g. `pd`), `module` is
/// the name used for the importability probe (e.g. `pandas`), and `package`
/// is what gets handed to pip (e.g. `pandas` or `scikit-learn`). Several
/// aliases may map to the same package.
#[derive(Debug, Clone)]
pub struct AliasMapping {
    pub alias: &'static str,
    pub module: &'static str,
    pub package: &'static str,
}

/// Configuration for the execution sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Path to the Python executable.
    pub python_path: PathBuf,
    /// Root directory under which per-project working directories live.
    pub uploads_root: PathBuf,
    /// Directory additionally swept for stray output files, for programs
    /// that write relative to the process launch directory instead of the
    /// project directory. `None` means the actual launch directory.
    pub launch_dir: Option<PathBuf>,
    /// Wall-clock budget for a single script or terminal command.
    pub execute_timeout: Duration,
    /// Wall-clock budget for a bulk pip install.
    pub install_timeout: Duration,
    /// Wall-clock budget for one package in the individual-retry fallback.
    pub package_timeout: Duration,
    /// Wall-clock budget for the best-effort pip self-upgrade.
    pub bootstrap_timeout: Duration,
    /// Wall-clock budget for the fixed-catalog bulk install.
    pub catalog_timeout: Duration,
    /// Wall-clock budget for a single `import <module>` probe.
    pub import_check_timeout: Duration,
    /// Extra wait after a graphical program exits, so asynchronous backend
    /// teardown does not truncate output.
    pub graphics_settle: Duration,
    /// Token-to-package table driving dependency detection.
    pub alias_table: Vec<AliasMapping>,
    /// Fixed package catalog for the bulk-install operation.
    pub install_catalog: Vec<String>,
}

impl SandboxConfig {
    /// Build a config with the interpreter discovered on PATH.
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;
        Ok(Self::with_python_path(python_path))
    }

    /// Build a config with an explicit interpreter path.
    pub fn with_python_path(python_path: PathBuf) -> Self {
        Self {
            python_path,
            uploads_root: std::env::temp_dir().join("pycell-uploads"),
            launch_dir: None,
            execute_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(600),
            package_timeout: Duration::from_secs(300),
            bootstrap_timeout: Duration::from_secs(60),
            catalog_timeout: Duration::from_secs(900),
            import_check_timeout: Duration::from_secs(10),
            graphics_settle: Duration::from_secs(1),
            alias_table: default_alias_table(),
            install_catalog: default_install_catalog(),
        }
    }

    /// Override the uploads root (useful for tests and embedding hosts).
    pub fn with_uploads_root(mut self, root: PathBuf) -> Self {
        self.uploads_root = root;
        self
    }

    /// Pin the stray-output sweep to a specific directory.
    pub fn with_launch_dir(mut self, dir: PathBuf) -> Self {
        self.launch_dir = Some(dir);
        self
    }

    /// Override the default execution timeout.
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }
}

/// Common import tokens in learner code and the packages that provide them.
pub fn default_alias_table() -> Vec<AliasMapping> {
    fn m(alias: &'static str, module: &'static str, package: &'static str) -> AliasMapping {
        AliasMapping {
            alias,
            module,
            package,
        }
    }

    vec![
        m("numpy", "numpy", "numpy"),
        m("np", "numpy", "numpy"),
        m("pandas", "pandas", "pandas"),
        m("pd", "pandas", "pandas"),
        m("matplotlib", "matplotlib", "matplotlib"),
        m("plt", "matplotlib", "matplotlib"),
        m("seaborn", "seaborn", "seaborn"),
        m("sns", "seaborn", "seaborn"),
        m("sklearn", "sklearn", "scikit-learn"),
        m("scipy", "scipy", "scipy"),
        m("cv2", "cv2", "opencv-python"),
        m("requests", "requests", "requests"),
        m("bs4", "bs4", "beautifulsoup4"),
        m("tensorflow", "tensorflow", "tensorflow"),
        m("tf", "tensorflow", "tensorflow"),
        m("torch", "torch", "torch"),
        m("PIL", "PIL", "pillow"),
        m("flask", "flask", "flask"),
        m("django", "django", "django"),
        m("openpyxl", "openpyxl", "openpyxl"),
        m("plotly", "plotly", "plotly"),
        m("statsmodels", "statsmodels", "statsmodels"),
    ]
}

/// The fixed catalog installed by the bulk-install operation. Not
/// caller-supplied; this is the "everything a beginner course needs" set.
pub fn default_install_catalog() -> Vec<String> {
    [
        "numpy",
        "pandas",
        "matplotlib",
        "seaborn",
        "scikit-learn",
        "scipy",
        "requests",
        "beautifulsoup4",
        "openpyxl",
        "pillow",
        "plotly",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
