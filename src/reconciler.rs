use crate::config::SandboxConfig;
use crate::session::SessionBuilder;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

/// A file the executed program created that the caller did not previously
/// know about. Content is best-effort text; binary or unreadable files come
/// back with empty content and their on-disk size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub name: String,
    pub content: String,
    pub size: u64,
    pub path: String,
}

/// Persistence seam for newly detected files. The backing project-files
/// store lives in the host application; a failure to record metadata must
/// never keep a file out of the caller's result.
#[async_trait]
pub trait FileMetadataStore: Send + Sync {
    async fn record_file(
        &self,
        project_id: &str,
        file: &NewFile,
    ) -> std::result::Result<(), String>;
}

/// Store that persists nothing. The default for embedders that merge files
/// into their own tree and persist elsewhere.
pub struct NullMetadataStore;

#[async_trait]
impl FileMetadataStore for NullMetadataStore {
    async fn record_file(
        &self,
        _project_id: &str,
        _file: &NewFile,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Output extensions also checked in the process launch directory, for
/// programs that write relative to the wrong base directory.
const OUTPUT_EXTENSIONS: &[&str] = &[
    "csv", "txt", "json", "png", "jpg", "jpeg", "xlsx", "html", "pdf",
];

/// Diffs a project's working directory against the caller's known file set
/// after a run and returns every newly observed file.
pub struct FilesystemReconciler<'a> {
    config: &'a SandboxConfig,
}

impl<'a> FilesystemReconciler<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self { config }
    }

    /// Every file in the project's working directory (plus recognizable
    /// outputs in the launch directory) that is not in `existing`. Each hit
    /// is offered to `store`; persistence failures are logged and the file
    /// is returned regardless so the caller's view stays consistent.
    pub async fn detect_new_files(
        &self,
        project_id: &str,
        existing: &[String],
        store: &dyn FileMetadataStore,
    ) -> Vec<NewFile> {
        let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
        let working_dir = self
            .config
            .uploads_root
            .join(SessionBuilder::directory_key(Some(project_id)));

        let mut found = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for name in list_files(&working_dir) {
            if self.is_candidate(&name, &known) && seen.insert(name.clone()) {
                found.push(read_new_file(&working_dir, &name).await);
            }
        }

        // Some programs write relative to the process launch directory
        // instead of the project directory; sweep it for recognizable
        // output extensions so those files are not lost.
        let launch_dir = self
            .config
            .launch_dir
            .clone()
            .or_else(|| std::env::current_dir().ok());
        if let Some(launch_dir) = launch_dir {
            if launch_dir != working_dir {
                for name in list_files(&launch_dir) {
                    if has_output_extension(&name)
                        && self.is_candidate(&name, &known)
                        && seen.insert(name.clone())
                    {
                        found.push(read_new_file(&launch_dir, &name).await);
                    }
                }
            }
        }

        for file in &found {
            if let Err(e) = store.record_file(project_id, file).await {
                error!(name = %file.name, error = %e, "failed to persist file metadata");
            }
        }

        found
    }

    fn is_candidate(&self, name: &str, known: &HashSet<&str>) -> bool {
        if name.starts_with('.') || known.contains(name) {
            return false;
        }
        // Timestamp-prefixed names are raw uploads. Treat one as already
        // known when the caller knows it under its unprefixed name too;
        // only a genuinely absent upload is surfaced.
        if let Some(rest) = upload_remainder(name) {
            if known.contains(rest) {
                debug!(name, "skipping timestamp-prefixed upload");
                return false;
            }
        }
        true
    }
}

/// `1700000000000_input.csv` -> `input.csv` for names carrying a
/// millisecond-timestamp upload prefix.
fn upload_remainder(name: &str) -> Option<&str> {
    static UPLOAD_PREFIX: OnceLock<Regex> = OnceLock::new();
    let re = UPLOAD_PREFIX.get_or_init(|| Regex::new(r"^\d{13}_(.+)$").expect("valid regex"));
    re.captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn has_output_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            OUTPUT_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

fn list_files(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list directory");
            return Vec::new();
        }
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect()
}

async fn read_new_file(dir: &Path, name: &str) -> NewFile {
    let path = dir.join(name);
    let size = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    // Binary or unreadable content degrades to empty, never drops the file.
    let content = match tokio::fs::read(&path).await {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!(name, "file is not valid UTF-8, returning empty content");
                String::new()
            }
        },
        Err(e) => {
            warn!(name, error = %e, "could not read detected file");
            String::new()
        }
    };
    NewFile {
        name: name.to_string(),
        content,
        size,
        path: path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(root: &Path) -> SandboxConfig {
        let launch = root.join("launch");
        std::fs::create_dir_all(&launch).unwrap();
        SandboxConfig::with_python_path(PathBuf::from("python3"))
            .with_uploads_root(root.to_path_buf())
            .with_launch_dir(launch)
    }

    fn project_dir(config: &SandboxConfig, project: &str) -> PathBuf {
        let dir = config.uploads_root.join(project);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileMetadataStore for FailingStore {
        async fn record_file(
            &self,
            _project_id: &str,
            _file: &NewFile,
        ) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("backend unavailable".to_string())
        }
    }

    #[tokio::test]
    async fn known_uploads_are_excluded() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p1");
        std::fs::write(dir.join("1700000000000_input.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(dir.join("output.csv"), "c,d\n3,4\n").unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files(
                "p1",
                &["1700000000000_input.csv".to_string()],
                &NullMetadataStore,
            )
            .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "output.csv");
        assert_eq!(found[0].content, "c,d\n3,4\n");
        assert_eq!(found[0].size, 8);
    }

    #[tokio::test]
    async fn upload_known_by_unprefixed_name_is_excluded() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p2");
        std::fs::write(dir.join("1700000000000_data.csv"), "x\n").unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files("p2", &["data.csv".to_string()], &NullMetadataStore)
            .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unknown_upload_is_still_surfaced() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p3");
        std::fs::write(dir.join("1700000000000_orphan.csv"), "x\n").unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files("p3", &[], &NullMetadataStore)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "1700000000000_orphan.csv");
    }

    #[tokio::test]
    async fn binary_files_come_back_with_empty_content() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p4");
        std::fs::write(dir.join("chart.png"), [0xffu8, 0xfe, 0x00, 0x01]).unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files("p4", &[], &NullMetadataStore)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "");
        assert_eq!(found[0].size, 4);
    }

    #[tokio::test]
    async fn store_failure_does_not_drop_results() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p5");
        std::fs::write(dir.join("a.txt"), "a").unwrap();
        std::fs::write(dir.join("b.txt"), "b").unwrap();

        let store = FailingStore {
            calls: AtomicUsize::new(0),
        };
        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler.detect_new_files("p5", &[], &store).await;

        assert_eq!(found.len(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dotfiles_and_directories_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let dir = project_dir(&config, "p6");
        std::fs::write(dir.join(".hidden"), "x").unwrap();
        std::fs::create_dir(dir.join("subdir")).unwrap();
        std::fs::write(dir.join("real.txt"), "x").unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files("p6", &[], &NullMetadataStore)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "real.txt");
    }

    #[tokio::test]
    async fn launch_directory_outputs_are_swept() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        project_dir(&config, "p7");
        let launch = config.launch_dir.clone().unwrap();
        std::fs::write(launch.join("stray.csv"), "1\n").unwrap();
        std::fs::write(launch.join("README"), "no extension").unwrap();

        let reconciler = FilesystemReconciler::new(&config);
        let found = reconciler
            .detect_new_files("p7", &[], &NullMetadataStore)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "stray.csv");
    }
}
