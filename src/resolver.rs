use crate::config::{AliasMapping, SandboxConfig};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// One alias-table entry with its scan patterns precompiled.
struct CompiledAlias {
    mapping: AliasMapping,
    bare: Regex,
    import: Regex,
}

impl CompiledAlias {
    fn new(mapping: AliasMapping) -> Self {
        let alias = regex::escape(mapping.alias);
        let bare = Regex::new(&format!(r"\b{}\b", alias)).expect("valid regex");
        let import =
            Regex::new(&format!(r"(?m)^\s*(?:import|from)\s+{}\b", alias)).expect("valid regex");
        Self {
            mapping,
            bare,
            import,
        }
    }

    /// A bare word-boundary mention of the alias, or an explicit
    /// `import`/`from` line.
    fn mentions(&self, code: &str) -> bool {
        self.bare.is_match(code) || self.import.is_match(code)
    }
}

/// Detects which installable packages a program appears to need but that
/// are not currently importable by the host interpreter.
///
/// This is a heuristic over source text, not a parser: an alias mentioned
/// in a comment or string still triggers an importability probe, and
/// dynamically built imports are invisible to it. The install step it feeds
/// only needs a safe-to-retry guess, so both kinds of error are acceptable.
pub struct DependencyResolver {
    python_path: PathBuf,
    import_check_timeout: Duration,
    table: Vec<CompiledAlias>,
}

impl DependencyResolver {
    /// Compiles the patterns for the whole alias table up front; build one
    /// resolver next to the runner and reuse it across executions.
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            python_path: config.python_path.clone(),
            import_check_timeout: config.import_check_timeout,
            table: config
                .alias_table
                .iter()
                .cloned()
                .map(CompiledAlias::new)
                .collect(),
        }
    }

    /// Distinct package names the program mentions but cannot import.
    /// Empty is valid and common.
    pub async fn missing_packages(&self, code: &str) -> Vec<String> {
        let mut missing = Vec::new();
        let mut seen_packages = HashSet::new();
        let mut probed_modules: HashSet<&str> = HashSet::new();
        let mut importable_modules: HashSet<&str> = HashSet::new();

        for entry in &self.table {
            let mapping = &entry.mapping;
            if seen_packages.contains(mapping.package) {
                continue;
            }
            if !entry.mentions(code) {
                continue;
            }
            // Multiple aliases share a module; probe each module once.
            if probed_modules.insert(mapping.module) {
                if self.is_importable(mapping.module).await {
                    importable_modules.insert(mapping.module);
                }
            }
            if importable_modules.contains(mapping.module) {
                continue;
            }
            debug!(
                alias = mapping.alias,
                package = mapping.package,
                "detected missing dependency"
            );
            seen_packages.insert(mapping.package);
            missing.push(mapping.package.to_string());
        }

        missing
    }

    /// Probe the host interpreter for a module. Spawn problems count as
    /// importable so a broken interpreter does not trigger pointless
    /// installs; the run itself will surface the real failure.
    pub async fn is_importable(&self, module: &str) -> bool {
        let probe = Command::new(&self.python_path)
            .arg("-c")
            .arg(format!("import {}", module))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.import_check_timeout, probe).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                warn!(module, error = %e, "import probe could not run");
                true
            }
            Err(_) => {
                warn!(module, "import probe timed out");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::path::PathBuf;

    fn offline_resolver() -> DependencyResolver {
        DependencyResolver::new(&SandboxConfig::with_python_path(PathBuf::from("python3")))
    }

    fn entry<'a>(resolver: &'a DependencyResolver, alias: &str) -> &'a CompiledAlias {
        resolver
            .table
            .iter()
            .find(|c| c.mapping.alias == alias)
            .unwrap()
    }

    #[test]
    fn pattern_matches_import_forms() {
        let resolver = offline_resolver();
        let pd = entry(&resolver, "pd");

        assert!(pd.mentions("import pandas as pd"));
        assert!(pd.mentions("x = pd.DataFrame()"));
        assert!(pd.mentions("from pd import thing"));
        // Word boundary: no substring matches.
        assert!(!pd.mentions("spd = 3"));
        assert!(!pd.mentions("update(x)"));
    }

    #[test]
    fn comment_mentions_still_trigger() {
        // Known false positive, intentional.
        let resolver = offline_resolver();
        assert!(entry(&resolver, "np").mentions("# try np here later"));
    }

    #[test]
    fn whole_table_compiles_at_construction() {
        let resolver = offline_resolver();
        assert_eq!(
            resolver.table.len(),
            crate::config::default_alias_table().len()
        );
    }

    #[tokio::test]
    async fn unimportable_modules_dedupe_to_one_package() {
        let Ok(config) = SandboxConfig::new() else {
            return;
        };
        let resolver = DependencyResolver::new(&config);
        // Both aliases map to pandas; the package must appear once.
        let missing = resolver
            .missing_packages("import pandas as pd\npd.read_csv('x')")
            .await;
        assert!(missing.iter().filter(|p| *p == "pandas").count() <= 1);
    }

    #[tokio::test]
    async fn canonical_alias_tracks_interpreter_state() {
        let Ok(config) = SandboxConfig::new() else {
            return;
        };
        let resolver = DependencyResolver::new(&config);
        let missing = resolver
            .missing_packages("import pandas as pd\nprint(pd)")
            .await;
        if resolver.is_importable("pandas").await {
            assert!(!missing.contains(&"pandas".to_string()));
        } else {
            assert!(missing.contains(&"pandas".to_string()));
        }
    }

    #[tokio::test]
    async fn unrelated_code_yields_empty_set() {
        let Ok(config) = SandboxConfig::new() else {
            return;
        };
        let resolver = DependencyResolver::new(&config);
        let missing = resolver.missing_packages("print(1 + 1)").await;
        assert!(missing.is_empty());
    }
}
