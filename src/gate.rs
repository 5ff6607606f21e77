use crate::config::SandboxConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// A single command line submitted from the interactive terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRequest {
    pub command: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Terminal outcome shapes: normal completion, the 408-equivalent timeout,
/// or the 403-equivalent rejection enumerating what is allowed.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TerminalResult {
    #[serde(rename_all = "camelCase")]
    Completed {
        success: bool,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        exit_code: i32,
    },
    /// Output captured before the kill is preserved, same as on the
    /// execute path.
    #[serde(rename_all = "camelCase")]
    TimedOut {
        success: bool,
        output: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        success: bool,
        error: String,
        allowed: Vec<String>,
    },
}

/// Bookkeeping seam for successful installs: the most recent spec string
/// per (project, user, package). Owned by the host application's storage;
/// mutated only as a side effect of installs and never read back here.
#[async_trait]
pub trait PackageLedger: Send + Sync {
    async fn record_install(
        &self,
        project_id: &str,
        user_id: &str,
        package: &str,
        spec: &str,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), String>;
}

/// Ledger that records nothing.
pub struct NullLedger;

#[async_trait]
impl PackageLedger for NullLedger {
    async fn record_install(
        &self,
        _project_id: &str,
        _user_id: &str,
        _package: &str,
        _spec: &str,
        _at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// What the gate decided about one command line.
#[derive(Debug, Clone)]
pub enum CommandVerdict {
    Allowed {
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        /// Package spec strings when this is an install command, for the
        /// ledger upsert after a successful run.
        installs: Vec<String>,
    },
    Rejected {
        allowed: Vec<String>,
    },
}

/// The human-readable allow-list enumerated in every rejection.
pub fn allowed_commands() -> Vec<String> {
    [
        "pip install|uninstall|list|show|freeze [packages]",
        "python --version | --help | -m <module>",
        "ls, pwd, echo, cat, whoami, date",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// Anchored patterns with restricted argument charsets; shell metacharacters
// can never match, so compound commands and redirection are rejected whole.
fn pip_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:pip3?|python3?\s+-m\s+pip)\s+(install|uninstall|list|show|freeze)((?:\s+[A-Za-z0-9_.,\[\]=<>!~-]+)*)\s*$",
        )
        .expect("valid regex")
    })
}

fn python_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^python3?\s+(--version|--help|-m\s+[A-Za-z0-9_.]+(?:\s+[A-Za-z0-9_.=/-]+)*)\s*$")
            .expect("valid regex")
    })
}

fn utility_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(ls|pwd|whoami|date|echo|cat|dir|type)((?:\s+[A-Za-z0-9_./-]+)*)\s*$")
            .expect("valid regex")
    })
}

/// Shell builtins with no standalone executable on Windows; routed through
/// the native command shell there.
const WINDOWS_BUILTINS: &[&str] = &["dir", "type", "echo"];

/// Mediates the interactive terminal's access to the package manager and a
/// short list of inert, read-only utilities. Closed allow-list: no partial
/// matches, no fuzzy allowance.
pub struct CommandGate {
    python_path: PathBuf,
    execute_timeout: Duration,
    install_timeout: Duration,
}

impl CommandGate {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            python_path: config.python_path.clone(),
            execute_timeout: config.execute_timeout,
            install_timeout: config.install_timeout,
        }
    }

    pub fn evaluate(&self, command: &str) -> CommandVerdict {
        let command = normalize(command);

        if let Some(caps) = pip_pattern().captures(&command) {
            let subcommand = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            return self.rewrite_pip(subcommand, rest);
        }

        if let Some(caps) = python_pattern().captures(&command) {
            let tail = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let args = tail.split_whitespace().map(str::to_string).collect();
            return CommandVerdict::Allowed {
                program: self.python_path.clone(),
                args,
                timeout: self.execute_timeout,
                installs: Vec::new(),
            };
        }

        if let Some(caps) = utility_pattern().captures(&command) {
            let utility = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            return self.route_utility(utility, rest, &command);
        }

        debug!(command, "rejected terminal command");
        CommandVerdict::Rejected {
            allowed: allowed_commands(),
        }
    }

    /// Rewrite accepted pip commands to the module-invocation form, forcing
    /// the per-user install target for installs.
    fn rewrite_pip(&self, subcommand: &str, rest: &str) -> CommandVerdict {
        let tail: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
        let mut args = vec!["-m".to_string(), "pip".to_string(), subcommand.to_string()];
        let mut installs = Vec::new();

        match subcommand {
            "install" => {
                args.push("--user".to_string());
                for item in &tail {
                    if !item.starts_with('-') {
                        installs.push(item.clone());
                    }
                    args.push(item.clone());
                }
            }
            "uninstall" => {
                // Non-interactive; the terminal has no stdin to confirm on.
                args.push("-y".to_string());
                args.extend(tail);
            }
            _ => args.extend(tail),
        }

        let timeout = if subcommand == "install" {
            self.install_timeout
        } else {
            self.execute_timeout
        };
        CommandVerdict::Allowed {
            program: self.python_path.clone(),
            args,
            timeout,
            installs,
        }
    }

    fn route_utility(&self, utility: &str, rest: &str, full: &str) -> CommandVerdict {
        if WINDOWS_BUILTINS.contains(&utility) && cfg!(windows) {
            // Not standalone executables there; hand the whole line to the
            // native shell.
            return CommandVerdict::Allowed {
                program: PathBuf::from("cmd"),
                args: vec!["/C".to_string(), full.to_string()],
                timeout: self.execute_timeout,
                installs: Vec::new(),
            };
        }
        if (utility == "dir" || utility == "type") && !cfg!(windows) {
            return CommandVerdict::Rejected {
                allowed: allowed_commands(),
            };
        }
        CommandVerdict::Allowed {
            program: PathBuf::from(utility),
            args: rest.split_whitespace().map(str::to_string).collect(),
            timeout: self.execute_timeout,
            installs: Vec::new(),
        }
    }
}

fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Package name from a spec string, for ledger keys:
/// `pandas==2.1` -> `pandas`, `requests[socks]>=2` -> `requests`.
pub fn package_name(spec: &str) -> &str {
    let end = spec
        .find(|c| ['=', '<', '>', '!', '~', '['].contains(&c))
        .unwrap_or(spec.len());
    &spec[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn gate() -> CommandGate {
        let config = SandboxConfig::with_python_path(PathBuf::from("/usr/bin/python3"));
        CommandGate::new(&config)
    }

    fn assert_rejected(verdict: &CommandVerdict) {
        match verdict {
            CommandVerdict::Rejected { allowed } => assert!(!allowed.is_empty()),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn destructive_and_network_commands_are_rejected() {
        let gate = gate();
        assert_rejected(&gate.evaluate("rm -rf /"));
        assert_rejected(&gate.evaluate("curl http://evil"));
        assert_rejected(&gate.evaluate("pip install --upgrade pip; rm -rf /"));
        assert_rejected(&gate.evaluate("python -c 'print(1)'"));
        assert_rejected(&gate.evaluate("pip install requests && curl http://evil"));
        assert_rejected(&gate.evaluate("echo hi > /etc/passwd"));
    }

    #[test]
    fn allow_listed_commands_are_accepted() {
        let gate = gate();
        for command in ["pip install requests", "pip list", "python --version", "echo hi"] {
            match gate.evaluate(command) {
                CommandVerdict::Allowed { .. } => {}
                other => panic!("expected {:?} accepted, got {:?}", command, other),
            }
        }
    }

    #[test]
    fn install_is_rewritten_to_user_scoped_module_form() {
        let gate = gate();
        match gate.evaluate("pip install requests pandas==2.1") {
            CommandVerdict::Allowed {
                program,
                args,
                timeout,
                installs,
            } => {
                assert_eq!(program, PathBuf::from("/usr/bin/python3"));
                assert_eq!(args[..4], ["-m", "pip", "install", "--user"].map(String::from));
                assert!(args.contains(&"requests".to_string()));
                assert!(args.contains(&"pandas==2.1".to_string()));
                assert_eq!(installs, vec!["requests", "pandas==2.1"]);
                assert_eq!(timeout, Duration::from_secs(600));
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn uninstall_gets_non_interactive_flag() {
        let gate = gate();
        match gate.evaluate("pip uninstall requests") {
            CommandVerdict::Allowed { args, installs, .. } => {
                assert!(args.contains(&"-y".to_string()));
                assert!(installs.is_empty());
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn module_form_pip_is_also_recognized() {
        let gate = gate();
        match gate.evaluate("python -m pip freeze") {
            CommandVerdict::Allowed { args, .. } => {
                assert_eq!(args, ["-m", "pip", "freeze"].map(String::from).to_vec());
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn python_module_invocation_is_accepted() {
        let gate = gate();
        match gate.evaluate("python -m venv env1") {
            CommandVerdict::Allowed { program, args, .. } => {
                assert_eq!(program, PathBuf::from("/usr/bin/python3"));
                assert_eq!(args, ["-m", "venv", "env1"].map(String::from).to_vec());
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn windows_builtins_are_rejected_elsewhere() {
        if cfg!(windows) {
            return;
        }
        let gate = gate();
        assert_rejected(&gate.evaluate("dir"));
        assert_rejected(&gate.evaluate("type notes.txt"));
    }

    #[test]
    fn package_name_strips_version_qualifiers() {
        assert_eq!(package_name("pandas==2.1"), "pandas");
        assert_eq!(package_name("requests[socks]>=2"), "requests");
        assert_eq!(package_name("numpy"), "numpy");
    }

    #[test]
    fn rejection_shape_serializes_allowed_list() {
        let result = TerminalResult::Rejected {
            success: false,
            error: "Command not allowed".to_string(),
            allowed: allowed_commands(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["allowed"].as_array().unwrap().len() >= 3);
    }
}
