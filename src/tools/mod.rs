//! External tool invocation.
//!
//! Every external-tool stage is a subprocess `<program> <args>` whose
//! stdout and stderr are redirected into a per-stage log file. The caller's
//! environment is inherited unchanged. The exit code is reported as-is;
//! deciding whether the stage actually succeeded is the stage runner's job.
//!
//! Arguments are templates. Supported placeholders:
//!
//! - `{subject}`, `{center}`
//! - `{output_dir}`, `{work_dir}`
//! - `{threads}`: per-subject thread budget for the tool
//! - `{input.<name>}`: a located raw input, `None` when absent

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors that can occur while invoking a tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// An argument references a placeholder that has no value.
    #[error("Unknown placeholder '{{{0}}}' in tool arguments")]
    UnknownPlaceholder(String),

    /// The log file could not be created.
    #[error("Failed to open log file {path}: {source}")]
    Log {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed.
    #[error("Process error: {0}")]
    Wait(#[from] std::io::Error),
}

/// An external tool command line, before placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    /// Program to execute. A bare name is looked up on `PATH`; a relative
    /// path is resolved against the configured tool root.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Creates a new tool command.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Resolves the program against `tool_root` when it is a relative path.
    pub fn resolve_program(&self, tool_root: &Path) -> String {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            tool_root.join(program).display().to_string()
        } else {
            self.program.clone()
        }
    }

    /// Substitutes placeholders in every argument.
    pub fn render(&self, vars: &TemplateVars) -> Result<Vec<String>, ToolError> {
        self.args.iter().map(|arg| vars.render(arg)).collect()
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("placeholder regex is valid"))
}

/// Values available to argument templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    /// Creates an empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets a path variable.
    pub fn with_path(self, key: impl Into<String>, path: &Path) -> Self {
        self.with(key, path.display().to_string())
    }

    /// Replaces every `{name}` in `template`.
    pub fn render(&self, template: &str) -> Result<String, ToolError> {
        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;
        for caps in placeholder_regex().captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .values
                .get(name.as_str())
                .ok_or_else(|| ToolError::UnknownPlaceholder(name.as_str().to_string()))?;
            rendered.push_str(&template[last..whole.start()]);
            rendered.push_str(value);
            last = whole.end();
        }
        rendered.push_str(&template[last..]);
        Ok(rendered)
    }
}

/// A fully rendered invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the process.
    pub working_dir: PathBuf,
    /// File receiving both stdout and stderr (truncated first).
    pub log_path: PathBuf,
}

/// How a tool process ended.
#[derive(Debug, Clone)]
pub struct ToolExit {
    /// Exit code, `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub duration: Duration,
}

impl ToolExit {
    /// Checks if the process exited with code 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a tool to completion with output redirected into its log file.
pub async fn run_tool(invocation: &ToolInvocation) -> Result<ToolExit, ToolError> {
    let start = Instant::now();

    if let Some(parent) = invocation.log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ToolError::Log {
            path: invocation.log_path.display().to_string(),
            source,
        })?;
    }
    let log = File::create(&invocation.log_path).map_err(|source| ToolError::Log {
        path: invocation.log_path.display().to_string(),
        source,
    })?;
    let log_err = log.try_clone().map_err(|source| ToolError::Log {
        path: invocation.log_path.display().to_string(),
        source,
    })?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    info!(
        program = %invocation.program,
        log = %invocation.log_path.display(),
        "Starting external tool"
    );

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: invocation.program.clone(),
        source,
    })?;

    let status = child.wait().await?;
    let exit_code = status.code().unwrap_or(-1);
    let duration = start.elapsed();

    debug!(program = %invocation.program, exit_code, ?duration, "External tool exited");

    Ok(ToolExit {
        exit_code,
        duration,
    })
}
