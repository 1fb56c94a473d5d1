//! Pipeline configuration.
//!
//! This module provides configuration for a preprocessing run: the data
//! roots, the worker pool, the external tool location, and the policy
//! tables (stages, exclusions, site layouts) that can be overridden from a
//! YAML file.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::datasets::SiteLayouts;
use crate::subject::{ExclusionList, SubjectLayout};

use super::stage::StageTable;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a preprocessing run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Data roots
    /// Root of the raw multi-center data (`<root>/<center>/<subject>`).
    pub input_root: PathBuf,
    /// Root of the persistent outputs (`<root>/<center>_Post/<subject>`).
    pub output_root: PathBuf,
    /// Root of the ephemeral per-subject working areas.
    pub work_root: PathBuf,

    // Execution settings
    /// Number of subjects processed concurrently.
    pub worker_count: usize,
    /// Thread budget handed to each external tool (`{threads}`).
    pub threads_per_subject: usize,
    /// Directory against which relative tool programs are resolved.
    pub tool_root: PathBuf,

    // Policy tables
    pub stages: StageTable,
    pub exclusions: ExclusionList,
    pub layouts: SiteLayouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("./data"),
            output_root: PathBuf::from("./output"),
            work_root: std::env::temp_dir().join("brainprep"),

            worker_count: 4,
            threads_per_subject: 4,
            tool_root: PathBuf::from("."),

            stages: StageTable::default(),
            exclusions: ExclusionList::known_failures(),
            layouts: SiteLayouts::default(),
        }
    }
}

/// On-disk shape of the YAML configuration file. Every section is
/// optional; present sections replace (stages, exclusions) or extend
/// (layouts) the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    jobs: Option<usize>,
    threads_per_subject: Option<usize>,
    tool_root: Option<PathBuf>,
    stages: Option<StageTable>,
    exclusions: Option<ExclusionList>,
    layouts: Option<SiteLayouts>,
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BRAINPREP_INPUT_DIR`: Raw data root (default: ./data)
    /// - `BRAINPREP_OUTPUT_DIR`: Output root (default: ./output)
    /// - `BRAINPREP_WORK_DIR`: Working area root (default: $TMPDIR/brainprep)
    /// - `BRAINPREP_JOBS`: Concurrent subjects (default: 4)
    /// - `BRAINPREP_THREADS`: Threads per subject (default: 4)
    /// - `BRAINPREP_TOOL_ROOT`: Base directory of the stage scripts (default: .)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `BRAINPREP_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("BRAINPREP_INPUT_DIR") {
            self.input_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("BRAINPREP_OUTPUT_DIR") {
            self.output_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("BRAINPREP_WORK_DIR") {
            self.work_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("BRAINPREP_JOBS") {
            self.worker_count = parse_env_value(&val, "BRAINPREP_JOBS")?;
        }

        if let Ok(val) = std::env::var("BRAINPREP_THREADS") {
            self.threads_per_subject = parse_env_value(&val, "BRAINPREP_THREADS")?;
        }

        if let Ok(val) = std::env::var("BRAINPREP_TOOL_ROOT") {
            self.tool_root = PathBuf::from(val);
        }

        Ok(())
    }

    /// Loads a YAML configuration file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// result does not validate.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from a YAML configuration file.
    pub fn apply_yaml_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.apply_yaml(&text).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_yaml(&mut self, text: &str) -> Result<(), serde_yaml::Error> {
        let file: ConfigFile = serde_yaml::from_str(text)?;

        if let Some(dir) = file.input_dir {
            self.input_root = dir;
        }
        if let Some(dir) = file.output_dir {
            self.output_root = dir;
        }
        if let Some(dir) = file.work_dir {
            self.work_root = dir;
        }
        if let Some(jobs) = file.jobs {
            self.worker_count = jobs;
        }
        if let Some(threads) = file.threads_per_subject {
            self.threads_per_subject = threads;
        }
        if let Some(root) = file.tool_root {
            self.tool_root = root;
        }
        if let Some(stages) = file.stages {
            self.stages = stages;
        }
        if let Some(exclusions) = file.exclusions {
            self.exclusions = exclusions;
        }
        if let Some(layouts) = file.layouts {
            self.layouts = std::mem::take(&mut self.layouts).merge(layouts);
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.threads_per_subject == 0 {
            return Err(ConfigError::ValidationFailed(
                "threads_per_subject must be greater than 0".to_string(),
            ));
        }

        if self.work_root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "work_root cannot be empty".to_string(),
            ));
        }

        // Working areas are deleted recursively, they must never alias data.
        let work_root = resolve_root(&self.work_root);
        if work_root == resolve_root(&self.input_root) || work_root == resolve_root(&self.output_root) {
            return Err(ConfigError::ValidationFailed(
                "work_root must differ from input_root and output_root".to_string(),
            ));
        }

        self.stages.validate()
    }

    /// Subject directory layout derived from the three roots.
    pub fn subject_layout(&self) -> SubjectLayout {
        SubjectLayout::new(&self.input_root, &self.output_root, &self.work_root)
    }

    /// Builder method to set the raw data root.
    pub fn with_input_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_root = path.into();
        self
    }

    /// Builder method to set the output root.
    pub fn with_output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_root = path.into();
        self
    }

    /// Builder method to set the working area root.
    pub fn with_work_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_root = path.into();
        self
    }

    /// Builder method to set the number of concurrent subjects.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder method to set the per-subject thread budget.
    pub fn with_threads_per_subject(mut self, threads: usize) -> Self {
        self.threads_per_subject = threads;
        self
    }

    /// Builder method to set the tool root.
    pub fn with_tool_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_root = path.into();
        self
    }

    /// Builder method to replace the stage table.
    pub fn with_stages(mut self, stages: StageTable) -> Self {
        self.stages = stages;
        self
    }

    /// Builder method to replace the exclusion list.
    pub fn with_exclusions(mut self, exclusions: ExclusionList) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Builder method to replace the site layouts.
    pub fn with_layouts(mut self, layouts: SiteLayouts) -> Self {
        self.layouts = layouts;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Absolute form of a root for aliasing checks. Existing paths are
/// canonicalized (symlinks resolved); others are normalized lexically.
fn resolve_root(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
