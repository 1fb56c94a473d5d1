//! Subjects, their directories, and the manifests that list them.
//!
//! A subject is identified by `(subject_id, center)`. Every subject owns
//! three directories derived from the configured roots:
//!
//! ```text
//! <input_root>/<center>/<subject_id>          raw data (read only)
//! <output_root>/<center>_Post/<subject_id>    persistent stage outputs
//! <work_root>/<center>/<subject_id>           ephemeral working copy
//! ```

pub mod manifest;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use manifest::{load_manifest, load_subset, select_subset, ManifestError};

/// Identity of a subject within a multi-center dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    /// Subject identifier as used by the acquisition site.
    pub subject_id: String,
    /// Center (site) tag, which also selects the raw data layout.
    pub center: String,
}

impl SubjectKey {
    /// Creates a new subject key.
    pub fn new(subject_id: impl Into<String>, center: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            center: center.into(),
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.center, self.subject_id)
    }
}

/// Root directories from which every subject's directories are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectLayout {
    /// Root of the raw multi-center data.
    pub input_root: PathBuf,
    /// Root of the persistent per-subject outputs.
    pub output_root: PathBuf,
    /// Root under which ephemeral working areas are created.
    pub work_root: PathBuf,
}

impl SubjectLayout {
    /// Creates a layout from the three roots.
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            work_root: work_root.into(),
        }
    }

    /// Raw data directory for a subject.
    pub fn source_dir(&self, key: &SubjectKey) -> PathBuf {
        self.input_root.join(&key.center).join(&key.subject_id)
    }

    /// Persistent output directory for a subject.
    pub fn output_dir(&self, key: &SubjectKey) -> PathBuf {
        self.output_root
            .join(format!("{}_Post", key.center))
            .join(&key.subject_id)
    }

    /// Ephemeral working area for a subject.
    pub fn work_dir(&self, key: &SubjectKey) -> PathBuf {
        self.work_root.join(&key.center).join(&key.subject_id)
    }

    /// Resolves a key into a subject with all of its directories.
    pub fn subject(&self, key: SubjectKey) -> Subject {
        Subject {
            source_dir: self.source_dir(&key),
            output_dir: self.output_dir(&key),
            work_dir: self.work_dir(&key),
            key,
        }
    }
}

/// A subject together with the directories it owns for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub key: SubjectKey,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Subject {
    /// Subject identifier shortcut.
    pub fn id(&self) -> &str {
        &self.key.subject_id
    }

    /// Center shortcut.
    pub fn center(&self) -> &str {
        &self.key.center
    }

    /// Path of a stage log file inside the output directory.
    pub fn log_path(&self, stage_name: &str) -> PathBuf {
        self.output_dir.join(format!("log_{}.txt", stage_name))
    }

    /// Resolves a path relative to the subject output directory.
    pub fn output_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.output_dir.join(relative)
    }
}

/// One entry of the permanent exclusion set.
///
/// An entry without a center excludes the subject id at every center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionEntry {
    pub subject_id: String,
    #[serde(default)]
    pub center: Option<String>,
}

impl ExclusionEntry {
    fn matches(&self, key: &SubjectKey) -> bool {
        self.subject_id == key.subject_id
            && self
                .center
                .as_deref()
                .map_or(true, |center| center == key.center)
    }
}

/// Static set of subjects that must never be processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionList {
    entries: Vec<ExclusionEntry>,
}

impl ExclusionList {
    /// Creates an empty exclusion list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subjects known to break the pipeline in the multi-center dataset.
    pub fn known_failures() -> Self {
        Self::new()
            .with_subject("FIS_083")
            .with_subject("FIS_121")
            .with_subject("sub-MS0186")
            .with_subject_at("sub-0010", "MAINZ")
            .with_subject_at("sub-0026", "MAINZ")
    }

    /// Excludes a subject id at every center.
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.entries.push(ExclusionEntry {
            subject_id: subject_id.into(),
            center: None,
        });
        self
    }

    /// Excludes a subject id at one center only.
    pub fn with_subject_at(mut self, subject_id: impl Into<String>, center: impl Into<String>) -> Self {
        self.entries.push(ExclusionEntry {
            subject_id: subject_id.into(),
            center: Some(center.into()),
        });
        self
    }

    /// Returns true if the subject is permanently excluded.
    pub fn contains(&self, key: &SubjectKey) -> bool {
        self.entries.iter().any(|entry| entry.matches(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
