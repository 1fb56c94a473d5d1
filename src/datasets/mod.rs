//! Raw data location for multi-center datasets.
//!
//! Each acquisition site stores its raw images differently. A
//! [`DataLocator`] maps a subject directory to the named raw inputs the
//! stages consume (`t1w`, `flair`, `dwi`, gradient tables, `fmri`, ...).
//! The default locator, [`SiteLayouts`], is a table of per-center path
//! patterns.

pub mod layout;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::subject::SubjectKey;

pub use layout::{InputPattern, SiteLayout, SiteLayouts};

/// Input names any site may provide. Stage templates can reference all of
/// them; the ones a site lacks render as `None`.
pub const STANDARD_INPUTS: [&str; 14] = [
    "t1w", "flair", "lesions", "dwi", "bval", "bvec", "dwi_json", "dwi2", "bval2", "bvec2",
    "dwi_ph", "dwi_mag", "fmri", "fmri_json",
];

/// Errors that can occur while locating raw inputs.
#[derive(Debug, Error)]
pub enum DataLocationError {
    /// No layout is registered for the subject's center.
    #[error("No data layout registered for center '{0}'")]
    UnknownSite(String),

    /// The subject's raw data directory does not exist.
    #[error("Subject directory {0} does not exist")]
    MissingSubjectDir(String),

    /// A required input file was not found.
    #[error("Required input '{input}' not found for {subject} (pattern '{pattern}')")]
    MissingInput {
        subject: String,
        input: String,
        pattern: String,
    },

    /// A layout pattern could not be compiled.
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named raw input files of one subject. Optional inputs that a site does
/// not provide are stored as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawInputs {
    files: BTreeMap<String, Option<PathBuf>>,
}

impl RawInputs {
    /// Creates an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an input.
    pub fn insert(&mut self, name: impl Into<String>, path: Option<PathBuf>) {
        self.files.insert(name.into(), path);
    }

    /// Builder variant of [`RawInputs::insert`].
    pub fn with(mut self, name: impl Into<String>, path: Option<PathBuf>) -> Self {
        self.insert(name, path);
        self
    }

    /// Path of an input, if it was located.
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.files.get(name).and_then(|p| p.as_deref())
    }

    /// Returns true if the input was located.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All input names with their (optional) paths.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Path>)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Rewrites paths under `from` to the same relative path under `to`.
    ///
    /// Used after the raw subject directory is copied into the working
    /// area, so tools only ever read the private copy.
    pub fn rebase(&self, from: &Path, to: &Path) -> Self {
        let files = self
            .files
            .iter()
            .map(|(name, path)| {
                let rebased = path.as_ref().map(|p| match p.strip_prefix(from) {
                    Ok(relative) => to.join(relative),
                    Err(_) => p.clone(),
                });
                (name.clone(), rebased)
            })
            .collect();
        Self { files }
    }
}

/// Resolves a subject's raw inputs.
pub trait DataLocator: Send + Sync {
    /// Locates the inputs of `subject` inside `subject_dir`.
    ///
    /// # Errors
    ///
    /// Fails if the site is unknown or any required input is absent.
    fn locate(&self, subject: &SubjectKey, subject_dir: &Path) -> Result<RawInputs, DataLocationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_inputs_rebase() {
        let inputs = RawInputs::new()
            .with("t1w", Some(PathBuf::from("/raw/MAINZ/sub-01/anat/t1.nii")))
            .with("flair", None)
            .with("atlas", Some(PathBuf::from("/shared/atlas.nii")));

        let rebased = inputs.rebase(Path::new("/raw/MAINZ/sub-01"), Path::new("/work/MAINZ/sub-01"));

        assert_eq!(
            rebased.get("t1w"),
            Some(Path::new("/work/MAINZ/sub-01/anat/t1.nii"))
        );
        assert!(!rebased.has("flair"));
        assert_eq!(rebased.get("atlas"), Some(Path::new("/shared/atlas.nii")));
    }
}
