//! Per-center raw data layouts.
//!
//! A pattern is a `/`-separated path relative to the subject directory.
//! `{subject}` is replaced by the subject id, and `*` matches any run of
//! characters within a single path component (directories included), so
//! `*/anat/{subject}*_T1w.nii.gz` finds a T1 image under any session
//! directory. When several files match, the lexicographically first wins.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::subject::SubjectKey;

use super::{DataLocationError, DataLocator, RawInputs};

/// One named input and where to find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPattern {
    /// Input name used by stage templates (`{input.<name>}`).
    pub name: String,
    /// Path pattern relative to the subject directory.
    pub pattern: String,
    /// Whether the subject is unusable without this input.
    #[serde(default)]
    pub required: bool,
}

impl InputPattern {
    fn required(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            required: true,
        }
    }

    fn optional(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            required: false,
        }
    }
}

/// Input patterns of one acquisition site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteLayout {
    pub inputs: Vec<InputPattern>,
}

impl SiteLayout {
    /// Creates a layout from its patterns.
    pub fn new(inputs: Vec<InputPattern>) -> Self {
        Self { inputs }
    }

    /// Resolves every pattern against a subject directory.
    pub fn resolve(&self, subject: &SubjectKey, subject_dir: &Path) -> Result<RawInputs, DataLocationError> {
        if !subject_dir.is_dir() {
            return Err(DataLocationError::MissingSubjectDir(
                subject_dir.display().to_string(),
            ));
        }

        let mut inputs = RawInputs::new();
        for input in &self.inputs {
            let pattern = input.pattern.replace("{subject}", &subject.subject_id);
            let found = first_match(subject_dir, &pattern)?;

            if found.is_none() && input.required {
                return Err(DataLocationError::MissingInput {
                    subject: subject.to_string(),
                    input: input.name.clone(),
                    pattern,
                });
            }

            debug!(subject = %subject, input = %input.name, found = ?found, "Resolved input");
            inputs.insert(input.name.clone(), found);
        }
        Ok(inputs)
    }
}

/// Converts one path component with `*` wildcards into an anchored regex.
fn component_regex(component: &str) -> Result<Regex, DataLocationError> {
    let escaped: Vec<String> = component.split('*').map(regex::escape).collect();
    let source = format!("^{}$", escaped.join(".*"));
    Regex::new(&source).map_err(|e| DataLocationError::InvalidPattern {
        pattern: component.to_string(),
        message: e.to_string(),
    })
}

/// Finds the first existing file matching `pattern` below `root`.
fn first_match(root: &Path, pattern: &str) -> Result<Option<PathBuf>, DataLocationError> {
    let mut candidates = vec![root.to_path_buf()];

    for component in pattern.split('/').filter(|c| !c.is_empty()) {
        let mut next = Vec::new();
        if component.contains('*') {
            let matcher = component_regex(component)?;
            for dir in &candidates {
                let Ok(entries) = fs::read_dir(dir) else {
                    continue;
                };
                for entry in entries {
                    let entry = entry?;
                    if matcher.is_match(&entry.file_name().to_string_lossy()) {
                        next.push(entry.path());
                    }
                }
            }
        } else {
            next.extend(
                candidates
                    .iter()
                    .map(|dir| dir.join(component))
                    .filter(|path| path.exists()),
            );
        }
        next.sort();
        candidates = next;
        if candidates.is_empty() {
            return Ok(None);
        }
    }

    Ok(candidates.into_iter().find(|path| path.is_file()))
}

/// Registry of site layouts keyed by center tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteLayouts {
    sites: BTreeMap<String, SiteLayout>,
}

impl SiteLayouts {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            sites: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) the layout of a center.
    pub fn with_site(mut self, center: impl Into<String>, layout: SiteLayout) -> Self {
        self.sites.insert(center.into(), layout);
        self
    }

    /// Adds every site of `other`, replacing existing entries.
    pub fn merge(mut self, other: SiteLayouts) -> Self {
        self.sites.extend(other.sites);
        self
    }

    /// Layout of a center, if registered.
    pub fn site(&self, center: &str) -> Option<&SiteLayout> {
        self.sites.get(center)
    }

    /// Registered center tags.
    pub fn centers(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }
}

impl Default for SiteLayouts {
    fn default() -> Self {
        use InputPattern as P;

        let bids = SiteLayout::new(vec![
            P::required("t1w", "anat/{subject}_T1w.nii*"),
            P::optional("flair", "anat/{subject}_FLAIR.nii*"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "dwi/{subject}_dwi.nii*"),
            P::required("bval", "dwi/{subject}_dwi.bval"),
            P::required("bvec", "dwi/{subject}_dwi.bvec"),
            P::optional("dwi_json", "dwi/{subject}_dwi.json"),
            P::required("fmri", "func/{subject}_bold.nii*"),
            P::optional("fmri_json", "func/{subject}_bold.json"),
        ]);

        let naples = SiteLayout::new(vec![
            P::required("t1w", "anat/{subject}_T1w.nii"),
            P::optional("flair", "flair/{subject}_flair.nii"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "dwi/{subject}_dwi.nii"),
            P::required("bval", "dwi/{subject}_dwi.bval"),
            P::required("bvec", "dwi/{subject}_dwi.bvec"),
            P::optional("dwi_json", "dwi/{subject}_dwi.json"),
            P::required("fmri", "func/{subject}_bold.nii"),
            P::optional("fmri_json", "func/{subject}_bold.json"),
        ]);

        let milan = SiteLayout::new(vec![
            P::required("t1w", "anat/*_MPR_*.nii"),
            P::optional("flair", "anat/FLAIR2T1.nii.gz"),
            P::optional("lesions", "anat/FLAIR_LesMask2t1.nii.gz"),
            P::required("dwi", "dwi/*_DW*.nii"),
            P::required("bval", "dwi/*_DW*.bval"),
            P::required("bvec", "dwi/*_DW*.bvec"),
            P::required("dwi_json", "dwi/*_DW*.json"),
            P::required("dwi2", "dwi/*_b0*.nii"),
            P::required("fmri", "func/*rsfMRI_*.nii"),
            P::required("fmri_json", "func/*rsfMRI_*.json"),
        ]);

        let clinic = SiteLayout::new(vec![
            P::required("t1w", "r{subject}_T1_00.nii.gz"),
            P::optional("flair", "r{subject}_FLAIR_00.nii.gz"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "r{subject}_DWI_00.nii.gz"),
            P::required("bval", "r{subject}_DWI_00.bval"),
            P::required("bvec", "r{subject}_DWI_00.bvec"),
            P::optional("dwi_ph", "r{subject}_GFM_ph_00.nii.gz"),
            P::optional("dwi_mag", "r{subject}_GFM_mag_00.nii.gz"),
            P::required("fmri", "r{subject}_RESTING_00.nii.gz"),
        ]);

        let oslo = SiteLayout::new(vec![
            P::required("t1w", "*/anat/{subject}*_T1w.nii.gz"),
            P::required("flair", "*/anat/{subject}*_FLAIR.nii.gz"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "*/dwi/{subject}*AP_dwi.nii.gz"),
            P::required("bval", "*/dwi/{subject}*AP_dwi.bval"),
            P::required("bvec", "*/dwi/{subject}*AP_dwi.bvec"),
            P::required("dwi_json", "*/dwi/{subject}*AP_dwi.json"),
            P::required("dwi2", "*/dwi/{subject}*PA_dwi.nii.gz"),
            P::required("bval2", "*/dwi/{subject}*PA_dwi.bval"),
            P::required("bvec2", "*/dwi/{subject}*PA_dwi.bvec"),
            P::required("fmri", "*/func/{subject}*_bold.nii.gz"),
            P::required("fmri_json", "*/func/{subject}*_bold.json"),
        ]);

        let amsterdam = SiteLayout::new(vec![
            P::required("t1w", "*_sienax/I.nii.gz"),
            P::optional("flair", "flair.nii.gz"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "raw.nii.gz"),
            P::required("bval", "bvals"),
            P::required("bvec", "bvecs"),
            P::required("fmri", "fmri.nii.gz"),
        ]);

        let london = SiteLayout::new(vec![
            P::required("t1w", "*/anat/*_t1.nii.gz"),
            P::required("flair", "*/anat/*_flair.nii.gz"),
            P::optional("lesions", "{subject}_ROI*"),
            P::required("dwi", "*/dwi/*_dwi.nii.gz"),
            P::required("bval", "*/dwi/*_dwi.bval"),
            P::required("bvec", "*/dwi/*_dwi.bvec"),
            P::optional("dwi_json", "*/dwi/*_dwi*.json"),
            P::optional("dwi2", "*/dwi/*_b0_rev.nii.gz"),
            P::required("fmri", "*/fmri/*_rsfmri.nii.gz"),
            P::required("fmri_json", "*/fmri/*_rsfmri.json"),
        ]);

        Self::empty()
            .with_site("BIDS", bids.clone())
            .with_site("MAINZ", bids)
            .with_site("NAPLES", naples)
            .with_site("MILAN", milan)
            .with_site("CLINIC", clinic)
            .with_site("OSLO", oslo)
            .with_site("AMSTERDAM", amsterdam)
            .with_site("LONDON", london)
    }
}

impl DataLocator for SiteLayouts {
    fn locate(&self, subject: &SubjectKey, subject_dir: &Path) -> Result<RawInputs, DataLocationError> {
        let layout = self
            .site(&subject.center)
            .ok_or_else(|| DataLocationError::UnknownSite(subject.center.clone()))?;
        layout.resolve(subject, subject_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("has parent")).expect("create dirs");
        fs::write(path, b"nii").expect("write file");
    }

    #[test]
    fn test_component_regex_escapes_literals() {
        let re = component_regex("r*_DWI_00.nii.gz").unwrap();
        assert!(re.is_match("rFIS_001_DWI_00.nii.gz"));
        assert!(!re.is_match("rFIS_001_DWI_00Xnii.gz"));
    }

    #[test]
    fn test_mainz_layout_resolves_bids_names() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let dir = temp_dir.path();
        for file in [
            "anat/sub-01_T1w.nii",
            "dwi/sub-01_dwi.nii",
            "dwi/sub-01_dwi.bval",
            "dwi/sub-01_dwi.bvec",
            "func/sub-01_bold.nii",
        ] {
            touch(dir, file);
        }

        let key = SubjectKey::new("sub-01", "MAINZ");
        let inputs = SiteLayouts::default().locate(&key, dir).expect("locate inputs");

        assert_eq!(inputs.get("t1w"), Some(dir.join("anat/sub-01_T1w.nii").as_path()));
        assert!(!inputs.has("flair"));
        assert!(!inputs.has("lesions"));
    }

    #[test]
    fn test_wildcard_session_directory() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let dir = temp_dir.path();
        touch(dir, "ses-2/anat/sub-07_acq_t1.nii.gz");
        touch(dir, "ses-1/anat/sub-07_t1.nii.gz");

        let found = first_match(dir, "*/anat/*_t1.nii.gz").unwrap();
        assert_eq!(found, Some(dir.join("ses-1/anat/sub-07_t1.nii.gz")));
    }

    #[test]
    fn test_missing_required_input() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let dir = temp_dir.path();
        touch(dir, "anat/sub-01_T1w.nii");

        let key = SubjectKey::new("sub-01", "MAINZ");
        let err = SiteLayouts::default().locate(&key, dir).unwrap_err();
        assert!(matches!(err, DataLocationError::MissingInput { ref input, .. } if input == "dwi"));
    }

    #[test]
    fn test_unknown_site_and_missing_dir() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let layouts = SiteLayouts::default();

        let err = layouts
            .locate(&SubjectKey::new("s", "TOKYO"), temp_dir.path())
            .unwrap_err();
        assert!(matches!(err, DataLocationError::UnknownSite(_)));

        let err = layouts
            .locate(&SubjectKey::new("s", "MAINZ"), &temp_dir.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, DataLocationError::MissingSubjectDir(_)));
    }
}
