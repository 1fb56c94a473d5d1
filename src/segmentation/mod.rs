//! Segmentation relabeling.
//!
//! The reconstruction stage produces a DKT atlas + aseg volume with
//! FreeSurfer label numbers. Tractography needs compact sequential region
//! indices instead, so the volume is rewritten with every grey-matter
//! label mapped to 1..=76 and everything else set to 0. The result is
//! stored next to the input as `<stem>_newSeg.nii.gz`.

pub mod labels;
pub mod nifti;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use labels::{region_name, sequential_index, DKT_REGIONS, REGION_COUNT};
pub use nifti::{Datatype, NiftiError, NiftiVolume};

/// Errors that can occur while relabeling a segmentation.
#[derive(Debug, Error)]
pub enum RelabelError {
    #[error("NIfTI error in {path}: {source}")]
    Nifti {
        path: String,
        #[source]
        source: NiftiError,
    },

    /// The path has no file name to derive the output from.
    #[error("Invalid segmentation path: {0}")]
    InvalidPath(String),
}

/// Output path for a relabeled segmentation.
pub fn relabeled_path(segmentation: &Path) -> Result<PathBuf, RelabelError> {
    let name = segmentation
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RelabelError::InvalidPath(segmentation.display().to_string()))?;
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name);
    Ok(segmentation.with_file_name(format!("{}_newSeg.nii.gz", stem)))
}

/// Maps every voxel to its sequential region index.
pub fn relabel_volume(volume: &NiftiVolume) -> Result<NiftiVolume, NiftiError> {
    let data = volume
        .data
        .iter()
        .map(|value| f64::from(sequential_index(value.round() as i64)))
        .collect();
    volume.with_data(data)
}

fn nifti_err(path: &Path) -> impl FnOnce(NiftiError) -> RelabelError {
    let path = path.display().to_string();
    move |source| RelabelError::Nifti { path, source }
}

/// Relabels a segmentation file and returns the written path.
pub fn relabel_file(segmentation: &Path) -> Result<PathBuf, RelabelError> {
    let output = relabeled_path(segmentation)?;
    let volume = NiftiVolume::read(segmentation).map_err(nifti_err(segmentation))?;
    let relabeled = relabel_volume(&volume).map_err(nifti_err(segmentation))?;
    relabeled.write(&output).map_err(nifti_err(&output))?;

    debug!(
        input = %segmentation.display(),
        output = %output.display(),
        voxels = relabeled.len(),
        "Segmentation relabeled"
    );
    Ok(output)
}
