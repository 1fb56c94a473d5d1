//! Export module for simulator-ready connectivity outputs.
//!
//! Provides the per-subject connectivity export run by the export stage
//! and the collection of finished results into a delivery directory.

pub mod bundle;
pub mod connectivity;

use thiserror::Error;

use crate::segmentation::NiftiError;

pub use bundle::{bundle_dir, collect_results, BundleSummary, SkippedSubject};
pub use connectivity::{
    export_connectivity, normalise_weights, read_matrix, region_centres, write_centres, write_matrix,
    ExportSummary, RELABELED_SEGMENTATION, WEIGHT_SCALE,
};

/// Errors that can occur during export operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed matrix {path}: {message}")]
    MalformedMatrix { path: String, message: String },

    #[error("Weights matrix is {weights:?} but lengths matrix is {lengths:?}")]
    ShapeMismatch {
        weights: (usize, usize),
        lengths: (usize, usize),
    },

    #[error("Failed to read segmentation {path}: {source}")]
    Segmentation {
        path: String,
        #[source]
        source: NiftiError,
    },
}
