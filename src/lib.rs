//! brainprep: multi-center neuroimaging preprocessing orchestrator.
//!
//! This library tracks per-subject stage completion from the artifacts on
//! disk, plans the requested stages, and runs them over a bounded pool of
//! isolated subject workers.

// Core modules
pub mod cli;
pub mod datasets;
pub mod export;
pub mod ledger;
pub mod pipeline;
pub mod segmentation;
pub mod subject;
pub mod tools;

// Re-export commonly used error types
pub use datasets::DataLocationError;
pub use export::ExportError;
pub use ledger::LedgerError;
pub use pipeline::{ConfigError, PipelineError, StageError};
pub use segmentation::{NiftiError, RelabelError};
pub use subject::ManifestError;
pub use tools::ToolError;
