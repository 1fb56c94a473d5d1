//! Stage sequencing for the subject-level preprocessing pipeline.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Stage table** (`stage`): the fixed stage order and each stage's
//!   prerequisites, artifacts, best-effort flag and steps
//! - **Planner** (`planner`): decides per requested stage whether it runs
//! - **Runner** (`runner`): executes one stage and verifies its artifacts
//! - **Driver** (`driver`): runs one subject end to end in an isolated
//!   working area
//! - **Orchestrator** (`orchestrator`): fans subjects out over a bounded
//!   worker pool
//! - **Config** (`config`): roots, pool size and policy tables
//!
//! # Flow
//!
//! 1. **Exclusion**: subjects on the exclusion list are never touched
//! 2. **Planning**: completion is derived from disk and the requested
//!    stages are planned
//! 3. **Copy-in**: raw data is located and copied into the working area
//! 4. **Execution**: planned stages run in order; a fatal failure
//!    abandons the rest for that subject only
//! 5. **Cleanup**: the working area is removed on every exit path
//! 6. **Ledger**: after all workers finish the ledger is re-derived and
//!    persisted once
//!
//! # Example
//!
//! ```rust,ignore
//! use brainprep::pipeline::{PipelineConfig, PipelineOrchestrator, Stage};
//!
//! let config = PipelineConfig::new()
//!     .with_input_root("/data/raw")
//!     .with_output_root("/data/processed")
//!     .with_worker_count(8);
//!
//! let orchestrator = PipelineOrchestrator::new(config)?;
//! let requested = Stage::ALL.into_iter().collect();
//! let reports = orchestrator.run_all(subjects.clone(), &requested).await;
//!
//! for (subject, report) in &reports {
//!     println!("{}: {}", subject, report.status);
//! }
//! orchestrator.refresh_ledger_file(Path::new("ledger.csv"), &subjects)?;
//! ```

pub mod config;
pub mod driver;
pub mod orchestrator;
pub mod planner;
pub mod runner;
pub mod stage;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use driver::{copy_tree, ActiveSubjects, StageRecord, SubjectDriver, SubjectReport, SubjectStatus, WorkArea};
pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineStats};
pub use planner::{PlanDecision, PlannedStage, SkipReason, StagePlan, StagePlanner};
pub use runner::{
    FailureReason, PipelineExecutor, StageContext, StageError, StageExecutor, StageOutcome, StageRunner,
};
pub use stage::{Stage, StageSet, StageSpec, StageStep, StageTable};
