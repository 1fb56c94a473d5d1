//! Stage runner.
//!
//! Runs one stage for one subject. Success is never taken from the step
//! results alone: after every step finished without error the stage's
//! artifacts are re-derived from disk, and any that are missing turn the
//! outcome into `Failed(MissingArtifacts)`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::datasets::{RawInputs, STANDARD_INPUTS};
use crate::export::{self, ExportError};
use crate::ledger;
use crate::segmentation::{self, RelabelError};
use crate::subject::Subject;
use crate::tools::{run_tool, TemplateVars, ToolError, ToolInvocation};

use super::planner::SkipReason;
use super::stage::{Stage, StageStep, StageTable};

/// Errors raised while executing a stage step.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// The tool ran but reported failure.
    #[error("{program} exited with status {code}")]
    ExitStatus { program: String, code: i32 },

    #[error("Relabel error: {0}")]
    Relabel(#[from] RelabelError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// An in-process step panicked or was cancelled.
    #[error("In-process step aborted: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Classifies the error as a stage failure reason.
    pub fn into_failure(self) -> FailureReason {
        match self {
            StageError::Tool(ToolError::Spawn { .. }) | StageError::Tool(ToolError::Wait(_)) => {
                FailureReason::Spawn {
                    message: self.to_string(),
                }
            }
            StageError::Tool(_) | StageError::Io(_) => FailureReason::Setup {
                message: self.to_string(),
            },
            StageError::ExitStatus { code, .. } => FailureReason::ExitStatus { code },
            StageError::Relabel(_) | StageError::Export(_) | StageError::Join(_) => {
                FailureReason::InProcess {
                    message: self.to_string(),
                }
            }
        }
    }
}

/// Why a stage, or a whole subject, failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Raw inputs could not be located.
    DataNotFound { message: String },
    /// Preparing the stage or the working area failed.
    Setup { message: String },
    /// Inputs the stage requires were not provided by the site.
    MissingInput { inputs: Vec<String> },
    /// The tool process could not be started.
    Spawn { message: String },
    /// The tool exited with a non-zero code.
    ExitStatus { code: i32 },
    /// The stage reported success but left artifacts missing.
    MissingArtifacts { paths: Vec<PathBuf> },
    /// An in-process step failed.
    InProcess { message: String },
    /// Another worker is already processing this subject.
    SubjectBusy,
    /// The worker processing the subject panicked.
    Panicked { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DataNotFound { message } => write!(f, "data not found: {}", message),
            FailureReason::Setup { message } => write!(f, "setup failed: {}", message),
            FailureReason::MissingInput { inputs } => {
                write!(f, "missing inputs: {}", inputs.join(", "))
            }
            FailureReason::Spawn { message } => write!(f, "spawn failed: {}", message),
            FailureReason::ExitStatus { code } => write!(f, "exit status {}", code),
            FailureReason::MissingArtifacts { paths } => {
                write!(f, "{} artifact(s) missing", paths.len())
            }
            FailureReason::InProcess { message } => write!(f, "{}", message),
            FailureReason::SubjectBusy => write!(f, "subject already being processed"),
            FailureReason::Panicked { message } => write!(f, "worker panicked: {}", message),
        }
    }
}

/// Outcome of one stage (or of a whole subject that never reached its
/// stages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Skipped(SkipReason),
    Failed(FailureReason),
    PermanentlyExcluded,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "success"),
            StageOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            StageOutcome::Failed(reason) => write!(f, "failed ({})", reason),
            StageOutcome::PermanentlyExcluded => write!(f, "permanently excluded"),
        }
    }
}

/// Everything a stage needs to know about the subject it runs for.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub subject: Subject,
    /// Located raw inputs, already rebased into the working area.
    pub inputs: RawInputs,
    pub threads: usize,
    pub tool_root: PathBuf,
}

impl StageContext {
    /// Template variables for tool arguments.
    pub fn template_vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::new()
            .with("subject", self.subject.id())
            .with("center", self.subject.center())
            .with_path("output_dir", &self.subject.output_dir)
            .with_path("work_dir", &self.subject.work_dir)
            .with("threads", self.threads.to_string());

        for name in STANDARD_INPUTS {
            vars = vars.with(format!("input.{}", name), "None");
        }
        for (name, path) in self.inputs.iter() {
            let value = path.map_or_else(|| "None".to_string(), |p| p.display().to_string());
            vars = vars.with(format!("input.{}", name), value);
        }
        vars
    }
}

/// Executes the steps of a stage.
///
/// The default implementation is [`PipelineExecutor`]; tests substitute
/// their own to simulate tools.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes one step of `stage`.
    async fn execute(&self, ctx: &StageContext, stage: Stage, step: &StageStep) -> Result<(), StageError>;
}

/// Executor that runs external tools as subprocesses and in-process steps
/// on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageExecutor for PipelineExecutor {
    async fn execute(&self, ctx: &StageContext, stage: Stage, step: &StageStep) -> Result<(), StageError> {
        match step {
            StageStep::Tool(command) => {
                let invocation = ToolInvocation {
                    program: command.resolve_program(&ctx.tool_root),
                    args: command.render(&ctx.template_vars())?,
                    working_dir: ctx.subject.work_dir.clone(),
                    log_path: ctx.subject.log_path(stage.name()),
                };
                let exit = run_tool(&invocation).await?;
                if !exit.is_success() {
                    return Err(StageError::ExitStatus {
                        program: invocation.program,
                        code: exit.exit_code,
                    });
                }
                Ok(())
            }
            StageStep::Relabel { segmentation } => {
                let input = ctx.subject.output_path(segmentation);
                let output = tokio::task::spawn_blocking(move || segmentation::relabel_file(&input))
                    .await
                    .map_err(|e| StageError::Join(e.to_string()))??;
                debug!(output = %output.display(), "Segmentation relabeled");
                Ok(())
            }
            StageStep::ExportConnectivity => {
                let output_dir = ctx.subject.output_dir.clone();
                let subject_id = ctx.subject.id().to_string();
                let summary = tokio::task::spawn_blocking(move || {
                    export::export_connectivity(&output_dir, &subject_id)
                })
                .await
                .map_err(|e| StageError::Join(e.to_string()))??;
                debug!(regions = summary.regions, "Connectivity exported");
                Ok(())
            }
        }
    }
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Runs single stages against the stage table.
pub struct StageRunner<'a> {
    table: &'a StageTable,
    executor: &'a dyn StageExecutor,
}

impl<'a> StageRunner<'a> {
    pub fn new(table: &'a StageTable, executor: &'a dyn StageExecutor) -> Self {
        Self { table, executor }
    }

    /// Runs `stage` for the subject of `ctx`.
    pub async fn run(&self, ctx: &StageContext, stage: Stage) -> StageOutcome {
        let spec = self.table.spec(stage);
        let subject = &ctx.subject.key;
        let start = Instant::now();

        let missing_inputs: Vec<String> = spec
            .required_inputs
            .iter()
            .filter(|name| !ctx.inputs.has(name))
            .cloned()
            .collect();
        if !missing_inputs.is_empty() {
            warn!(subject = %subject, stage = %stage, inputs = ?missing_inputs, "Required inputs missing");
            return StageOutcome::Failed(FailureReason::MissingInput {
                inputs: missing_inputs,
            });
        }

        let prepare = || -> std::io::Result<()> {
            for dir in &spec.clean_before {
                remove_dir_if_present(&ctx.subject.output_path(dir))?;
            }
            std::fs::create_dir_all(&ctx.subject.output_dir)?;
            std::fs::create_dir_all(&ctx.subject.work_dir)
        };
        if let Err(e) = prepare() {
            return StageOutcome::Failed(FailureReason::Setup {
                message: e.to_string(),
            });
        }

        info!(subject = %subject, stage = %stage, "Stage started");

        for step in &spec.steps {
            if let Err(e) = self.executor.execute(ctx, stage, step).await {
                warn!(subject = %subject, stage = %stage, error = %e, "Stage failed");
                return StageOutcome::Failed(e.into_failure());
            }
        }

        let missing = ledger::missing_artifacts(self.table, &ctx.subject, stage);
        if !missing.is_empty() {
            warn!(
                subject = %subject,
                stage = %stage,
                missing = ?missing,
                "Stage finished without producing all artifacts"
            );
            return StageOutcome::Failed(FailureReason::MissingArtifacts { paths: missing });
        }

        info!(subject = %subject, stage = %stage, duration = ?start.elapsed(), "Stage completed");
        StageOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::{SubjectKey, SubjectLayout};
    use crate::tools::ToolCommand;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes the configured artifacts (or not) instead of running tools.
    struct ScriptedExecutor {
        write_artifacts: bool,
        fail_with: Option<i32>,
        calls: Mutex<Vec<Stage>>,
        table: StageTable,
    }

    impl ScriptedExecutor {
        fn new(write_artifacts: bool, fail_with: Option<i32>) -> Self {
            Self {
                write_artifacts,
                fail_with,
                calls: Mutex::new(Vec::new()),
                table: StageTable::default(),
            }
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, ctx: &StageContext, stage: Stage, _step: &StageStep) -> Result<(), StageError> {
            self.calls.lock().unwrap().push(stage);
            if let Some(code) = self.fail_with {
                return Err(StageError::ExitStatus {
                    program: "fake".to_string(),
                    code,
                });
            }
            if self.write_artifacts {
                for artifact in self.table.spec(stage).artifact_paths(ctx.subject.id(), ctx.subject.center()) {
                    let path = ctx.subject.output_path(artifact);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    std::fs::write(path, b"done")?;
                }
            }
            Ok(())
        }
    }

    fn context(root: &Path) -> StageContext {
        let subject = SubjectLayout::new(root.join("raw"), root.join("out"), root.join("work"))
            .subject(SubjectKey::new("sub-01", "MAINZ"));
        StageContext {
            subject,
            inputs: RawInputs::new()
                .with("t1w", Some(root.join("raw/t1.nii")))
                .with("flair", None),
            threads: 2,
            tool_root: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_success_requires_artifacts() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        let table = StageTable::default();

        let executor = ScriptedExecutor::new(true, None);
        let outcome = StageRunner::new(&table, &executor).run(&ctx, Stage::Reconstruction).await;
        assert_eq!(outcome, StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_clean_exit_without_artifacts_fails() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        let table = StageTable::default();

        let executor = ScriptedExecutor::new(false, None);
        let outcome = StageRunner::new(&table, &executor).run(&ctx, Stage::Reconstruction).await;
        match outcome {
            StageOutcome::Failed(FailureReason::MissingArtifacts { paths }) => assert_eq!(paths.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        let table = StageTable::default();

        let executor = ScriptedExecutor::new(true, Some(2));
        let outcome = StageRunner::new(&table, &executor).run(&ctx, Stage::Reconstruction).await;
        assert_eq!(outcome, StageOutcome::Failed(FailureReason::ExitStatus { code: 2 }));
    }

    #[tokio::test]
    async fn test_missing_required_input_skips_execution() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        let table = StageTable::default();

        let executor = ScriptedExecutor::new(true, None);
        let outcome = StageRunner::new(&table, &executor).run(&ctx, Stage::LesionSeg).await;
        assert_eq!(
            outcome,
            StageOutcome::Failed(FailureReason::MissingInput {
                inputs: vec!["flair".to_string()],
            })
        );
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_before_removes_stale_outputs() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut ctx = context(temp_dir.path());
        ctx.inputs = RawInputs::new()
            .with("dwi", Some(PathBuf::from("dwi.nii")))
            .with("bval", Some(PathBuf::from("dwi.bval")))
            .with("bvec", Some(PathBuf::from("dwi.bvec")));
        let stale = ctx.subject.output_path("dt_proc/stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let table = StageTable::default();
        let executor = ScriptedExecutor::new(true, None);
        let outcome = StageRunner::new(&table, &executor).run(&ctx, Stage::DiffusionProc).await;

        assert_eq!(outcome, StageOutcome::Success);
        assert!(!stale.exists());
    }

    #[test]
    fn test_template_vars_render_absent_inputs_as_none() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        let vars = ctx.template_vars();

        assert_eq!(vars.render("{input.flair}").unwrap(), "None");
        assert_eq!(vars.render("{input.dwi_ph}").unwrap(), "None");
        assert_eq!(vars.render("{threads}").unwrap(), "2");
        assert!(vars.render("{input.t1w}").unwrap().ends_with("t1.nii"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipeline_executor_runs_tool_in_work_dir() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.subject.work_dir).unwrap();

        let step = StageStep::Tool(ToolCommand::new(
            "sh",
            vec!["-c".to_string(), "pwd; echo {subject} {center}".to_string()],
        ));
        PipelineExecutor::new()
            .execute(&ctx, Stage::Reconstruction, &step)
            .await
            .expect("tool runs");

        let log = std::fs::read_to_string(ctx.subject.log_path("reconstruction")).unwrap();
        assert!(log.contains("sub-01 MAINZ"));
        assert!(log.contains("work"));

        let failing = StageStep::Tool(ToolCommand::new("sh", vec!["-c".to_string(), "exit 7".to_string()]));
        let err = PipelineExecutor::new()
            .execute(&ctx, Stage::Reconstruction, &failing)
            .await
            .unwrap_err();
        assert_eq!(err.into_failure(), FailureReason::ExitStatus { code: 7 });
    }
}
