//! Subject driver.
//!
//! Runs one subject end to end: exclusion check, claim, plan, data
//! location, copy-in, sequential stage execution, and removal of the
//! working area on every exit path.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::datasets::DataLocator;
use crate::ledger;
use crate::subject::{Subject, SubjectKey};

use super::config::PipelineConfig;
use super::planner::{PlanDecision, SkipReason, StagePlanner};
use super::runner::{FailureReason, StageContext, StageExecutor, StageOutcome, StageRunner};
use super::stage::{Stage, StageSet};

/// Overall status of one subject after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubjectStatus {
    /// On the permanent exclusion list; nothing was touched.
    Excluded,
    /// Raw inputs could not be located.
    DataNotFound,
    /// The working area could not be prepared.
    SetupFailed,
    /// Another worker held the subject.
    Busy,
    /// Every requested stage was done or not runnable.
    NothingToDo,
    /// Every executed non-best-effort stage succeeded.
    Completed,
    /// A non-best-effort stage failed and the rest was abandoned.
    Failed { stage: Stage },
    /// The worker panicked.
    Panicked,
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectStatus::Excluded => write!(f, "excluded"),
            SubjectStatus::DataNotFound => write!(f, "data_not_found"),
            SubjectStatus::SetupFailed => write!(f, "setup_failed"),
            SubjectStatus::Busy => write!(f, "busy"),
            SubjectStatus::NothingToDo => write!(f, "nothing_to_do"),
            SubjectStatus::Completed => write!(f, "completed"),
            SubjectStatus::Failed { stage } => write!(f, "failed:{}", stage),
            SubjectStatus::Panicked => write!(f, "panicked"),
        }
    }
}

/// Outcome of one requested stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub duration: Duration,
}

/// Result of processing one subject.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: SubjectKey,
    pub status: SubjectStatus,
    /// Subject-level failure that prevented any stage from running.
    pub failure: Option<FailureReason>,
    /// Requested stages in order with their outcomes.
    pub stages: Vec<StageRecord>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SubjectReport {
    fn new(subject: SubjectKey, status: SubjectStatus) -> Self {
        Self {
            subject,
            status,
            failure: None,
            stages: Vec::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Report for a subject that failed before reaching its stages.
    pub fn subject_failure(subject: SubjectKey, status: SubjectStatus, reason: FailureReason) -> Self {
        let mut report = Self::new(subject, status);
        report.failure = Some(reason);
        report
    }

    /// Flattened outcome list.
    ///
    /// An excluded subject yields exactly `[PermanentlyExcluded]`; a
    /// subject-level failure yields its reason first.
    pub fn outcomes(&self) -> Vec<StageOutcome> {
        if self.status == SubjectStatus::Excluded {
            return vec![StageOutcome::PermanentlyExcluded];
        }
        self.failure
            .iter()
            .map(|reason| StageOutcome::Failed(reason.clone()))
            .chain(self.stages.iter().map(|record| record.outcome.clone()))
            .collect()
    }

    /// Outcome of a stage, if it was requested and reached.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| &record.outcome)
    }

    /// Number of stages actually executed.
    pub fn stages_run(&self) -> usize {
        self.stages
            .iter()
            .filter(|record| matches!(record.outcome, StageOutcome::Success | StageOutcome::Failed(_)))
            .count()
    }

    /// Number of executed stages that failed.
    pub fn stages_failed(&self) -> usize {
        self.stages
            .iter()
            .filter(|record| record.outcome.is_failure())
            .count()
    }

    fn finish(mut self, start: Instant) -> Self {
        self.duration = start.elapsed();
        self
    }
}

/// Set of subjects currently being processed.
#[derive(Debug, Clone, Default)]
pub struct ActiveSubjects {
    inner: Arc<Mutex<HashSet<SubjectKey>>>,
}

impl ActiveSubjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a subject, or returns `None` if it is already active.
    pub fn claim(&self, key: &SubjectKey) -> Option<SubjectClaim> {
        let mut active = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(key.clone()) {
            return None;
        }
        Some(SubjectClaim {
            key: key.clone(),
            active: Arc::clone(&self.inner),
        })
    }

    pub fn is_active(&self, key: &SubjectKey) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

/// Exclusive hold on a subject, released on drop.
#[derive(Debug)]
pub struct SubjectClaim {
    key: SubjectKey,
    active: Arc<Mutex<HashSet<SubjectKey>>>,
}

impl Drop for SubjectClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.key);
    }
}

/// A subject's ephemeral working area, removed when dropped.
#[derive(Debug)]
pub struct WorkArea {
    path: PathBuf,
    removed: bool,
}

impl WorkArea {
    /// Creates an empty working area, discarding leftovers of a crashed run.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            warn!(path = %path.display(), "Removing stale working area");
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the working area, reporting failure.
    pub fn remove(mut self) -> std::io::Result<()> {
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove working area");
            }
        }
    }
}

/// Recursively copies `from` into `to`.
pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Processes subjects one at a time.
///
/// Cheap to clone; every clone shares the same active-subject set.
#[derive(Clone)]
pub struct SubjectDriver {
    config: Arc<PipelineConfig>,
    executor: Arc<dyn StageExecutor>,
    locator: Arc<dyn DataLocator>,
    active: ActiveSubjects,
}

impl SubjectDriver {
    pub fn new(
        config: Arc<PipelineConfig>,
        executor: Arc<dyn StageExecutor>,
        locator: Arc<dyn DataLocator>,
    ) -> Self {
        Self {
            config,
            executor,
            locator,
            active: ActiveSubjects::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn active(&self) -> &ActiveSubjects {
        &self.active
    }

    /// Runs the requested stages for one subject.
    pub async fn process(&self, key: SubjectKey, requested: &StageSet) -> SubjectReport {
        let start = Instant::now();

        if self.config.exclusions.contains(&key) {
            info!(subject = %key, "Subject permanently excluded, skipping");
            return SubjectReport::new(key, SubjectStatus::Excluded);
        }

        let Some(_claim) = self.active.claim(&key) else {
            warn!(subject = %key, "Subject already being processed");
            return SubjectReport::subject_failure(key, SubjectStatus::Busy, FailureReason::SubjectBusy);
        };

        let subject = self.config.subject_layout().subject(key.clone());
        let table = &self.config.stages;
        let row = ledger::derive(table, &subject);
        let plan = StagePlanner::new(table).plan(&row, requested);

        if plan.is_noop() {
            debug!(subject = %key, "Nothing to run");
            let mut report = SubjectReport::new(key, SubjectStatus::NothingToDo);
            report.stages = plan
                .stages
                .into_iter()
                .filter_map(|planned| match planned.decision {
                    PlanDecision::Skip(reason) => Some(StageRecord {
                        stage: planned.stage,
                        outcome: StageOutcome::Skipped(reason),
                        duration: Duration::ZERO,
                    }),
                    PlanDecision::Run => None,
                })
                .collect();
            return report.finish(start);
        }

        let inputs = match self.locator.locate(&key, &subject.source_dir) {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(subject = %key, error = %e, "Raw data not found");
                return SubjectReport::subject_failure(
                    key,
                    SubjectStatus::DataNotFound,
                    FailureReason::DataNotFound {
                        message: e.to_string(),
                    },
                )
                .finish(start);
            }
        };

        let work_area = match self.prepare_work_area(&subject).await {
            Ok(area) => area,
            Err(message) => {
                warn!(subject = %key, error = %message, "Working area setup failed");
                return SubjectReport::subject_failure(
                    key,
                    SubjectStatus::SetupFailed,
                    FailureReason::Setup { message },
                )
                .finish(start);
            }
        };

        let ctx = StageContext {
            inputs: inputs.rebase(&subject.source_dir, work_area.path()),
            subject,
            threads: self.config.threads_per_subject,
            tool_root: self.config.tool_root.clone(),
        };

        let report = self.run_plan(&ctx, &row, plan.stages).await.finish(start);

        if let Err(e) = work_area.remove() {
            warn!(subject = %key, error = %e, "Failed to remove working area");
        }
        info!(subject = %key, status = %report.status, duration = ?report.duration, "Subject finished");
        report
    }

    async fn prepare_work_area(&self, subject: &Subject) -> Result<WorkArea, String> {
        let area = WorkArea::create(&subject.work_dir).map_err(|e| e.to_string())?;
        let from = subject.source_dir.clone();
        let to = area.path().to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        debug!(subject = %subject.key, bytes = copied, "Raw data copied into working area");
        Ok(area)
    }

    async fn run_plan(
        &self,
        ctx: &StageContext,
        row: &ledger::LedgerRow,
        planned: Vec<super::planner::PlannedStage>,
    ) -> SubjectReport {
        let table = &self.config.stages;
        let runner = StageRunner::new(table, self.executor.as_ref());
        let mut satisfied: StageSet = row.done_stages().collect();
        let mut aborted_after: Option<Stage> = None;
        let mut report = SubjectReport::new(ctx.subject.key.clone(), SubjectStatus::Completed);

        for planned_stage in planned {
            let stage = planned_stage.stage;
            let stage_start = Instant::now();

            let outcome = match planned_stage.decision {
                PlanDecision::Skip(reason) => StageOutcome::Skipped(reason),
                PlanDecision::Run => {
                    let missing: Vec<Stage> = table
                        .spec(stage)
                        .prerequisites
                        .iter()
                        .copied()
                        .filter(|prereq| !satisfied.contains(prereq))
                        .collect();

                    if !missing.is_empty() {
                        StageOutcome::Skipped(SkipReason::PrereqMissing { missing })
                    } else if let Some(after) = aborted_after {
                        StageOutcome::Skipped(SkipReason::SubjectAborted { after })
                    } else {
                        let outcome = runner.run(ctx, stage).await;
                        match &outcome {
                            StageOutcome::Success => {
                                satisfied.insert(stage);
                            }
                            StageOutcome::Failed(reason) if table.spec(stage).best_effort => {
                                info!(
                                    subject = %ctx.subject.key,
                                    stage = %stage,
                                    reason = %reason,
                                    "Best-effort stage failed, continuing"
                                );
                            }
                            StageOutcome::Failed(_) => {
                                aborted_after = Some(stage);
                                report.status = SubjectStatus::Failed { stage };
                            }
                            _ => {}
                        }
                        outcome
                    }
                }
            };

            if let StageOutcome::Skipped(reason) = &outcome {
                debug!(subject = %ctx.subject.key, stage = %stage, reason = %reason, "Stage skipped");
            }

            report.stages.push(StageRecord {
                stage,
                outcome,
                duration: stage_start.elapsed(),
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let active = ActiveSubjects::new();
        let key = SubjectKey::new("sub-01", "MAINZ");

        let claim = active.claim(&key).expect("first claim succeeds");
        assert!(active.claim(&key).is_none());
        assert!(active.claim(&SubjectKey::new("sub-01", "NAPLES")).is_some());

        drop(claim);
        assert!(!active.is_active(&key));
        assert!(active.claim(&key).is_some());
    }

    #[test]
    fn test_work_area_removed_on_drop() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("MAINZ/sub-01");
        {
            let area = WorkArea::create(&path).unwrap();
            fs::write(area.path().join("t1.nii"), b"data").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_work_area_discards_stale_content() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("work");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("stale"), b"x").unwrap();

        let area = WorkArea::create(&path).unwrap();
        assert!(!area.path().join("stale").exists());
        area.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_copy_tree() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("anat")).unwrap();
        fs::write(src.join("anat/t1.nii"), b"12345").unwrap();
        fs::write(src.join("notes.txt"), b"ab").unwrap();

        let dst = temp_dir.path().join("dst");
        let copied = copy_tree(&src, &dst).unwrap();

        assert_eq!(copied, 7);
        assert_eq!(fs::read(dst.join("anat/t1.nii")).unwrap(), b"12345");
    }

    #[test]
    fn test_excluded_report_outcomes() {
        let report = SubjectReport::new(SubjectKey::new("FIS_083", "CLINIC"), SubjectStatus::Excluded);
        assert_eq!(report.outcomes(), vec![StageOutcome::PermanentlyExcluded]);
    }

    #[test]
    fn test_subject_failure_outcomes() {
        let report = SubjectReport::subject_failure(
            SubjectKey::new("sub-01", "MAINZ"),
            SubjectStatus::DataNotFound,
            FailureReason::DataNotFound {
                message: "no t1w".to_string(),
            },
        );
        assert_eq!(report.outcomes().len(), 1);
        assert!(report.outcomes()[0].is_failure());
        assert_eq!(report.stages_run(), 0);
    }
}
