//! Pipeline orchestrator for multi-subject runs.
//!
//! This module provides the `PipelineOrchestrator` that coordinates:
//! - A bounded pool of subject workers
//! - Per-subject isolation and failure containment
//! - Run statistics
//! - Ledger refresh after all workers finish

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::datasets::DataLocator;
use crate::ledger::{CompletionLedger, LedgerError};
use crate::subject::SubjectKey;

use super::config::{ConfigError, PipelineConfig};
use super::driver::{SubjectDriver, SubjectReport, SubjectStatus};
use super::runner::{FailureReason, PipelineExecutor, StageExecutor};
use super::stage::StageSet;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error")]
    Config(#[from] ConfigError),

    /// Ledger file error.
    #[error("Ledger error")]
    Ledger(#[from] LedgerError),
}

/// Statistics about pipeline execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Number of subjects processed.
    pub total_subjects: u64,
    /// Subjects whose requested stages all ran or were already done.
    pub completed: u64,
    /// Subjects with a fatal stage or subject-level failure.
    pub failed: u64,
    /// Subjects on the exclusion list.
    pub excluded: u64,
    /// Subjects with nothing to run.
    pub nothing_to_do: u64,
    /// Stages executed across all subjects.
    pub stages_run: u64,
    /// Executed stages that failed, best-effort ones included.
    pub stages_failed: u64,
    /// Average subject duration.
    pub average_duration: Duration,
}

impl PipelineStats {
    /// Creates new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished subject.
    pub fn record(&mut self, report: &SubjectReport) {
        self.total_subjects += 1;
        match report.status {
            SubjectStatus::Completed => self.completed += 1,
            SubjectStatus::Excluded => self.excluded += 1,
            SubjectStatus::NothingToDo => self.nothing_to_do += 1,
            SubjectStatus::DataNotFound
            | SubjectStatus::SetupFailed
            | SubjectStatus::Busy
            | SubjectStatus::Failed { .. }
            | SubjectStatus::Panicked => self.failed += 1,
        }
        self.stages_run += report.stages_run() as u64;
        self.stages_failed += report.stages_failed() as u64;
        self.update_average_duration(report.duration);
    }

    /// Updates the running average duration.
    fn update_average_duration(&mut self, duration: Duration) {
        if self.total_subjects == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.total_subjects as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_val = duration.as_secs_f64();
            let new_avg = old_avg + (new_val - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }
}

/// Runs subjects concurrently on a bounded worker pool.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    driver: SubjectDriver,
    concurrency_limiter: Arc<Semaphore>,
    stats: Arc<tokio::sync::RwLock<PipelineStats>>,
    run_id: Uuid,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator running real tools and the configured site
    /// layouts.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let locator = Arc::new(config.layouts.clone());
        Self::with_collaborators(config, Arc::new(PipelineExecutor::new()), locator)
    }

    /// Creates an orchestrator with explicit executor and data locator.
    pub fn with_collaborators(
        config: PipelineConfig,
        executor: Arc<dyn StageExecutor>,
        locator: Arc<dyn DataLocator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let config = Arc::new(config);
        let concurrency_limiter = Arc::new(Semaphore::new(config.worker_count));
        let driver = SubjectDriver::new(Arc::clone(&config), executor, locator);

        Ok(Self {
            config,
            driver,
            concurrency_limiter,
            stats: Arc::new(tokio::sync::RwLock::new(PipelineStats::new())),
            run_id: Uuid::new_v4(),
        })
    }

    /// Processes every subject once, at most `worker_count` at a time.
    ///
    /// Duplicate keys are processed once. A worker that panics yields a
    /// `Panicked` report for its subject only. Results are keyed by
    /// subject, never by completion order.
    pub async fn run_all(
        &self,
        subjects: impl IntoIterator<Item = SubjectKey>,
        requested: &StageSet,
    ) -> BTreeMap<SubjectKey, SubjectReport> {
        let unique: BTreeSet<SubjectKey> = subjects.into_iter().collect();
        info!(
            run_id = %self.run_id,
            subjects = unique.len(),
            workers = self.config.worker_count,
            stages = ?requested,
            "Starting pipeline run"
        );

        let mut handles: Vec<(SubjectKey, JoinHandle<SubjectReport>)> = Vec::with_capacity(unique.len());
        for key in unique {
            let driver = self.driver.clone();
            let limiter = Arc::clone(&self.concurrency_limiter);
            let requested = requested.clone();
            let task_key = key.clone();

            handles.push((
                key,
                tokio::spawn(async move {
                    let _permit = match limiter.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return SubjectReport::subject_failure(
                                task_key,
                                SubjectStatus::SetupFailed,
                                FailureReason::Setup {
                                    message: format!("Failed to acquire permit: {}", e),
                                },
                            )
                        }
                    };
                    driver.process(task_key, &requested).await
                }),
            ));
        }

        let joined = futures::future::join_all(
            handles
                .into_iter()
                .map(|(key, handle)| async move { (key, handle.await) }),
        )
        .await;

        let mut reports = BTreeMap::new();
        for (key, joined) in joined {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(subject = %key, error = %e, "Subject worker panicked");
                    SubjectReport::subject_failure(
                        key.clone(),
                        SubjectStatus::Panicked,
                        FailureReason::Panicked {
                            message: e.to_string(),
                        },
                    )
                }
            };
            self.stats.write().await.record(&report);
            reports.insert(key, report);
        }

        let stats = self.stats().await;
        info!(
            run_id = %self.run_id,
            completed = stats.completed,
            failed = stats.failed,
            excluded = stats.excluded,
            "Pipeline run finished"
        );
        reports
    }

    /// Re-derives the ledger rows of `subjects` from disk and merges them
    /// into `prior`. Call only after every worker has finished.
    pub fn refresh_ledger<'a>(
        &self,
        prior: &CompletionLedger,
        subjects: impl IntoIterator<Item = &'a SubjectKey>,
    ) -> CompletionLedger {
        let layout = self.config.subject_layout();
        let resolved: Vec<_> = subjects
            .into_iter()
            .map(|key| layout.subject(key.clone()))
            .collect();
        let derived = CompletionLedger::derive_all(&self.config.stages, &resolved);

        let mut ledger = prior.clone();
        ledger.merge(derived);
        ledger
    }

    /// Loads the ledger at `path`, refreshes it for `subjects`, logs drift
    /// against disk, and persists the result atomically.
    pub fn refresh_ledger_file(
        &self,
        path: &Path,
        subjects: &[SubjectKey],
    ) -> Result<CompletionLedger, PipelineError> {
        let prior = CompletionLedger::load(path)?;
        self.persist_refreshed(&prior, path, subjects)
    }

    /// Refreshes an already loaded ledger for `subjects`, logs drift
    /// against disk, and persists the result atomically at `path`.
    pub fn persist_refreshed(
        &self,
        prior: &CompletionLedger,
        path: &Path,
        subjects: &[SubjectKey],
    ) -> Result<CompletionLedger, PipelineError> {
        let ledger = self.refresh_ledger(prior, subjects);
        let drift = prior.report_drift(&ledger);
        ledger.persist(path)?;
        info!(path = %path.display(), rows = ledger.len(), drift, "Ledger refreshed");
        Ok(ledger)
    }

    /// Gets the current pipeline statistics.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Gets the current configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Identifier of this orchestrator's run, used in logs.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runner::StageOutcome;
    use crate::pipeline::Stage;

    fn report(status: SubjectStatus, secs: u64) -> SubjectReport {
        let mut report = SubjectReport::subject_failure(
            SubjectKey::new("s", "MAINZ"),
            status,
            FailureReason::SubjectBusy,
        );
        report.duration = Duration::from_secs(secs);
        report
    }

    #[test]
    fn test_stats_record_and_average() {
        let mut stats = PipelineStats::new();
        stats.record(&report(SubjectStatus::Completed, 10));
        stats.record(&report(SubjectStatus::Failed { stage: Stage::Tractography }, 20));
        stats.record(&report(SubjectStatus::Excluded, 30));

        assert_eq!(stats.total_subjects, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.excluded, 1);
        assert_eq!(stats.average_duration, Duration::from_secs(20));
    }

    #[test]
    fn test_stats_count_stages() {
        let mut report = report(SubjectStatus::Completed, 1);
        report.failure = None;
        report.stages = vec![
            crate::pipeline::StageRecord {
                stage: Stage::Reconstruction,
                outcome: StageOutcome::Success,
                duration: Duration::ZERO,
            },
            crate::pipeline::StageRecord {
                stage: Stage::LesionSeg,
                outcome: StageOutcome::Failed(FailureReason::ExitStatus { code: 1 }),
                duration: Duration::ZERO,
            },
        ];

        let mut stats = PipelineStats::new();
        stats.record(&report);
        assert_eq!(stats.stages_run, 2);
        assert_eq!(stats.stages_failed, 1);
    }

    #[test]
    fn test_error_display_does_not_repeat_source() {
        use std::error::Error as _;

        let err = PipelineError::from(LedgerError::MissingColumn {
            path: "ledger.csv".to_string(),
            column: "center".to_string(),
        });
        assert_eq!(err.to_string(), "Ledger error");
        let source = err.source().expect("ledger error is the source");
        assert!(source.to_string().contains("center"));
        assert_eq!(format!("{:#}", anyhow::Error::from(err)).matches("center").count(), 1);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PipelineConfig::default().with_worker_count(0);
        assert!(matches!(
            PipelineOrchestrator::new(config),
            Err(PipelineError::Config(_))
        ));
    }
}
