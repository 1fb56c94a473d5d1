//! Stage planning.
//!
//! Given a subject's ledger row and the stages requested for the run, the
//! planner decides, stage by stage in fixed order, whether the stage runs
//! or is skipped and why. Stages that were not requested do not appear in
//! the plan at all.

use serde::Serialize;

use crate::ledger::LedgerRow;

use super::stage::{Stage, StageSet, StageTable};

/// Why a stage was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// All artifacts of the stage are already present.
    AlreadyDone,
    /// A prerequisite is neither done nor successfully run in this run.
    PrereqMissing { missing: Vec<Stage> },
    /// An unrelated stage failed fatally earlier for this subject.
    SubjectAborted { after: Stage },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyDone => write!(f, "already done"),
            SkipReason::PrereqMissing { missing } => {
                let names: Vec<&str> = missing.iter().map(|s| s.name()).collect();
                write!(f, "prerequisite missing: {}", names.join(", "))
            }
            SkipReason::SubjectAborted { after } => write!(f, "aborted after {} failed", after),
        }
    }
}

/// Planner decision for one requested stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDecision {
    Run,
    Skip(SkipReason),
}

/// A requested stage and what the planner decided for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub decision: PlanDecision,
}

/// Ordered plan for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub stages: Vec<PlannedStage>,
}

impl StagePlan {
    /// Stages to execute, in order.
    pub fn runnable(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|planned| planned.decision == PlanDecision::Run)
            .map(|planned| planned.stage)
            .collect()
    }

    /// Returns true if nothing will run.
    pub fn is_noop(&self) -> bool {
        self.stages
            .iter()
            .all(|planned| planned.decision != PlanDecision::Run)
    }

    /// Decision for a stage, if it was requested.
    pub fn decision(&self, stage: Stage) -> Option<&PlanDecision> {
        self.stages
            .iter()
            .find(|planned| planned.stage == stage)
            .map(|planned| &planned.decision)
    }
}

/// Computes stage plans from the stage table.
#[derive(Debug, Clone, Copy)]
pub struct StagePlanner<'a> {
    table: &'a StageTable,
}

impl<'a> StagePlanner<'a> {
    pub fn new(table: &'a StageTable) -> Self {
        Self { table }
    }

    /// Plans the requested stages for a subject.
    ///
    /// A requested stage runs iff it is not done and every prerequisite is
    /// either done or scheduled earlier in this plan, so one run can chain
    /// a subject through several incomplete stages.
    pub fn plan(&self, row: &LedgerRow, requested: &StageSet) -> StagePlan {
        let mut scheduled = StageSet::new();
        let mut stages = Vec::new();

        for stage in Stage::ALL {
            if !requested.contains(&stage) {
                continue;
            }

            let decision = if row.is_done(stage) {
                PlanDecision::Skip(SkipReason::AlreadyDone)
            } else {
                let missing: Vec<Stage> = self
                    .table
                    .spec(stage)
                    .prerequisites
                    .iter()
                    .copied()
                    .filter(|prereq| !row.is_done(*prereq) && !scheduled.contains(prereq))
                    .collect();

                if missing.is_empty() {
                    scheduled.insert(stage);
                    PlanDecision::Run
                } else {
                    PlanDecision::Skip(SkipReason::PrereqMissing { missing })
                }
            };

            stages.push(PlannedStage { stage, decision });
        }

        StagePlan { stages }
    }
}
