//! Stage definitions and the per-stage policy table.
//!
//! The stage set is fixed and ordered. What each stage needs, produces and
//! runs is data (`StageSpec`), so sites can override policy from the YAML
//! configuration without touching the planner or runner.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tools::ToolCommand;

use super::config::ConfigError;

/// One step of the subject-level pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Surface reconstruction of the T1 image.
    Reconstruction,
    /// White-matter lesion segmentation from FLAIR.
    LesionSeg,
    /// Diffusion preprocessing and tensor reconstruction.
    DiffusionProc,
    /// Tractography and structural connectome aggregation.
    Tractography,
    /// Export of connectivity matrices for the brain simulator.
    Export,
}

impl Stage {
    /// All stages in fixed dependency order.
    pub const ALL: [Stage; 5] = [
        Stage::Reconstruction,
        Stage::LesionSeg,
        Stage::DiffusionProc,
        Stage::Tractography,
        Stage::Export,
    ];

    /// Canonical name, used for ledger columns and log files.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Reconstruction => "reconstruction",
            Stage::LesionSeg => "lesion_seg",
            Stage::DiffusionProc => "diffusion_proc",
            Stage::Tractography => "tractography",
            Stage::Export => "export",
        }
    }

    /// Position in the fixed order.
    pub fn index(&self) -> usize {
        match self {
            Stage::Reconstruction => 0,
            Stage::LesionSeg => 1,
            Stage::DiffusionProc => 2,
            Stage::Tractography => 3,
            Stage::Export => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reconstruction" | "recon" | "fs" | "fastsurfer" => Ok(Stage::Reconstruction),
            "lesion_seg" | "lesion-seg" | "lst" => Ok(Stage::LesionSeg),
            "diffusion_proc" | "diffusion-proc" | "diffusion" | "dt" | "dwi_preproc" => {
                Ok(Stage::DiffusionProc)
            }
            "tractography" | "tck" | "tracking" | "agg_sc" => Ok(Stage::Tractography),
            "export" | "tvb" | "totvb" => Ok(Stage::Export),
            other => Err(format!("Unknown stage: {}", other)),
        }
    }
}

/// Ordered set of stages requested for a run.
pub type StageSet = BTreeSet<Stage>;

/// One unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageStep {
    /// Run an external tool as a subprocess.
    Tool(ToolCommand),
    /// Relabel a segmentation volume (path relative to the output dir).
    Relabel { segmentation: String },
    /// Write the connectivity matrices for the brain simulator.
    ExportConnectivity,
}

/// Declared policy of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Direct prerequisite stages.
    #[serde(default)]
    pub prerequisites: Vec<Stage>,
    /// Output files (relative to the subject output dir, `{subject}` and
    /// `{center}` templated) whose presence means the stage is done.
    pub artifacts: Vec<String>,
    /// A best-effort stage never blocks later stages when it fails.
    #[serde(default)]
    pub best_effort: bool,
    /// Output-relative directories removed before the stage runs.
    #[serde(default)]
    pub clean_before: Vec<String>,
    /// Raw inputs the stage cannot run without.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Work performed by the stage, in order.
    pub steps: Vec<StageStep>,
}

impl StageSpec {
    fn tool(program: &str, args: &[&str]) -> StageStep {
        StageStep::Tool(ToolCommand::new(program, args.iter().map(|a| a.to_string())))
    }

    /// Renders the artifact paths for a subject.
    pub fn artifact_paths(&self, subject_id: &str, center: &str) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|artifact| {
                artifact
                    .replace("{subject}", subject_id)
                    .replace("{center}", center)
            })
            .collect()
    }
}

/// The complete stage policy table, one spec per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTable {
    specs: BTreeMap<Stage, StageSpec>,
}

impl Default for StageTable {
    fn default() -> Self {
        let mut specs = BTreeMap::new();

        specs.insert(
            Stage::Reconstruction,
            StageSpec {
                prerequisites: Vec::new(),
                artifacts: vec![
                    "recon_all/scripts/recon-all.done".to_string(),
                    "recon_all/scripts/recon-surf.done".to_string(),
                ],
                best_effort: false,
                clean_before: Vec::new(),
                required_inputs: vec!["t1w".to_string()],
                steps: vec![StageSpec::tool(
                    "scripts/FastSurfer.sh",
                    &["{subject}", "{input.t1w}", "{output_dir}"],
                )],
            },
        );

        specs.insert(
            Stage::LesionSeg,
            StageSpec {
                prerequisites: Vec::new(),
                artifacts: vec!["lst/{subject}_lesions.nii.gz".to_string()],
                best_effort: true,
                clean_before: vec!["lst".to_string()],
                required_inputs: vec!["t1w".to_string(), "flair".to_string()],
                steps: vec![StageSpec::tool(
                    "scripts/runLST.sh",
                    &["{subject}", "{input.t1w}", "{input.flair}", "{output_dir}", "{center}"],
                )],
            },
        );

        specs.insert(
            Stage::DiffusionProc,
            StageSpec {
                prerequisites: vec![Stage::Reconstruction],
                artifacts: vec![
                    "dt_recon/fa.nii.gz".to_string(),
                    "dt_recon/register.lta".to_string(),
                ],
                best_effort: false,
                clean_before: vec![
                    "dt_recon".to_string(),
                    "dt_proc".to_string(),
                    "dt_recon_lowshell".to_string(),
                ],
                required_inputs: vec!["dwi".to_string(), "bval".to_string(), "bvec".to_string()],
                steps: vec![StageSpec::tool(
                    "scripts/DT_recon.sh",
                    &[
                        "{subject}",
                        "{output_dir}",
                        "{input.dwi}",
                        "{input.dwi2}",
                        "{input.bval}",
                        "{input.bvec}",
                        "{input.lesions}",
                        "{center}",
                        "{input.dwi_ph}",
                        "{input.dwi_mag}",
                        "{input.dwi_json}",
                        "{input.bval2}",
                        "{input.bvec2}",
                    ],
                )],
            },
        );

        specs.insert(
            Stage::Tractography,
            StageSpec {
                prerequisites: vec![Stage::Reconstruction, Stage::DiffusionProc],
                artifacts: vec![
                    "dt_proc/connectome_weights.csv".to_string(),
                    "dt_proc/connectome_lengths.csv".to_string(),
                ],
                best_effort: false,
                clean_before: Vec::new(),
                required_inputs: Vec::new(),
                steps: vec![
                    StageStep::Relabel {
                        segmentation: "recon_all/mri/aparc.DKTatlas+aseg.nii.gz".to_string(),
                    },
                    StageSpec::tool("scripts/Tracking.sh", &["{subject}", "{output_dir}"]),
                ],
            },
        );

        specs.insert(
            Stage::Export,
            StageSpec {
                prerequisites: vec![Stage::DiffusionProc, Stage::Tractography],
                artifacts: vec![
                    "results/{subject}_SC_weights.txt".to_string(),
                    "results/{subject}_SC_distances.txt".to_string(),
                    "results/centres.txt".to_string(),
                ],
                best_effort: false,
                clean_before: Vec::new(),
                required_inputs: Vec::new(),
                steps: vec![StageStep::ExportConnectivity],
            },
        );

        Self { specs }
    }
}

impl StageTable {
    /// Returns the spec of a stage.
    ///
    /// Every table is validated to cover all stages, so this never fails
    /// on a table obtained through `Default` or `validate`.
    pub fn spec(&self, stage: Stage) -> &StageSpec {
        &self.specs[&stage]
    }

    /// Replaces the spec of one stage.
    pub fn with_spec(mut self, stage: Stage, spec: StageSpec) -> Self {
        self.specs.insert(stage, spec);
        self
    }

    /// Marks a stage as best-effort or fatal.
    pub fn with_best_effort(mut self, stage: Stage, best_effort: bool) -> Self {
        if let Some(spec) = self.specs.get_mut(&stage) {
            spec.best_effort = best_effort;
        }
        self
    }

    /// Stages in fixed order with their specs.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageSpec)> {
        Stage::ALL.iter().map(move |stage| (*stage, self.spec(*stage)))
    }

    /// Returns true if `stage` depends on `on`, directly or transitively.
    pub fn depends_on(&self, stage: Stage, on: Stage) -> bool {
        let mut pending = self.spec(stage).prerequisites.clone();
        let mut seen = StageSet::new();
        while let Some(next) = pending.pop() {
            if next == on {
                return true;
            }
            if seen.insert(next) {
                pending.extend(self.spec(next).prerequisites.iter().copied());
            }
        }
        false
    }

    /// Validates the table.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if a stage is missing, a
    /// prerequisite does not come strictly earlier in the fixed order, or
    /// a stage declares no artifacts or no steps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            let spec = self.specs.get(&stage).ok_or_else(|| {
                ConfigError::ValidationFailed(format!("stage '{}' has no spec", stage))
            })?;

            if spec.artifacts.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}' must declare at least one artifact",
                    stage
                )));
            }

            if spec.steps.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}' must declare at least one step",
                    stage
                )));
            }

            for prereq in &spec.prerequisites {
                if prereq.index() >= stage.index() {
                    return Err(ConfigError::ValidationFailed(format!(
                        "stage '{}' cannot depend on later stage '{}'",
                        stage, prereq
                    )));
                }
            }
        }
        Ok(())
    }
}
