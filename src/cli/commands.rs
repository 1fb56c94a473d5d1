//! CLI command definitions for brainprep.
//!
//! Every command works from a subject manifest. Configuration is layered:
//! built-in defaults, then `--config` YAML, then `BRAINPREP_*` variables,
//! then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::export::collect_results;
use crate::ledger::{self, CompletionLedger};
use crate::pipeline::{
    PipelineConfig, PipelineOrchestrator, PipelineStats, Stage, StagePlan, StagePlanner, StageSet,
    SubjectReport, SubjectStatus,
};
use crate::subject::{load_manifest, load_subset, select_subset, SubjectKey};

/// Ledger file name used when `--ledger` is not given.
const DEFAULT_LEDGER_FILE: &str = "pipeline_status.csv";

/// Multi-center neuroimaging preprocessing orchestrator.
#[derive(Parser)]
#[command(name = "brainprep")]
#[command(about = "Run and track multi-center neuroimaging preprocessing")]
#[command(version)]
#[command(
    long_about = "brainprep runs the reconstruction, lesion segmentation, diffusion, tractography and export stages over a subject manifest.\n\nCompletion is derived from the artifacts on disk, so re-running a command only executes what is missing.\n\nExample usage:\n  brainprep run --manifest subjects.csv --input-dir /data/raw --output-dir /data/processed --all --jobs 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the requested stages for every manifest subject.
    Run(RunArgs),

    /// Re-derive the completion ledger from disk and persist it.
    #[command(alias = "status")]
    Check(CheckArgs),

    /// Print each subject's plan without running anything.
    Plan(PlanArgs),

    /// Copy exported results of completed subjects into a bundle directory.
    Collect(CollectArgs),
}

/// Options shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// Subject manifest (CSV with subject_id,center columns).
    #[arg(short = 'm', long)]
    pub manifest: PathBuf,

    /// Restrict the run to the subjects listed in this file.
    #[arg(short = 's', long)]
    pub subjects: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Root of the raw multi-center data.
    #[arg(short = 'i', long)]
    pub input_dir: Option<PathBuf>,

    /// Root of the per-subject outputs.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Root under which working areas are created.
    #[arg(short = 'w', long)]
    pub work_dir: Option<PathBuf>,

    /// Completion ledger file (default: <output-dir>/pipeline_status.csv).
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Base directory of the stage scripts.
    #[arg(long)]
    pub tool_root: Option<PathBuf>,

    /// Output JSON instead of a text summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Stage selection flags.
#[derive(Parser, Debug, Clone, Default)]
pub struct StageFlags {
    /// Surface reconstruction.
    #[arg(long, visible_alias = "fs")]
    pub reconstruction: bool,

    /// Lesion segmentation (best effort).
    #[arg(long, visible_alias = "lst")]
    pub lesion_seg: bool,

    /// Diffusion processing.
    #[arg(long, visible_alias = "dt")]
    pub diffusion: bool,

    /// Tractography.
    #[arg(long, visible_alias = "tck")]
    pub tractography: bool,

    /// Connectivity export for the brain simulator.
    #[arg(long, visible_alias = "tvb")]
    pub export: bool,

    /// Every stage.
    #[arg(long)]
    pub all: bool,
}

impl StageFlags {
    /// The requested stage set.
    pub fn requested(&self) -> StageSet {
        if self.all {
            return Stage::ALL.into_iter().collect();
        }
        [
            (self.reconstruction, Stage::Reconstruction),
            (self.lesion_seg, Stage::LesionSeg),
            (self.diffusion, Stage::DiffusionProc),
            (self.tractography, Stage::Tractography),
            (self.export, Stage::Export),
        ]
        .into_iter()
        .filter_map(|(on, stage)| on.then_some(stage))
        .collect()
    }
}

/// Arguments for `brainprep run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub stages: StageFlags,

    /// Number of subjects processed concurrently.
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Threads handed to each subject's tools.
    #[arg(long)]
    pub threads: Option<usize>,
}

/// Arguments for `brainprep check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Arguments for `brainprep plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub stages: StageFlags,
}

/// Arguments for `brainprep collect`.
#[derive(Parser, Debug)]
pub struct CollectArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Bundle directory receiving `<center>_<subject>/results/`.
    #[arg(short = 'd', long)]
    pub dest: PathBuf,

    /// Only collect subjects of this center.
    #[arg(long)]
    pub center: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the brainprep CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Check(args) => run_check_command(args),
        Commands::Plan(args) => run_plan_command(args),
        Commands::Collect(args) => run_collect_command(args),
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn build_config(args: &PipelineArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::new();
    if let Some(path) = &args.config {
        config
            .apply_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
    }
    config.apply_env()?;

    if let Some(dir) = &args.input_dir {
        config.input_root = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_root = dir.clone();
    }
    if let Some(dir) = &args.work_dir {
        config.work_root = dir.clone();
    }
    if let Some(dir) = &args.tool_root {
        config.tool_root = dir.clone();
    }
    Ok(config)
}

fn ledger_path(args: &PipelineArgs, config: &PipelineConfig) -> PathBuf {
    args.ledger
        .clone()
        .unwrap_or_else(|| config.output_root.join(DEFAULT_LEDGER_FILE))
}

fn load_subjects(args: &PipelineArgs) -> anyhow::Result<Vec<SubjectKey>> {
    let manifest = load_manifest(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;

    let Some(subset_path) = &args.subjects else {
        return Ok(manifest);
    };
    let subset = load_subset(subset_path)
        .with_context(|| format!("Failed to load subject list {}", subset_path.display()))?;
    let selected = select_subset(&manifest, &subset);
    if selected.len() < subset.len() {
        warn!(
            requested = subset.len(),
            found = selected.len(),
            "Some listed subjects are not in the manifest"
        );
    }
    Ok(selected)
}

fn require_stages(flags: &StageFlags) -> anyhow::Result<StageSet> {
    let requested = flags.requested();
    if requested.is_empty() {
        anyhow::bail!(
            "No stages requested.\n\
             Pass --all or any of --reconstruction, --lesion-seg, --diffusion, --tractography, --export."
        );
    }
    Ok(requested)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

#[derive(Serialize)]
struct RunOutput<'a> {
    run_id: String,
    ledger: String,
    stats: PipelineStats,
    subjects: Vec<&'a SubjectReport>,
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let requested = require_stages(&args.stages)?;
    let mut config = build_config(&args.pipeline)?;
    if let Some(jobs) = args.jobs {
        config.worker_count = jobs;
    }
    if let Some(threads) = args.threads {
        config.threads_per_subject = threads;
    }

    let ledger_file = ledger_path(&args.pipeline, &config);
    let subjects = load_subjects(&args.pipeline)?;
    let prior = CompletionLedger::load(&ledger_file)
        .with_context(|| format!("Failed to read ledger {}", ledger_file.display()))?;
    let orchestrator = PipelineOrchestrator::new(config)?;

    let reports = orchestrator.run_all(subjects.iter().cloned(), &requested).await;
    if let Err(e) = orchestrator.persist_refreshed(&prior, &ledger_file, &subjects) {
        error!(
            path = %ledger_file.display(),
            error = %e,
            "Failed to update ledger, rerun `brainprep check` to rebuild it"
        );
    }
    let stats = orchestrator.stats().await;

    if args.pipeline.json {
        return print_json(&RunOutput {
            run_id: orchestrator.run_id().to_string(),
            ledger: ledger_file.display().to_string(),
            stats,
            subjects: reports.values().collect(),
        });
    }

    for report in reports.values() {
        let marker = match report.status {
            SubjectStatus::Completed | SubjectStatus::NothingToDo | SubjectStatus::Excluded => "✓",
            _ => "✗",
        };
        println!("{} {} [{}]", marker, report.subject, report.status);
        if let Some(failure) = &report.failure {
            println!("    {}", failure);
        }
        for record in &report.stages {
            println!("    {:<16} {}", record.stage.name(), record.outcome);
        }
    }
    println!();
    println!("✓ Run {} finished", orchestrator.run_id());
    println!(
        "  Subjects: {} completed, {} failed, {} excluded, {} nothing to do",
        stats.completed, stats.failed, stats.excluded, stats.nothing_to_do
    );
    println!(
        "  Stages: {} run, {} failed",
        stats.stages_run, stats.stages_failed
    );
    println!("  Ledger: {}", ledger_file.display());
    Ok(())
}

#[derive(Serialize)]
struct CheckOutput {
    ledger: String,
    subjects: usize,
    stages_done: Vec<StageCount>,
    fully_done: usize,
}

#[derive(Serialize)]
struct StageCount {
    stage: Stage,
    done: usize,
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let config = build_config(&args.pipeline)?;
    let ledger_file = ledger_path(&args.pipeline, &config);
    let subjects = load_subjects(&args.pipeline)?;
    let orchestrator = PipelineOrchestrator::new(config)?;

    let ledger = orchestrator
        .refresh_ledger_file(&ledger_file, &subjects)
        .with_context(|| format!("Failed to update ledger {}", ledger_file.display()))?;

    let rows: Vec<_> = subjects.iter().filter_map(|key| ledger.get(key)).collect();
    let output = CheckOutput {
        ledger: ledger_file.display().to_string(),
        subjects: rows.len(),
        stages_done: Stage::ALL
            .into_iter()
            .map(|stage| StageCount {
                stage,
                done: rows.iter().filter(|row| row.is_done(stage)).count(),
            })
            .collect(),
        fully_done: rows.iter().filter(|row| row.all_done()).count(),
    };

    if args.pipeline.json {
        return print_json(&output);
    }

    info!(subjects = output.subjects, fully_done = output.fully_done, "Ledger checked");
    println!("✓ Ledger written to {}", output.ledger);
    for count in &output.stages_done {
        println!("  {:<16} {}/{}", count.stage.name(), count.done, output.subjects);
    }
    println!("  {:<16} {}/{}", "all", output.fully_done, output.subjects);
    Ok(())
}

#[derive(Serialize)]
struct PlannedSubject {
    subject: SubjectKey,
    excluded: bool,
    plan: StagePlan,
}

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let requested = require_stages(&args.stages)?;
    let config = build_config(&args.pipeline)?;
    config.validate()?;
    let subjects = load_subjects(&args.pipeline)?;

    let layout = config.subject_layout();
    let planner = StagePlanner::new(&config.stages);
    let planned: Vec<PlannedSubject> = subjects
        .into_iter()
        .map(|key| {
            let excluded = config.exclusions.contains(&key);
            let plan = if excluded {
                StagePlan::default()
            } else {
                let row = ledger::derive(&config.stages, &layout.subject(key.clone()));
                planner.plan(&row, &requested)
            };
            PlannedSubject {
                subject: key,
                excluded,
                plan,
            }
        })
        .collect();

    if args.pipeline.json {
        return print_json(&planned);
    }

    for entry in &planned {
        if entry.excluded {
            println!("{}: excluded", entry.subject);
            continue;
        }
        let runnable = entry.plan.runnable();
        let names: Vec<&str> = runnable.iter().map(|s| s.name()).collect();
        if names.is_empty() {
            println!("{}: nothing to do", entry.subject);
        } else {
            println!("{}: {}", entry.subject, names.join(" -> "));
        }
    }
    Ok(())
}

fn run_collect_command(args: CollectArgs) -> anyhow::Result<()> {
    let config = build_config(&args.pipeline)?;
    let subjects = load_subjects(&args.pipeline)?;

    let layout = config.subject_layout();
    let resolved: Vec<_> = subjects.iter().map(|key| layout.subject(key.clone())).collect();
    let ledger = CompletionLedger::derive_all(&config.stages, &resolved);

    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("Failed to create {}", args.dest.display()))?;
    let summary = collect_results(&ledger, &layout, Path::new(&args.dest), args.center.as_deref())?;

    if args.pipeline.json {
        return print_json(&summary);
    }

    println!(
        "✓ Collected {} subject(s) into {}",
        summary.collected.len(),
        args.dest.display()
    );
    for skipped in &summary.skipped {
        println!("  skipped {}: {}", skipped.subject, skipped.reason);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_stage_flag_aliases() {
        let cli = Cli::try_parse_from([
            "brainprep", "run", "--manifest", "m.csv", "--fs", "--tck", "--tvb",
        ])
        .expect("parses");
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let requested: Vec<Stage> = args.stages.requested().into_iter().collect();
        assert_eq!(
            requested,
            vec![Stage::Reconstruction, Stage::Tractography, Stage::Export]
        );
    }

    #[test]
    fn test_all_flag_requests_every_stage() {
        let flags = StageFlags {
            all: true,
            ..StageFlags::default()
        };
        assert_eq!(flags.requested().len(), Stage::ALL.len());
        assert!(require_stages(&StageFlags::default()).is_err());
    }

    #[tokio::test]
    async fn test_run_rejects_bad_ledger_before_any_stage() {
        let temp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path();
        let manifest = root.join("subjects.csv");
        std::fs::write(&manifest, "subject_id,center\nsub-01,BIDS\n").unwrap();
        let ledger = root.join("ledger.csv");
        std::fs::write(&ledger, "subject_id,center,reconstruction\nsub-01,BIDS,yes\n").unwrap();

        let path = |p: &Path| p.display().to_string();
        let cli = Cli::try_parse_from([
            "brainprep".to_string(),
            "run".to_string(),
            "--manifest".to_string(),
            path(&manifest),
            "--ledger".to_string(),
            path(&ledger),
            "--input-dir".to_string(),
            path(&root.join("raw")),
            "--output-dir".to_string(),
            path(&root.join("out")),
            "--work-dir".to_string(),
            path(&root.join("work")),
            "--fs".to_string(),
        ])
        .expect("parses");

        let err = run_with_cli(cli).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read ledger"));
        assert!(!root.join("out").exists());
        assert!(!root.join("work").exists());
        assert!(std::fs::read_to_string(&ledger).unwrap().contains("yes"));
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "brainprep",
            "check",
            "--manifest",
            "m.csv",
            "--input-dir",
            "/raw",
            "--output-dir",
            "/out",
            "--work-dir",
            "/scratch",
        ])
        .expect("parses");
        let Commands::Check(args) = cli.command else {
            panic!("expected check command");
        };
        let config = build_config(&args.pipeline).expect("config builds");
        assert_eq!(config.input_root, PathBuf::from("/raw"));
        assert_eq!(config.work_root, PathBuf::from("/scratch"));
        assert_eq!(
            ledger_path(&args.pipeline, &config),
            PathBuf::from("/out/pipeline_status.csv")
        );
    }
}
