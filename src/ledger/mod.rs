//! Completion ledger.
//!
//! Whether a stage is done for a subject is derived from disk: the stage
//! is complete iff every declared artifact exists as a regular, non-empty
//! file under the subject's output directory. The CSV file written by
//! [`CompletionLedger::persist`] is a report of that derivation and is
//! never trusted as the source of truth.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::{Stage, StageTable};
use crate::subject::{Subject, SubjectKey};

/// Errors that can occur while reading or writing the ledger file.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The ledger lacks the subject id or center column.
    #[error("Ledger {path} has no '{column}' column")]
    MissingColumn { path: String, column: String },

    /// A stage cell holds something other than a boolean.
    #[error("Invalid value '{value}' in column '{column}' of {path}")]
    InvalidValue {
        path: String,
        column: String,
        value: String,
    },

    /// The temporary file could not be moved into place.
    #[error("Failed to persist ledger {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Completion flags of one subject. Every stage always has a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRow {
    done: BTreeMap<Stage, bool>,
}

impl Default for LedgerRow {
    fn default() -> Self {
        Self {
            done: Stage::ALL.into_iter().map(|stage| (stage, false)).collect(),
        }
    }
}

impl LedgerRow {
    /// A row with every stage not done.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder setting one stage flag.
    pub fn with(mut self, stage: Stage, done: bool) -> Self {
        self.set(stage, done);
        self
    }

    pub fn set(&mut self, stage: Stage, done: bool) {
        self.done.insert(stage, done);
    }

    /// Returns true if the stage is complete. Unknown stages are not.
    pub fn is_done(&self, stage: Stage) -> bool {
        self.done.get(&stage).copied().unwrap_or(false)
    }

    /// Stages that are complete, in fixed order.
    pub fn done_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|stage| self.is_done(*stage))
    }

    /// Returns true if every stage is complete.
    pub fn all_done(&self) -> bool {
        Stage::ALL.iter().all(|stage| self.is_done(*stage))
    }
}

/// Checks that a path is a regular, non-empty file.
pub fn artifact_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Artifacts of `stage` that are absent or empty for `subject`.
pub fn missing_artifacts(table: &StageTable, subject: &Subject, stage: Stage) -> Vec<PathBuf> {
    table
        .spec(stage)
        .artifact_paths(subject.id(), subject.center())
        .into_iter()
        .map(|relative| subject.output_path(relative))
        .filter(|path| !artifact_present(path))
        .collect()
}

/// Recomputes a subject's row from disk.
///
/// Pure with respect to disk state: calling it twice without touching the
/// filesystem yields the same row. A missing output directory yields a
/// row with every stage false.
pub fn derive(table: &StageTable, subject: &Subject) -> LedgerRow {
    let mut row = LedgerRow::empty();
    for stage in Stage::ALL {
        row.set(stage, missing_artifacts(table, subject, stage).is_empty());
    }
    row
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" | "" => Some(false),
        _ => None,
    }
}

/// The ledger table, keyed by subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionLedger {
    rows: BTreeMap<SubjectKey, LedgerRow>,
}

impl CompletionLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives rows for every given subject.
    pub fn derive_all<'a>(table: &StageTable, subjects: impl IntoIterator<Item = &'a Subject>) -> Self {
        let rows = subjects
            .into_iter()
            .map(|subject| (subject.key.clone(), derive(table, subject)))
            .collect();
        Self { rows }
    }

    pub fn get(&self, key: &SubjectKey) -> Option<&LedgerRow> {
        self.rows.get(key)
    }

    pub fn insert(&mut self, key: SubjectKey, row: LedgerRow) {
        self.rows.insert(key, row);
    }

    /// Replaces rows of `self` with those of `other`, keeping the rest.
    pub fn merge(&mut self, other: CompletionLedger) {
        self.rows.extend(other.rows);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubjectKey, &LedgerRow)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Subjects whose every stage is complete.
    pub fn completed(&self) -> impl Iterator<Item = &SubjectKey> {
        self.rows
            .iter()
            .filter(|(_, row)| row.all_done())
            .map(|(key, _)| key)
    }

    /// Loads a ledger file. A missing file is an empty ledger.
    ///
    /// Accepts `true/false/1/0` cells, the legacy `id`/`CENTER` headers
    /// and any stage alias as a stage column. Stage columns absent from
    /// the file read as not done; unrelated columns are ignored.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            debug!(path = %path.display(), "No ledger file, starting empty");
            return Ok(Self::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.clone();

        let column = |names: &[&str], label: &str| {
            headers
                .iter()
                .position(|h| names.contains(&h))
                .ok_or_else(|| LedgerError::MissingColumn {
                    path: path.display().to_string(),
                    column: label.to_string(),
                })
        };
        let id_col = column(&["subject_id", "id", "SubjID"], "subject_id")?;
        let center_col = column(&["center", "CENTER"], "center")?;

        // Stage columns go through the stage aliases, so the original
        // `fastsurfer`/`DWI_preproc`/`agg_SC`/`toTVB` headers are read too.
        let mut stage_cols: Vec<(Stage, usize)> = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Ok(stage) = header.parse::<Stage>() {
                if !stage_cols.iter().any(|(seen, _)| *seen == stage) {
                    stage_cols.push((stage, idx));
                }
            }
        }

        let mut ledger = Self::new();
        for record in reader.records() {
            let record = record?;
            let key = SubjectKey::new(
                record.get(id_col).unwrap_or_default(),
                record.get(center_col).unwrap_or_default(),
            );
            let mut row = LedgerRow::empty();
            for (stage, idx) in &stage_cols {
                let value = record.get(*idx).unwrap_or_default();
                let done = parse_flag(value).ok_or_else(|| LedgerError::InvalidValue {
                    path: path.display().to_string(),
                    column: stage.name().to_string(),
                    value: value.to_string(),
                })?;
                row.set(*stage, done);
            }
            ledger.insert(key, row);
        }
        Ok(ledger)
    }

    /// Writes the ledger atomically: a sibling temporary file is written
    /// in full, then renamed over `path`.
    pub fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            let mut header = vec!["subject_id", "center"];
            header.extend(Stage::ALL.iter().map(|s| s.name()));
            writer.write_record(&header)?;

            for (key, row) in &self.rows {
                let mut record = vec![key.subject_id.clone(), key.center.clone()];
                record.extend(Stage::ALL.iter().map(|s| row.is_done(*s).to_string()));
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;

        tmp.persist(path).map_err(|e| LedgerError::Persist {
            path: path.display().to_string(),
            source: e.error,
        })?;
        debug!(path = %path.display(), rows = self.rows.len(), "Ledger persisted");
        Ok(())
    }

    /// Logs every row of `self` that disagrees with `derived`.
    ///
    /// Returns the number of disagreeing rows.
    pub fn report_drift(&self, derived: &CompletionLedger) -> usize {
        let mut drift = 0;
        for (key, row) in &self.rows {
            if let Some(actual) = derived.get(key) {
                if actual != row {
                    drift += 1;
                    warn!(
                        subject = %key,
                        recorded = ?row.done_stages().collect::<Vec<_>>(),
                        on_disk = ?actual.done_stages().collect::<Vec<_>>(),
                        "Ledger row disagrees with disk, using disk"
                    );
                }
            }
        }
        drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectLayout;
    use tempfile::TempDir;

    fn write_artifact(subject: &Subject, relative: &str, contents: &[u8]) {
        let path = subject.output_path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn subject(root: &Path) -> Subject {
        SubjectLayout::new(root.join("raw"), root.join("out"), root.join("work"))
            .subject(SubjectKey::new("sub-01", "MAINZ"))
    }

    #[test]
    fn test_missing_output_dir_is_all_false() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let row = derive(&StageTable::default(), &subject(temp_dir.path()));
        assert!(Stage::ALL.iter().all(|s| !row.is_done(*s)));
    }

    #[test]
    fn test_derive_requires_every_non_empty_artifact() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let subject = subject(temp_dir.path());
        let table = StageTable::default();

        write_artifact(&subject, "recon_all/scripts/recon-all.done", b"ok");
        assert!(!derive(&table, &subject).is_done(Stage::Reconstruction));

        write_artifact(&subject, "recon_all/scripts/recon-surf.done", b"");
        assert!(!derive(&table, &subject).is_done(Stage::Reconstruction));

        write_artifact(&subject, "recon_all/scripts/recon-surf.done", b"ok");
        assert!(derive(&table, &subject).is_done(Stage::Reconstruction));
    }

    #[test]
    fn test_directory_is_not_an_artifact() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let subject = subject(temp_dir.path());
        fs::create_dir_all(subject.output_path("lst/sub-01_lesions.nii.gz")).unwrap();
        assert!(!derive(&StageTable::default(), &subject).is_done(Stage::LesionSeg));
    }

    #[test]
    fn test_derive_is_idempotent() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let subject = subject(temp_dir.path());
        write_artifact(&subject, "dt_recon/fa.nii.gz", b"x");
        write_artifact(&subject, "dt_recon/register.lta", b"x");

        let table = StageTable::default();
        let first = derive(&table, &subject);
        let second = derive(&table, &subject);
        assert_eq!(first, second);
        assert!(first.is_done(Stage::DiffusionProc));
    }

    #[test]
    fn test_persist_then_load() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("status/ledger.csv");

        let mut ledger = CompletionLedger::new();
        ledger.insert(
            SubjectKey::new("sub-01", "MAINZ"),
            LedgerRow::empty().with(Stage::Reconstruction, true),
        );
        ledger.insert(SubjectKey::new("FIS_001", "CLINIC"), LedgerRow::empty());
        ledger.persist(&path).expect("persist ledger");

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(
            "subject_id,center,reconstruction,lesion_seg,diffusion_proc,tractography,export"
        ));

        let loaded = CompletionLedger::load(&path).expect("load ledger");
        assert_eq!(loaded.len(), 2);
        let row = loaded.get(&SubjectKey::new("sub-01", "MAINZ")).unwrap();
        assert!(row.is_done(Stage::Reconstruction));
        assert!(!row.is_done(Stage::Export));
    }

    #[test]
    fn test_load_legacy_headers_and_missing_columns() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("legacy.csv");
        fs::write(
            &path,
            "id,CENTER,reconstruction,diffusion_proc\nFIS_002,CLINIC,True,1\nFIS_003,CLINIC,False,0\n",
        )
        .unwrap();

        let ledger = CompletionLedger::load(&path).expect("load legacy ledger");
        let row = ledger.get(&SubjectKey::new("FIS_002", "CLINIC")).unwrap();
        assert!(row.is_done(Stage::Reconstruction));
        assert!(row.is_done(Stage::DiffusionProc));
        assert!(!row.is_done(Stage::Tractography));
    }

    #[test]
    fn test_load_original_status_table() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("pipeline_status.csv");
        fs::write(
            &path,
            "id,CENTER,fastsurfer,DWI_preproc,agg_SC,fMRI,toTVB\nFIS_002,CLINIC,True,True,True,False,True\n",
        )
        .unwrap();

        let ledger = CompletionLedger::load(&path).expect("load original table");
        let row = ledger.get(&SubjectKey::new("FIS_002", "CLINIC")).unwrap();
        assert_eq!(
            row.done_stages().collect::<Vec<_>>(),
            vec![Stage::Reconstruction, Stage::DiffusionProc, Stage::Tractography, Stage::Export]
        );
        assert!(!row.is_done(Stage::LesionSeg));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let ledger = CompletionLedger::load(&temp_dir.path().join("absent.csv")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_load_rejects_garbage_cells() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("bad.csv");
        fs::write(&path, "subject_id,center,export\nsub-01,MAINZ,maybe\n").unwrap();
        let err = CompletionLedger::load(&path).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidValue { .. }));
    }

    #[test]
    fn test_merge_replaces_by_key() {
        let key = SubjectKey::new("sub-01", "MAINZ");
        let mut base = CompletionLedger::new();
        base.insert(key.clone(), LedgerRow::empty());
        base.insert(SubjectKey::new("sub-02", "MAINZ"), LedgerRow::empty());

        let mut update = CompletionLedger::new();
        update.insert(key.clone(), LedgerRow::empty().with(Stage::Export, true));
        base.merge(update);

        assert_eq!(base.len(), 2);
        assert!(base.get(&key).unwrap().is_done(Stage::Export));
    }

    #[test]
    fn test_report_drift() {
        let key = SubjectKey::new("sub-01", "MAINZ");
        let mut recorded = CompletionLedger::new();
        recorded.insert(key.clone(), LedgerRow::empty().with(Stage::Reconstruction, true));
        let mut derived = CompletionLedger::new();
        derived.insert(key, LedgerRow::empty().with(Stage::Reconstruction, false));

        assert_eq!(recorded.report_drift(&derived), 1);
        assert_eq!(derived.report_drift(&derived), 0);
    }
}
