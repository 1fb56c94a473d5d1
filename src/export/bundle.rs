//! Collects finished connectivity results into a delivery directory.
//!
//! Every subject whose export stage is done in the ledger gets
//! `<dest>/<center>_<subject>/results/` holding its connectivity files,
//! with the subject matrices prefixed by the center tag.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ledger::CompletionLedger;
use crate::pipeline::Stage;
use crate::subject::{SubjectKey, SubjectLayout};

use super::ExportError;

/// Simulator files copied unchanged when present.
const SHARED_FILES: [&str; 3] = ["weights.txt", "tract_lengths.txt", "centres.txt"];

/// Subject matrices that must exist for a subject to be collected.
const SUBJECT_MATRICES: [&str; 2] = ["SC_weights", "SC_distances"];

/// Result of a collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleSummary {
    pub collected: Vec<SubjectKey>,
    pub skipped: Vec<SkippedSubject>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSubject {
    pub subject: SubjectKey,
    pub reason: String,
}

/// Destination directory of a subject inside the bundle.
pub fn bundle_dir(dest: &Path, key: &SubjectKey) -> PathBuf {
    dest.join(format!("{}_{}", key.center, key.subject_id))
        .join("results")
}

/// Copies the results of every exported subject, optionally restricted
/// to one center.
pub fn collect_results(
    ledger: &CompletionLedger,
    layout: &SubjectLayout,
    dest: &Path,
    center: Option<&str>,
) -> Result<BundleSummary, ExportError> {
    let mut summary = BundleSummary::default();

    let exported = ledger
        .iter()
        .filter(|(key, _)| center.map_or(true, |c| key.center == c))
        .filter(|(_, row)| row.is_done(Stage::Export))
        .map(|(key, _)| key);

    for key in exported {
        let source = layout.output_dir(key).join("results");
        let missing: Vec<String> = SUBJECT_MATRICES
            .iter()
            .map(|m| format!("{}_{}.txt", key.subject_id, m))
            .filter(|name| !source.join(name).is_file())
            .collect();
        if !missing.is_empty() {
            warn!(subject = %key, missing = ?missing, "Subject results incomplete, skipping");
            summary.skipped.push(SkippedSubject {
                subject: key.clone(),
                reason: format!("missing {}", missing.join(", ")),
            });
            continue;
        }

        let target = bundle_dir(dest, key);
        std::fs::create_dir_all(&target)?;

        for matrix in SUBJECT_MATRICES {
            let name = format!("{}_{}.txt", key.subject_id, matrix);
            let renamed = format!("{}_{}_{}.txt", key.center, key.subject_id, matrix);
            std::fs::copy(source.join(&name), target.join(renamed))?;
        }
        for name in SHARED_FILES {
            let file = source.join(name);
            if file.is_file() {
                std::fs::copy(&file, target.join(name))?;
            }
        }

        debug!(subject = %key, target = %target.display(), "Results collected");
        summary.collected.push(key.clone());
    }

    info!(
        collected = summary.collected.len(),
        skipped = summary.skipped.len(),
        dest = %dest.display(),
        "Result collection complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerRow;
    use tempfile::TempDir;

    fn write_results(layout: &SubjectLayout, key: &SubjectKey, with_distances: bool) {
        let dir = layout.output_dir(key).join("results");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}_SC_weights.txt", key.subject_id)), "w").unwrap();
        if with_distances {
            std::fs::write(dir.join(format!("{}_SC_distances.txt", key.subject_id)), "d").unwrap();
        }
        std::fs::write(dir.join("centres.txt"), "c").unwrap();
    }

    fn exported() -> LedgerRow {
        LedgerRow::empty()
            .with(Stage::Reconstruction, true)
            .with(Stage::DiffusionProc, true)
            .with(Stage::Tractography, true)
            .with(Stage::Export, true)
    }

    #[test]
    fn test_collect_results_renames_subject_matrices() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let layout = SubjectLayout::new("/raw", temp_dir.path().join("out"), "/work");
        let dest = temp_dir.path().join("bundle");

        let done = SubjectKey::new("sub-01", "NAPLES");
        let pending = SubjectKey::new("sub-02", "NAPLES");
        write_results(&layout, &done, true);
        write_results(&layout, &pending, true);

        let mut ledger = CompletionLedger::new();
        ledger.insert(done.clone(), exported());
        ledger.insert(pending.clone(), LedgerRow::empty().with(Stage::Reconstruction, true));

        let summary = collect_results(&ledger, &layout, &dest, None).expect("collect succeeds");
        assert_eq!(summary.collected, vec![done.clone()]);

        let target = bundle_dir(&dest, &done);
        assert!(target.join("NAPLES_sub-01_SC_weights.txt").is_file());
        assert!(target.join("NAPLES_sub-01_SC_distances.txt").is_file());
        assert!(target.join("centres.txt").is_file());
        assert!(!target.join("weights.txt").exists());
        assert!(!bundle_dir(&dest, &pending).exists());
    }

    #[test]
    fn test_collect_results_filters_center_and_skips_incomplete() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let layout = SubjectLayout::new("/raw", temp_dir.path().join("out"), "/work");
        let dest = temp_dir.path().join("bundle");

        let milan = SubjectKey::new("m1", "MILAN");
        let oslo = SubjectKey::new("o1", "OSLO");
        write_results(&layout, &milan, false);
        write_results(&layout, &oslo, true);

        let mut ledger = CompletionLedger::new();
        ledger.insert(milan.clone(), exported());
        ledger.insert(oslo.clone(), exported());

        let summary = collect_results(&ledger, &layout, &dest, Some("MILAN")).unwrap();
        assert!(summary.collected.is_empty());
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].subject, milan);
        assert!(!bundle_dir(&dest, &oslo).exists());
    }
}
