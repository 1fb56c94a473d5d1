//! Subject manifest and subset file loading.

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;

use super::SubjectKey;

/// Errors that can occur while reading subject lists.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Manifest '{path}' is missing a '{column}' column")]
    MissingColumn { path: String, column: String },

    #[error("Line {line} of '{path}' does not contain a subject id and a center")]
    MalformedLine { path: String, line: usize },
}

const SUBJECT_COLUMNS: &[&str] = &["subject_id", "SubjID", "id"];
const CENTER_COLUMNS: &[&str] = &["center", "CENTER"];

/// Loads the subject manifest (a CSV with a header row).
///
/// Accepts `subject_id`/`center` headers as well as the legacy
/// `SubjID`/`CENTER` pair; extra columns are ignored. Duplicate rows are
/// collapsed, and the result is ordered by key.
pub fn load_manifest(path: &Path) -> Result<Vec<SubjectKey>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let find = |candidates: &[&str], column: &str| {
        headers
            .iter()
            .position(|h| candidates.contains(&h))
            .ok_or_else(|| ManifestError::MissingColumn {
                path: path.display().to_string(),
                column: column.to_string(),
            })
    };
    let subject_idx = find(SUBJECT_COLUMNS, "subject_id")?;
    let center_idx = find(CENTER_COLUMNS, "center")?;

    let mut keys = BTreeSet::new();
    for record in reader.records() {
        let record = record?;
        let subject_id = record.get(subject_idx).unwrap_or_default();
        let center = record.get(center_idx).unwrap_or_default();
        if subject_id.is_empty() || center.is_empty() {
            continue;
        }
        keys.insert(SubjectKey::new(subject_id, center));
    }

    Ok(keys.into_iter().collect())
}

/// Loads a subset file: headerless `subject_id,center` lines.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn load_subset(path: &Path) -> Result<Vec<SubjectKey>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut keys = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        match (record.get(0), record.get(1)) {
            (Some(id), Some(center)) if !id.is_empty() && !center.is_empty() => {
                keys.push(SubjectKey::new(id, center));
            }
            _ => {
                return Err(ManifestError::MalformedLine {
                    path: path.display().to_string(),
                    line: record
                        .position()
                        .map(|pos| pos.line() as usize)
                        .unwrap_or(idx + 1),
                })
            }
        }
    }

    Ok(keys)
}

/// Restricts a manifest to the keys listed in a subset, preserving
/// manifest order. Subset entries absent from the manifest are dropped.
pub fn select_subset(manifest: &[SubjectKey], subset: &[SubjectKey]) -> Vec<SubjectKey> {
    let wanted: BTreeSet<&SubjectKey> = subset.iter().collect();
    manifest
        .iter()
        .filter(|key| wanted.contains(key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_manifest_legacy_headers() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("data_total.csv");
        fs::write(
            &path,
            "SubjID,CENTER,AGE\nsub-02,MAINZ,40\nsub-01,MAINZ,33\nsub-01,MAINZ,33\nFIS_001,CLINIC,51\n",
        )
        .expect("write manifest");

        let keys = load_manifest(&path).expect("load manifest");
        assert_eq!(
            keys,
            vec![
                SubjectKey::new("FIS_001", "CLINIC"),
                SubjectKey::new("sub-01", "MAINZ"),
                SubjectKey::new("sub-02", "MAINZ"),
            ]
        );
    }

    #[test]
    fn test_load_manifest_missing_center_column() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("manifest.csv");
        fs::write(&path, "subject_id,site\nsub-01,MAINZ\n").expect("write manifest");

        let err = load_manifest(&path).unwrap_err();
        assert!(matches!(err, ManifestError::MissingColumn { ref column, .. } if column == "center"));
    }

    #[test]
    fn test_load_subset_and_select() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("subset.txt");
        fs::write(&path, "# rerun\nsub-02, MAINZ\n\nsub-09,NAPLES\n").expect("write subset");

        let subset = load_subset(&path).expect("load subset");
        assert_eq!(subset.len(), 2);

        let manifest = vec![
            SubjectKey::new("sub-01", "MAINZ"),
            SubjectKey::new("sub-02", "MAINZ"),
        ];
        let selected = select_subset(&manifest, &subset);
        assert_eq!(selected, vec![SubjectKey::new("sub-02", "MAINZ")]);
    }

    #[test]
    fn test_load_subset_malformed_line() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("subset.txt");
        fs::write(&path, "sub-01,MAINZ\nsub-02\n").expect("write subset");

        let err = load_subset(&path).unwrap_err();
        assert!(matches!(err, ManifestError::MalformedLine { line: 2, .. }));
    }
}
