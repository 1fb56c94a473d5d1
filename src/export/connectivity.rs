//! Connectivity export for the brain simulator.
//!
//! Reads the structural connectome written by tractography
//! (`dt_proc/connectome_{weights,lengths}.csv`) and writes the simulator
//! input files into `results/`:
//!
//! - `{subject}_SC_weights.txt`: weights min-max normalised to `[0, 0.2]`
//! - `{subject}_SC_weights_nonorm.txt`: raw weights
//! - `{subject}_SC_distances.txt`: tract lengths
//! - `weights.txt`, `tract_lengths.txt`: the same under simulator names
//! - `centres.txt`: `<region> <x> <y> <z>` per region, in world mm

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, warn};

use crate::segmentation::{region_name, NiftiVolume, REGION_COUNT};

use super::ExportError;

/// Upper bound of normalised weights.
pub const WEIGHT_SCALE: f64 = 0.2;

/// Segmentation holding the sequential region indices, relative to the
/// subject output directory.
pub const RELABELED_SEGMENTATION: &str = "recon_all/mri/aparc.DKTatlas+aseg_newSeg.nii.gz";

/// What an export wrote.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub regions: usize,
    pub results_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Reads a headerless comma-separated square matrix.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>, ExportError> {
    let malformed = |message: String| ExportError::MalformedMatrix {
        path: path.display().to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut cols = None;
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        match cols {
            None => cols = Some(record.len()),
            Some(n) if n != record.len() => {
                return Err(malformed(format!(
                    "row {} has {} columns, expected {}",
                    rows + 1,
                    record.len(),
                    n
                )))
            }
            Some(_) => {}
        }
        for field in record.iter() {
            let value: f64 = field
                .parse()
                .map_err(|_| malformed(format!("invalid number '{}' in row {}", field, rows + 1)))?;
            values.push(value);
        }
        rows += 1;
    }

    let cols = cols.ok_or_else(|| malformed("empty matrix".to_string()))?;
    if rows != cols {
        return Err(malformed(format!("matrix is {}x{}, expected square", rows, cols)));
    }
    Array2::from_shape_vec((rows, cols), values).map_err(|e| malformed(e.to_string()))
}

/// Min-max normalises weights into `[0, WEIGHT_SCALE]`.
///
/// A constant matrix normalises to all zeros.
pub fn normalise_weights(weights: &Array2<f64>) -> Array2<f64> {
    let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range.is_nan() || range <= 0.0 {
        return Array2::zeros(weights.raw_dim());
    }
    weights.mapv(|w| (w - min) / range * WEIGHT_SCALE)
}

/// Formats a value like `numpy.savetxt`'s default `%.18e`.
fn format_scientific(value: f64) -> String {
    let formatted = format!("{:.18e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted.to_lowercase(),
    }
}

/// Writes a matrix as space-separated rows.
pub fn write_matrix(path: &Path, matrix: &Array2<f64>) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in matrix.rows() {
        let line: Vec<String> = row.iter().map(|v| format_scientific(*v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    out.flush()?;
    Ok(())
}

/// World-space centre of mass of every region 1..=`REGION_COUNT`.
///
/// Regions without voxels yield `None`.
pub fn region_centres(segmentation: &NiftiVolume) -> Vec<Option<[f64; 3]>> {
    let mut sums = vec![[0.0f64; 3]; REGION_COUNT];
    let mut counts = vec![0usize; REGION_COUNT];
    let (nx, ny, _) = segmentation.dims;

    for (idx, value) in segmentation.data.iter().enumerate() {
        let label = value.round() as i64;
        if label < 1 || label as usize > REGION_COUNT {
            continue;
        }
        let slot = label as usize - 1;
        let (i, j, k) = (idx % nx, (idx / nx) % ny, idx / (nx * ny));
        sums[slot][0] += i as f64;
        sums[slot][1] += j as f64;
        sums[slot][2] += k as f64;
        counts[slot] += 1;
    }

    sums.iter()
        .zip(&counts)
        .map(|(sum, &count)| {
            (count > 0).then(|| {
                let n = count as f64;
                segmentation.voxel_to_world(sum[0] / n, sum[1] / n, sum[2] / n)
            })
        })
        .collect()
}

/// Writes `centres.txt`. Regions without voxels are written at the origin.
pub fn write_centres(path: &Path, centres: &[Option<[f64; 3]>]) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    for (pos, centre) in centres.iter().enumerate() {
        let index = pos as u16 + 1;
        let name = region_name(index).unwrap_or("Unknown");
        let [x, y, z] = centre.unwrap_or_else(|| {
            warn!(region = name, "Region has no voxels, writing origin as centre");
            [0.0; 3]
        });
        writeln!(out, "{} {} {} {}", name, x, y, z)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the simulator input files for one subject.
pub fn export_connectivity(output_dir: &Path, subject_id: &str) -> Result<ExportSummary, ExportError> {
    let weights = read_matrix(&output_dir.join("dt_proc/connectome_weights.csv"))?;
    let lengths = read_matrix(&output_dir.join("dt_proc/connectome_lengths.csv"))?;
    if weights.dim() != lengths.dim() {
        return Err(ExportError::ShapeMismatch {
            weights: weights.dim(),
            lengths: lengths.dim(),
        });
    }
    let regions = weights.nrows();
    if regions != REGION_COUNT {
        warn!(regions, expected = REGION_COUNT, "Connectome size differs from the region table");
    }

    let segmentation_path = output_dir.join(RELABELED_SEGMENTATION);
    let segmentation = NiftiVolume::read(&segmentation_path).map_err(|source| ExportError::Segmentation {
        path: segmentation_path.display().to_string(),
        source,
    })?;

    let results_dir = output_dir.join("results");
    std::fs::create_dir_all(&results_dir)?;

    let normalised = normalise_weights(&weights);
    let outputs: [(String, &Array2<f64>); 5] = [
        (format!("{}_SC_weights.txt", subject_id), &normalised),
        (format!("{}_SC_weights_nonorm.txt", subject_id), &weights),
        (format!("{}_SC_distances.txt", subject_id), &lengths),
        ("weights.txt".to_string(), &normalised),
        ("tract_lengths.txt".to_string(), &lengths),
    ];

    let mut files = Vec::with_capacity(outputs.len() + 1);
    for (name, matrix) in outputs {
        let path = results_dir.join(name);
        write_matrix(&path, matrix)?;
        files.push(path);
    }

    let centres_path = results_dir.join("centres.txt");
    write_centres(&centres_path, &region_centres(&segmentation))?;
    files.push(centres_path);

    debug!(subject = subject_id, regions, dir = %results_dir.display(), "Connectivity files written");
    Ok(ExportSummary {
        regions,
        results_dir,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::nifti::synthetic_nifti;
    use crate::segmentation::Datatype;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_normalise_weights() {
        let weights = array![[0.0, 5.0], [10.0, 2.5]];
        let normalised = normalise_weights(&weights);
        assert_eq!(normalised, array![[0.0, 0.1], [0.2, 0.05]]);
    }

    #[test]
    fn test_normalise_constant_matrix_is_zero() {
        let weights = array![[3.0, 3.0], [3.0, 3.0]];
        assert_eq!(normalise_weights(&weights), Array2::<f64>::zeros((2, 2)));
    }

    #[test]
    fn test_format_scientific_matches_savetxt() {
        assert_eq!(format_scientific(1.0), "1.000000000000000000e+00");
        assert_eq!(format_scientific(0.05), "5.000000000000000278e-02");
        assert_eq!(format_scientific(0.0), "0.000000000000000000e+00");
        assert_eq!(format_scientific(-1234.5), "-1.234500000000000000e+03");
    }

    #[test]
    fn test_read_matrix_rejects_non_square() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("m.csv");
        std::fs::write(&path, "1,2,3\n4,5,6\n").unwrap();
        assert!(matches!(read_matrix(&path), Err(ExportError::MalformedMatrix { .. })));

        std::fs::write(&path, "1,2\n3,x\n").unwrap();
        assert!(matches!(read_matrix(&path), Err(ExportError::MalformedMatrix { .. })));
    }

    #[test]
    fn test_region_centres() {
        // Region 1 at voxels (0,0,0) and (2,0,0); region 2 at (1,1,0).
        let raw = synthetic_nifti((3, 2, 1), Datatype::U8, &[1.0, 0.0, 1.0, 0.0, 2.0, 0.0]);
        let volume = NiftiVolume::from_bytes(&raw).unwrap();
        let centres = region_centres(&volume);

        assert_eq!(centres.len(), REGION_COUNT);
        assert_eq!(centres[0], Some([-8.0, -20.0, -30.0]));
        assert_eq!(centres[1], Some([-8.0, -18.0, -30.0]));
        assert_eq!(centres[2], None);
    }

    #[test]
    fn test_export_connectivity_writes_all_files() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let out = temp_dir.path();
        std::fs::create_dir_all(out.join("dt_proc")).unwrap();
        std::fs::create_dir_all(out.join("recon_all/mri")).unwrap();
        std::fs::write(out.join("dt_proc/connectome_weights.csv"), "0,4\n4,0\n").unwrap();
        std::fs::write(out.join("dt_proc/connectome_lengths.csv"), "0,12.5\n12.5,0\n").unwrap();
        let raw = synthetic_nifti((2, 1, 1), Datatype::U8, &[1.0, 2.0]);
        NiftiVolume::from_bytes(&raw)
            .unwrap()
            .write(&out.join(RELABELED_SEGMENTATION))
            .unwrap();

        let summary = export_connectivity(out, "sub-01").expect("export succeeds");
        assert_eq!(summary.regions, 2);
        assert_eq!(summary.files.len(), 6);

        let weights = std::fs::read_to_string(out.join("results/sub-01_SC_weights.txt")).unwrap();
        assert_eq!(
            weights.lines().next(),
            Some("0.000000000000000000e+00 2.000000000000000111e-01")
        );
        let centres = std::fs::read_to_string(out.join("results/centres.txt")).unwrap();
        assert!(centres.starts_with("L_Thalamus -10 -20 -30\nL_Caudate -8 -20 -30\n"));
        assert!(out.join("results/tract_lengths.txt").exists());
    }

    #[test]
    fn test_export_requires_matching_shapes() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let out = temp_dir.path();
        std::fs::create_dir_all(out.join("dt_proc")).unwrap();
        std::fs::write(out.join("dt_proc/connectome_weights.csv"), "1\n").unwrap();
        std::fs::write(out.join("dt_proc/connectome_lengths.csv"), "1,2\n3,4\n").unwrap();

        assert!(matches!(
            export_connectivity(out, "sub-01"),
            Err(ExportError::ShapeMismatch { .. })
        ));
    }
}
