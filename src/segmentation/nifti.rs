//! Minimal NIfTI-1 single-file (`.nii` / `.nii.gz`) reader and writer.
//!
//! Only what label volumes need: scalar datatypes, 3-D (or 3-D with
//! singleton higher dims) images, and the sform affine. The original
//! header and extensions are kept byte for byte when writing, except for
//! the intensity scaling which is reset to identity.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

const HEADER_SIZE: usize = 348;
const OFFSET_DIM: usize = 40;
const OFFSET_DATATYPE: usize = 70;
const OFFSET_PIXDIM: usize = 76;
const OFFSET_VOX_OFFSET: usize = 108;
const OFFSET_SCL_SLOPE: usize = 112;
const OFFSET_SCL_INTER: usize = 116;
const OFFSET_SFORM_CODE: usize = 254;
const OFFSET_SROW_X: usize = 280;
const OFFSET_MAGIC: usize = 344;

/// Errors that can occur while reading or writing NIfTI files.
#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not carry a NIfTI-1 header.
    #[error("Not a NIfTI-1 file: {0}")]
    NotNifti(String),

    /// Header and image are stored in separate files.
    #[error("Two-file NIfTI (.hdr/.img) is not supported")]
    PairedFile,

    #[error("Unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The file ends before the declared voxel data does.
    #[error("Truncated image data: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

/// Copies `N` bytes into little-endian order.
fn le_bytes<const N: usize>(bytes: &[u8], endian: Endian) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes[..N]);
    if endian == Endian::Big {
        arr.reverse();
    }
    arr
}

fn put_bytes<const N: usize>(mut le: [u8; N], endian: Endian, out: &mut Vec<u8>) {
    if endian == Endian::Big {
        le.reverse();
    }
    out.extend_from_slice(&le);
}

fn read_i16(header: &[u8], offset: usize, endian: Endian) -> i16 {
    i16::from_le_bytes(le_bytes(&header[offset..], endian))
}

fn read_i32(header: &[u8], offset: usize, endian: Endian) -> i32 {
    i32::from_le_bytes(le_bytes(&header[offset..], endian))
}

fn read_f32(header: &[u8], offset: usize, endian: Endian) -> f32 {
    f32::from_le_bytes(le_bytes(&header[offset..], endian))
}

fn write_f32(header: &mut [u8], offset: usize, value: f32, endian: Endian) {
    let mut bytes = value.to_le_bytes();
    if endian == Endian::Big {
        bytes.reverse();
    }
    header[offset..offset + 4].copy_from_slice(&bytes);
}

/// Voxel storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    U8,
    I16,
    I32,
    F32,
    F64,
    I8,
    U16,
    U32,
    I64,
}

impl Datatype {
    pub fn from_code(code: i16) -> Result<Self, NiftiError> {
        match code {
            2 => Ok(Datatype::U8),
            4 => Ok(Datatype::I16),
            8 => Ok(Datatype::I32),
            16 => Ok(Datatype::F32),
            64 => Ok(Datatype::F64),
            256 => Ok(Datatype::I8),
            512 => Ok(Datatype::U16),
            768 => Ok(Datatype::U32),
            1024 => Ok(Datatype::I64),
            other => Err(NiftiError::UnsupportedDatatype(other)),
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            Datatype::U8 => 2,
            Datatype::I16 => 4,
            Datatype::I32 => 8,
            Datatype::F32 => 16,
            Datatype::F64 => 64,
            Datatype::I8 => 256,
            Datatype::U16 => 512,
            Datatype::U32 => 768,
            Datatype::I64 => 1024,
        }
    }

    /// Bytes per voxel.
    pub fn size(&self) -> usize {
        match self {
            Datatype::U8 | Datatype::I8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::F64 | Datatype::I64 => 8,
        }
    }

    fn decode(&self, b: &[u8], endian: Endian) -> f64 {
        match self {
            Datatype::U8 => b[0] as f64,
            Datatype::I8 => b[0] as i8 as f64,
            Datatype::I16 => i16::from_le_bytes(le_bytes(b, endian)) as f64,
            Datatype::U16 => u16::from_le_bytes(le_bytes(b, endian)) as f64,
            Datatype::I32 => i32::from_le_bytes(le_bytes(b, endian)) as f64,
            Datatype::U32 => u32::from_le_bytes(le_bytes(b, endian)) as f64,
            Datatype::F32 => f32::from_le_bytes(le_bytes(b, endian)) as f64,
            Datatype::F64 => f64::from_le_bytes(le_bytes(b, endian)),
            Datatype::I64 => i64::from_le_bytes(le_bytes(b, endian)) as f64,
        }
    }

    /// Integer types round to nearest and saturate.
    fn encode(&self, value: f64, endian: Endian, out: &mut Vec<u8>) {
        let rounded = value.round();
        match self {
            Datatype::U8 => out.push(rounded as u8),
            Datatype::I8 => out.push((rounded as i8) as u8),
            Datatype::I16 => put_bytes((rounded as i16).to_le_bytes(), endian, out),
            Datatype::U16 => put_bytes((rounded as u16).to_le_bytes(), endian, out),
            Datatype::I32 => put_bytes((rounded as i32).to_le_bytes(), endian, out),
            Datatype::U32 => put_bytes((rounded as u32).to_le_bytes(), endian, out),
            Datatype::F32 => put_bytes((value as f32).to_le_bytes(), endian, out),
            Datatype::F64 => put_bytes(value.to_le_bytes(), endian, out),
            Datatype::I64 => put_bytes((rounded as i64).to_le_bytes(), endian, out),
        }
    }
}

/// A 3-D NIfTI volume with scaling applied to its voxel values.
#[derive(Debug, Clone)]
pub struct NiftiVolume {
    /// Header and extensions, everything before the voxel data.
    header: Vec<u8>,
    endian: Endian,
    pub datatype: Datatype,
    pub dims: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    /// Voxel to world (mm) transform, row-major.
    pub affine: [[f64; 4]; 4],
    /// Voxel values in x-fastest order.
    pub data: Vec<f64>,
}

impl NiftiVolume {
    /// Parses a NIfTI-1 file image held in memory.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, NiftiError> {
        if raw.len() < HEADER_SIZE {
            return Err(NiftiError::NotNifti(format!("only {} bytes", raw.len())));
        }

        let endian = if i32::from_le_bytes(le_bytes(raw, Endian::Little)) == HEADER_SIZE as i32 {
            Endian::Little
        } else if i32::from_le_bytes(le_bytes(raw, Endian::Big)) == HEADER_SIZE as i32 {
            Endian::Big
        } else {
            return Err(NiftiError::NotNifti("bad sizeof_hdr".to_string()));
        };

        match &raw[OFFSET_MAGIC..OFFSET_MAGIC + 4] {
            b"n+1\0" => {}
            b"ni1\0" => return Err(NiftiError::PairedFile),
            _ => return Err(NiftiError::NotNifti("bad magic".to_string())),
        }

        let mut dim = [0i64; 8];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = read_i16(raw, OFFSET_DIM + 2 * i, endian) as i64;
        }
        let ndim = dim[0];
        if !(1..=7).contains(&ndim) {
            return Err(NiftiError::InvalidDimensions(format!("dim[0] = {}", ndim)));
        }
        let extent = |axis: usize| -> Result<usize, NiftiError> {
            if axis as i64 > ndim {
                return Ok(1);
            }
            usize::try_from(dim[axis])
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| NiftiError::InvalidDimensions(format!("dim[{}] = {}", axis, dim[axis])))
        };
        let dims = (extent(1)?, extent(2)?, extent(3)?);
        for axis in 4..=7 {
            if extent(axis)? != 1 {
                return Err(NiftiError::InvalidDimensions(format!(
                    "only 3-D volumes are supported, dim[{}] = {}",
                    axis, dim[axis]
                )));
            }
        }

        let datatype = Datatype::from_code(read_i16(raw, OFFSET_DATATYPE, endian))?;

        let voxel_size = (
            read_f32(raw, OFFSET_PIXDIM + 4, endian).abs() as f64,
            read_f32(raw, OFFSET_PIXDIM + 8, endian).abs() as f64,
            read_f32(raw, OFFSET_PIXDIM + 12, endian).abs() as f64,
        );

        let vox_offset = read_f32(raw, OFFSET_VOX_OFFSET, endian);
        if !vox_offset.is_finite() || (vox_offset as usize) < HEADER_SIZE {
            return Err(NiftiError::NotNifti(format!("vox_offset {}", vox_offset)));
        }
        let vox_offset = vox_offset as usize;

        let (mut slope, inter) = (
            read_f32(raw, OFFSET_SCL_SLOPE, endian) as f64,
            read_f32(raw, OFFSET_SCL_INTER, endian) as f64,
        );
        let inter = if inter.is_finite() { inter } else { 0.0 };
        if slope == 0.0 || !slope.is_finite() {
            slope = 1.0;
        }

        let affine = if read_i16(raw, OFFSET_SFORM_CODE, endian) > 0 {
            let mut affine = [[0.0, 0.0, 0.0, 0.0], [0.0; 4], [0.0; 4], [0.0, 0.0, 0.0, 1.0]];
            for (row, values) in affine.iter_mut().take(3).enumerate() {
                for (col, value) in values.iter_mut().enumerate() {
                    *value = read_f32(raw, OFFSET_SROW_X + 16 * row + 4 * col, endian) as f64;
                }
            }
            affine
        } else {
            // No sform: plain voxel scaling.
            [
                [voxel_size.0, 0.0, 0.0, 0.0],
                [0.0, voxel_size.1, 0.0, 0.0],
                [0.0, 0.0, voxel_size.2, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ]
        };

        let nvox = dims.0 * dims.1 * dims.2;
        let expected = vox_offset + nvox * datatype.size();
        if raw.len() < expected {
            return Err(NiftiError::Truncated {
                expected,
                actual: raw.len(),
            });
        }

        let data = raw[vox_offset..expected]
            .chunks_exact(datatype.size())
            .map(|chunk| datatype.decode(chunk, endian) * slope + inter)
            .collect();

        Ok(Self {
            header: raw[..vox_offset].to_vec(),
            endian,
            datatype,
            dims,
            voxel_size,
            affine,
            data,
        })
    }

    /// Reads a `.nii` or gzip-compressed `.nii.gz` file.
    pub fn read(path: &Path) -> Result<Self, NiftiError> {
        let mut raw = Vec::new();
        let mut reader = BufReader::new(File::open(path)?);
        reader.read_to_end(&mut raw)?;

        if raw.starts_with(&[0x1f, 0x8b]) {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?;
            raw = decoded;
        }
        Self::from_bytes(&raw)
    }

    /// Same geometry and header, new voxel values.
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self, NiftiError> {
        if data.len() != self.data.len() {
            return Err(NiftiError::InvalidDimensions(format!(
                "expected {} voxels, got {}",
                self.data.len(),
                data.len()
            )));
        }
        Ok(Self {
            data,
            ..self.clone()
        })
    }

    /// Serialises to a NIfTI-1 byte image with identity scaling.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.data.len() * self.datatype.size());
        out.extend_from_slice(&self.header);
        write_f32(&mut out, OFFSET_SCL_SLOPE, 1.0, self.endian);
        write_f32(&mut out, OFFSET_SCL_INTER, 0.0, self.endian);
        for value in &self.data {
            self.datatype.encode(*value, self.endian, &mut out);
        }
        out
    }

    /// Writes the volume, gzip-compressed when the path ends in `.gz`.
    pub fn write(&self, path: &Path) -> Result<(), NiftiError> {
        let bytes = self.to_bytes();
        let file = BufWriter::new(File::create(path)?);
        if path.extension().is_some_and(|ext| ext == "gz") {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()?;
        } else {
            let mut file = file;
            file.write_all(&bytes)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// World coordinates of a (possibly fractional) voxel position.
    pub fn voxel_to_world(&self, i: f64, j: f64, k: f64) -> [f64; 3] {
        let mut world = [0.0; 3];
        for (row, value) in world.iter_mut().enumerate() {
            let a = self.affine[row];
            *value = a[0] * i + a[1] * j + a[2] * k + a[3];
        }
        world
    }
}

/// Builds an in-memory NIfTI-1 image. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn synthetic_nifti(dims: (usize, usize, usize), datatype: Datatype, values: &[f64]) -> Vec<u8> {
    let mut header = vec![0u8; 352];
    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    let dim: [i16; 8] = [3, dims.0 as i16, dims.1 as i16, dims.2 as i16, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        header[OFFSET_DIM + 2 * i..OFFSET_DIM + 2 * i + 2].copy_from_slice(&d.to_le_bytes());
    }
    header[OFFSET_DATATYPE..OFFSET_DATATYPE + 2].copy_from_slice(&datatype.code().to_le_bytes());
    header[72..74].copy_from_slice(&((datatype.size() * 8) as i16).to_le_bytes());
    for (i, p) in [1.0f32, 2.0, 2.0, 2.0].iter().enumerate() {
        header[OFFSET_PIXDIM + 4 * i..OFFSET_PIXDIM + 4 * i + 4].copy_from_slice(&p.to_le_bytes());
    }
    header[OFFSET_VOX_OFFSET..OFFSET_VOX_OFFSET + 4].copy_from_slice(&352f32.to_le_bytes());
    header[OFFSET_SCL_SLOPE..OFFSET_SCL_SLOPE + 4].copy_from_slice(&1f32.to_le_bytes());
    header[OFFSET_SFORM_CODE..OFFSET_SFORM_CODE + 2].copy_from_slice(&1i16.to_le_bytes());
    let srows: [[f32; 4]; 3] = [[2.0, 0.0, 0.0, -10.0], [0.0, 2.0, 0.0, -20.0], [0.0, 0.0, 2.0, -30.0]];
    for (r, row) in srows.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            let off = OFFSET_SROW_X + 16 * r + 4 * c;
            header[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
    header[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(b"n+1\0");

    for value in values {
        datatype.encode(*value, Endian::Little, &mut header);
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_synthetic_volume() {
        let raw = synthetic_nifti((2, 2, 1), Datatype::I16, &[0.0, 10.0, 1002.0, 2035.0]);
        let volume = NiftiVolume::from_bytes(&raw).expect("valid nifti");

        assert_eq!(volume.dims, (2, 2, 1));
        assert_eq!(volume.datatype, Datatype::I16);
        assert_eq!(volume.data, vec![0.0, 10.0, 1002.0, 2035.0]);
        assert_eq!(volume.voxel_to_world(1.0, 1.0, 0.0), [-8.0, -18.0, -30.0]);
    }

    #[test]
    fn test_scaling_is_applied_and_reset_on_write() {
        let mut raw = synthetic_nifti((2, 1, 1), Datatype::U8, &[1.0, 2.0]);
        raw[OFFSET_SCL_SLOPE..OFFSET_SCL_SLOPE + 4].copy_from_slice(&2f32.to_le_bytes());
        raw[OFFSET_SCL_INTER..OFFSET_SCL_INTER + 4].copy_from_slice(&1f32.to_le_bytes());

        let volume = NiftiVolume::from_bytes(&raw).unwrap();
        assert_eq!(volume.data, vec![3.0, 5.0]);

        let reparsed = NiftiVolume::from_bytes(&volume.to_bytes()).unwrap();
        assert_eq!(reparsed.data, vec![3.0, 5.0]);
    }

    #[test]
    fn test_big_endian_header() {
        let mut raw = synthetic_nifti((1, 1, 1), Datatype::U8, &[7.0]);
        raw[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_be_bytes());
        for i in 0..8 {
            let off = OFFSET_DIM + 2 * i;
            raw.swap(off, off + 1);
        }
        raw.swap(OFFSET_DATATYPE, OFFSET_DATATYPE + 1);
        raw.swap(OFFSET_SFORM_CODE, OFFSET_SFORM_CODE + 1);
        for off in (OFFSET_PIXDIM..OFFSET_PIXDIM + 32)
            .step_by(4)
            .chain([OFFSET_VOX_OFFSET, OFFSET_SCL_SLOPE, OFFSET_SCL_INTER])
            .chain((OFFSET_SROW_X..OFFSET_SROW_X + 48).step_by(4))
        {
            raw[off..off + 4].reverse();
        }

        let volume = NiftiVolume::from_bytes(&raw).expect("big endian parses");
        assert_eq!(volume.data, vec![7.0]);
        assert_eq!(volume.voxel_to_world(0.0, 0.0, 0.0), [-10.0, -20.0, -30.0]);
    }

    #[test]
    fn test_rejects_non_nifti_and_truncated() {
        assert!(matches!(
            NiftiVolume::from_bytes(&[0u8; 400]),
            Err(NiftiError::NotNifti(_))
        ));

        let mut raw = synthetic_nifti((4, 4, 4), Datatype::F32, &[0.0; 64]);
        raw.truncate(raw.len() - 10);
        assert!(matches!(
            NiftiVolume::from_bytes(&raw),
            Err(NiftiError::Truncated { .. })
        ));
    }

    #[test]
    fn test_gzip_write_and_read() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let raw = synthetic_nifti((3, 1, 1), Datatype::I32, &[1.0, -2.0, 3.0]);
        let volume = NiftiVolume::from_bytes(&raw).unwrap();

        let path = temp_dir.path().join("seg.nii.gz");
        volume.write(&path).expect("write gz");
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let read = NiftiVolume::read(&path).expect("read gz");
        assert_eq!(read.data, vec![1.0, -2.0, 3.0]);
        assert_eq!(read.datatype, Datatype::I32);
    }
}
