//! Grouping DICOM files into series and reading a series as one volume.

use anyhow::{anyhow, bail, Context, Result};
use dicom_core::header::Header;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, DefaultDicomObject, OpenFileOptions};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::tags::{tag_key, TagTable};
use crate::naming::series_file_name;
use crate::volume::{Geometry, PixelType, Volume};

/// Files of one series, in slice order.
#[derive(Debug, Clone)]
pub struct DicomSeries {
    pub series_instance_uid: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug)]
struct SliceEntry {
    path: PathBuf,
    /// distance along the slice normal
    position: Option<f64>,
    instance_number: Option<i64>,
}

fn string_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    Some(trimmed.to_string())
}

fn floats_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

fn float_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

fn orientation_of(obj: &DefaultDicomObject) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let v = floats_of(obj, tags::IMAGE_ORIENTATION_PATIENT)?;
    if v.len() != 6 {
        return None;
    }
    let row = Vector3::new(v[0], v[1], v[2]).normalize();
    let col = Vector3::new(v[3], v[4], v[5]).normalize();
    Some((row, col))
}

fn position_of(obj: &DefaultDicomObject) -> Option<Vector3<f64>> {
    let v = floats_of(obj, tags::IMAGE_POSITION_PATIENT)?;
    (v.len() == 3).then(|| Vector3::new(v[0], v[1], v[2]))
}

fn open_header(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Failed to read DICOM header of {}", path.display()))
}

/// Groups the DICOM files directly inside `dir` by Series Instance UID.
///
/// Series come back in ascending UID order; files that are not DICOM or carry
/// no series UID are skipped.
pub fn scan_series(dir: &Path) -> Result<Vec<DicomSeries>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut groups: BTreeMap<String, Vec<SliceEntry>> = BTreeMap::new();
    for path in paths {
        let obj = match open_header(&path) {
            Ok(obj) => obj,
            Err(e) => {
                debug!("skipping {}: {:#}", path.display(), e);
                continue;
            }
        };
        let Some(uid) = string_of(&obj, tags::SERIES_INSTANCE_UID).filter(|u| !u.is_empty()) else {
            debug!("skipping {}: no SeriesInstanceUID", path.display());
            continue;
        };
        let position = match (orientation_of(&obj), position_of(&obj)) {
            (Some((row, col)), Some(pos)) => Some(pos.dot(&row.cross(&col))),
            _ => None,
        };
        let instance_number = obj
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i64>().ok());
        groups.entry(uid).or_default().push(SliceEntry { path, position, instance_number });
    }

    Ok(groups
        .into_iter()
        .map(|(uid, mut slices)| {
            sort_slices(&mut slices);
            DicomSeries {
                series_instance_uid: uid,
                files: slices.into_iter().map(|s| s.path).collect(),
            }
        })
        .collect())
}

/// Orders slices along the normal when every slice has a position,
/// otherwise by instance number; file name breaks ties.
fn sort_slices(slices: &mut [SliceEntry]) {
    let all_positioned = slices.iter().all(|s| s.position.is_some());
    slices.sort_by(|a, b| {
        let by_position = if all_positioned {
            a.position.partial_cmp(&b.position).unwrap_or(Ordering::Equal)
        } else {
            Ordering::Equal
        };
        by_position
            .then_with(|| a.instance_number.cmp(&b.instance_number))
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// Metadata of the representative (first) file of a series.
#[derive(Debug, Clone)]
pub struct SeriesHeader {
    pub file: PathBuf,
    values: HashMap<&'static str, String>,
}

impl SeriesHeader {
    /// Reads the value of every element of `file` listed in the tag table.
    pub fn read(file: &Path, table: &TagTable) -> Result<Self> {
        let obj = open_header(file)?;
        let values = (&obj)
            .into_iter()
            .filter_map(|element| {
                let name = table.name_of(element.tag())?;
                string_of(&obj, element.tag()).map(|v| (name, v))
            })
            .collect();
        Ok(Self { file: file.to_path_buf(), values })
    }

    #[cfg(test)]
    pub fn from_values(file: &Path, values: &[(&'static str, &str)]) -> Self {
        Self {
            file: file.to_path_buf(),
            values: values.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }

    /// Value of the tag called `name`; a missing tag is an error.
    pub fn get(&self, name: &str) -> Result<&str> {
        if let Some(value) = self.values.get(name) {
            return Ok(value);
        }
        let key = TagTable::standard()?
            .tag_of(name)
            .map(tag_key)
            .unwrap_or_else(|| "unknown tag".to_string());
        Err(anyhow!("{} ({}) missing in {}", name, key, self.file.display()))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Descriptive output name of the series numbered `index`.
    pub fn output_stem(&self, index: usize) -> Result<String> {
        Ok(series_file_name(
            self.get("PatientID")?,
            index,
            self.get("SequenceName")?,
            self.get("RepetitionTime")?,
            self.get("EchoTime")?,
        ))
    }
}

/// One decoded file: its frames stacked, plus what the geometry needs.
struct DecodedFile {
    rows: usize,
    columns: usize,
    frames: usize,
    samples: Vec<f32>,
    bits_allocated: u16,
    signed: bool,
    slope: f64,
    intercept: f64,
    position: Option<Vector3<f64>>,
}

fn decode_file(path: &Path) -> Result<DecodedFile> {
    let obj = open_file(path).with_context(|| format!("Failed to open DICOM file {}", path.display()))?;
    let decoded = obj
        .decode_pixel_data()
        .with_context(|| format!("Failed to decode pixel data of {}", path.display()))?;

    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
    let samples: Vec<f32> = decoded
        .to_vec_with_options(&options)
        .with_context(|| format!("Failed to convert pixel data of {}", path.display()))?;

    if decoded.samples_per_pixel() != 1 {
        bail!("{}: only single-channel images are supported", path.display());
    }

    Ok(DecodedFile {
        rows: decoded.rows() as usize,
        columns: decoded.columns() as usize,
        frames: decoded.number_of_frames() as usize,
        samples,
        bits_allocated: decoded.bits_allocated(),
        signed: float_of(&obj, tags::PIXEL_REPRESENTATION).map(|v| v == 1.0).unwrap_or(false),
        slope: float_of(&obj, tags::RESCALE_SLOPE).unwrap_or(1.0),
        intercept: float_of(&obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        position: position_of(&obj),
    })
}

/// Smallest pixel type that holds the stored values after rescaling.
fn pixel_type_for(first: &DecodedFile, min: f32, max: f32) -> PixelType {
    let identity = first.slope == 1.0 && first.intercept == 0.0;
    if identity {
        return match (first.bits_allocated, first.signed) {
            (8, false) => PixelType::UInt8,
            (8, true) => PixelType::Int8,
            (16, false) => PixelType::UInt16,
            (16, true) => PixelType::Int16,
            (32, false) => PixelType::UInt32,
            (32, true) => PixelType::Int32,
            _ => PixelType::Float32,
        };
    }
    let integral = first.slope.fract() == 0.0 && first.intercept.fract() == 0.0;
    if !integral {
        PixelType::Float32
    } else if min >= 0.0 && max <= u16::MAX as f32 {
        PixelType::UInt16
    } else if min >= i16::MIN as f32 && max <= i16::MAX as f32 {
        PixelType::Int16
    } else {
        PixelType::Int32
    }
}

/// Reads all files of `series` into one volume (x = columns, y = rows, z = slices).
pub fn load_series(series: &DicomSeries) -> Result<Volume> {
    let Some(first_path) = series.files.first() else {
        bail!("series {} has no files", series.series_instance_uid);
    };
    let first_obj = open_header(first_path)?;

    let files = series
        .files
        .iter()
        .map(|p| decode_file(p))
        .collect::<Result<Vec<_>>>()?;
    let first = &files[0];
    let (rows, columns) = (first.rows, first.columns);

    let mut samples = Vec::with_capacity(files.iter().map(|f| f.samples.len()).sum());
    let mut depth = 0;
    for (file, path) in files.iter().zip(&series.files) {
        if file.rows != rows || file.columns != columns {
            bail!(
                "{}: slice size {}x{} differs from {}x{}",
                path.display(),
                file.columns,
                file.rows,
                columns,
                rows
            );
        }
        let expected = rows * columns * file.frames;
        if file.samples.len() != expected {
            bail!("{}: expected {} samples, decoded {}", path.display(), expected, file.samples.len());
        }
        let (slope, intercept) = (file.slope as f32, file.intercept as f32);
        samples.extend(file.samples.iter().map(|v| v * slope + intercept));
        depth += file.frames;
    }

    let (min, max) = samples
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let pixel_type = pixel_type_for(first, min, max);

    let geometry = series_geometry(&first_obj, &files);
    let data = Array3::from_shape_vec((depth, rows, columns), samples)?;
    debug!(
        "series {}: {}x{}x{} {:?}",
        series.series_instance_uid, columns, rows, depth, pixel_type
    );
    Volume::new(data, geometry, pixel_type)
}

fn series_geometry(first_obj: &DefaultDicomObject, files: &[DecodedFile]) -> Geometry {
    let (row_dir, col_dir) = orientation_of(first_obj)
        .unwrap_or_else(|| (Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)));
    let normal = row_dir.cross(&col_dir);

    // PixelSpacing is (between rows, between columns)
    let (dy, dx) = match floats_of(first_obj, tags::PIXEL_SPACING) {
        Some(v) if v.len() >= 2 && v[0] > 0.0 && v[1] > 0.0 => (v[0], v[1]),
        _ => (1.0, 1.0),
    };

    let positions: Vec<Vector3<f64>> = files.iter().filter_map(|f| f.position).collect();
    let slice_gap = if positions.len() == files.len() && positions.len() > 1 {
        let total: f64 = positions.windows(2).map(|w| (w[1] - w[0]).dot(&normal).abs()).sum();
        let mean = total / (positions.len() - 1) as f64;
        (mean > 0.0).then_some(mean)
    } else {
        None
    };
    let dz = slice_gap
        .or_else(|| float_of(first_obj, tags::SPACING_BETWEEN_SLICES).filter(|v| *v > 0.0))
        .or_else(|| float_of(first_obj, tags::SLICE_THICKNESS).filter(|v| *v > 0.0))
        .unwrap_or(1.0);
    if slice_gap.is_none() && files.len() > 1 {
        warn!("slice positions unavailable, using a slice spacing of {}", dz);
    }

    Geometry {
        spacing: Vector3::new(dx, dy, dz),
        origin: files.first().and_then(|f| f.position).unwrap_or_else(Vector3::zeros),
        direction: Matrix3::from_columns(&[row_dir, col_dir, normal]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, position: Option<f64>, instance: Option<i64>) -> SliceEntry {
        SliceEntry { path: PathBuf::from(name), position, instance_number: instance }
    }

    fn names(slices: &[SliceEntry]) -> Vec<String> {
        slices.iter().map(|s| s.path.display().to_string()).collect()
    }

    #[test]
    fn test_slices_sorted_along_normal() {
        let mut slices = vec![
            entry("c", Some(10.0), Some(1)),
            entry("a", Some(-5.0), Some(3)),
            entry("b", Some(2.5), Some(2)),
        ];
        sort_slices(&mut slices);
        assert_eq!(names(&slices), ["a", "b", "c"]);
    }

    #[test]
    fn test_slices_fall_back_to_instance_number() {
        let mut slices = vec![
            entry("x", Some(10.0), Some(2)),
            entry("y", None, Some(1)),
            entry("z", None, Some(2)),
        ];
        sort_slices(&mut slices);
        assert_eq!(names(&slices), ["y", "x", "z"]);
    }

    #[test]
    fn test_output_stem_and_missing_tag() {
        let header = SeriesHeader::from_values(
            Path::new("IM0001"),
            &[("PatientID", "P1"), ("SequenceName", "SE"), ("RepetitionTime", "2100"), ("EchoTime", "10")],
        );
        assert_eq!(header.output_stem(0).unwrap(), "P1_0_SE_TR2100_TE10");

        let partial = SeriesHeader::from_values(Path::new("IM0002"), &[("PatientID", "P1")]);
        let err = partial.output_stem(1).unwrap_err().to_string();
        assert!(err.contains("SequenceName (0018|0024) missing"), "{}", err);
    }

    #[test]
    fn test_scan_skips_non_dicom_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not a dicom file").unwrap();
        assert!(scan_series(dir.path()).unwrap().is_empty());
    }
}
