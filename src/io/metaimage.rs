//! MetaImage (`.mha` / `.mhd`) reading and writing.
//!
//! Headers are `Key = Value` lines ending with `ElementDataFile`. For `.mha`
//! the voxel data follows the header in the same file (`LOCAL`); for `.mhd`
//! it lives in a separate raw file next to the header. Writing is always
//! uncompressed little-endian so identical volumes give identical files.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::ZlibDecoder;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::volume::{Geometry, PixelType, Volume};

fn element_type_name(pixel_type: PixelType) -> &'static str {
    match pixel_type {
        PixelType::UInt8 => "MET_UCHAR",
        PixelType::Int8 => "MET_CHAR",
        PixelType::UInt16 => "MET_USHORT",
        PixelType::Int16 => "MET_SHORT",
        PixelType::UInt32 => "MET_UINT",
        PixelType::Int32 => "MET_INT",
        PixelType::Float32 => "MET_FLOAT",
        PixelType::Float64 => "MET_DOUBLE",
    }
}

fn pixel_type_from_name(name: &str) -> Result<PixelType> {
    Ok(match name {
        "MET_UCHAR" => PixelType::UInt8,
        "MET_CHAR" => PixelType::Int8,
        "MET_USHORT" => PixelType::UInt16,
        "MET_SHORT" => PixelType::Int16,
        "MET_UINT" => PixelType::UInt32,
        "MET_INT" => PixelType::Int32,
        "MET_FLOAT" => PixelType::Float32,
        "MET_DOUBLE" => PixelType::Float64,
        other => bail!("unsupported MetaImage element type {}", other),
    })
}

/// Three-letter orientation code (`RAI` for an identity direction).
fn anatomical_orientation(direction: &Matrix3<f64>) -> String {
    (0..3)
        .map(|axis| {
            let column = direction.column(axis);
            let (dominant, value) = column
                .iter()
                .enumerate()
                .fold((0, 0.0f64), |best, (i, v)| if v.abs() > best.1.abs() { (i, *v) } else { best });
            match (dominant, value >= 0.0) {
                (0, true) => 'R',
                (0, false) => 'L',
                (1, true) => 'A',
                (1, false) => 'P',
                (2, true) => 'I',
                _ => 'S',
            }
        })
        .collect()
}

fn join_numbers<I: IntoIterator<Item = f64>>(values: I) -> String {
    values.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Header text for `volume`; `data_file` is `LOCAL` or the raw file name.
fn header_text(volume: &Volume, data_file: &str) -> String {
    let geometry = volume.geometry();
    let [nx, ny, nz] = volume.size();
    // TransformMatrix lists the axis direction vectors one after another
    let transform = join_numbers(geometry.direction.iter().copied());

    let mut header = String::new();
    let _ = writeln!(header, "ObjectType = Image");
    let _ = writeln!(header, "NDims = 3");
    let _ = writeln!(header, "BinaryData = True");
    let _ = writeln!(header, "BinaryDataByteOrderMSB = False");
    let _ = writeln!(header, "CompressedData = False");
    let _ = writeln!(header, "TransformMatrix = {}", transform);
    let _ = writeln!(header, "Offset = {}", join_numbers(geometry.origin.iter().copied()));
    let _ = writeln!(header, "CenterOfRotation = 0 0 0");
    let _ = writeln!(header, "AnatomicalOrientation = {}", anatomical_orientation(&geometry.direction));
    let _ = writeln!(header, "ElementSpacing = {}", join_numbers(geometry.spacing.iter().copied()));
    let _ = writeln!(header, "DimSize = {} {} {}", nx, ny, nz);
    let _ = writeln!(header, "ElementType = {}", element_type_name(volume.pixel_type()));
    let _ = writeln!(header, "ElementDataFile = {}", data_file);
    header
}

fn encode_samples(volume: &Volume) -> Vec<u8> {
    let pixel_type = volume.pixel_type();
    let mut out = Vec::with_capacity(volume.voxel_count() * pixel_type.size_in_bytes());
    // standard layout of the [z, y, x] array already has x fastest
    for &v in volume.data().iter() {
        let v = pixel_type.convert(v);
        match pixel_type {
            PixelType::UInt8 => out.push(v as u8),
            PixelType::Int8 => out.push((v as i8) as u8),
            PixelType::UInt16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
            PixelType::Int16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            PixelType::UInt32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
            PixelType::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            PixelType::Float32 => out.extend_from_slice(&v.to_le_bytes()),
            PixelType::Float64 => out.extend_from_slice(&(v as f64).to_le_bytes()),
        }
    }
    out
}

fn decode_samples(bytes: &[u8], pixel_type: PixelType, big_endian: bool, count: usize) -> Result<Vec<f32>> {
    let width = pixel_type.size_in_bytes();
    let Some(expected) = count.checked_mul(width) else {
        bail!("voxel count {} is too large", count);
    };
    if bytes.len() < expected {
        bail!("voxel data truncated: expected {} bytes, found {}", expected, bytes.len());
    }

    macro_rules! read_as {
        ($ty:ty) => {
            bytes[..expected]
                .chunks_exact(width)
                .map(|chunk| {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(chunk);
                    let value = if big_endian { <$ty>::from_be_bytes(raw) } else { <$ty>::from_le_bytes(raw) };
                    value as f32
                })
                .collect()
        };
    }

    Ok(match pixel_type {
        PixelType::UInt8 => read_as!(u8),
        PixelType::Int8 => read_as!(i8),
        PixelType::UInt16 => read_as!(u16),
        PixelType::Int16 => read_as!(i16),
        PixelType::UInt32 => read_as!(u32),
        PixelType::Int32 => read_as!(i32),
        PixelType::Float32 => read_as!(f32),
        PixelType::Float64 => read_as!(f64),
    })
}

/// Writes `volume` as a single `.mha` file.
pub fn write_mha(path: &Path, volume: &Volume) -> Result<()> {
    let mut bytes = header_text(volume, "LOCAL").into_bytes();
    bytes.extend(encode_samples(volume));
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Writes `volume` as an `.mhd` header plus a `.raw` data file beside it.
pub fn write_mhd(path: &Path, volume: &Volume) -> Result<()> {
    let raw_path = path.with_extension("raw");
    let raw_name = raw_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid MetaImage path {}", path.display()))?
        .to_string();
    fs::write(&raw_path, encode_samples(volume))
        .with_context(|| format!("Failed to write {}", raw_path.display()))?;
    fs::write(path, header_text(volume, &raw_name))
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Reads a `.mha` or `.mhd` file.
pub fn read(path: &Path) -> Result<Volume> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (fields, data_offset) = parse_header(&bytes)
        .with_context(|| format!("Invalid MetaImage header in {}", path.display()))?;

    let field = |key: &str| fields.get(key).map(String::as_str);
    let numbers = |key: &str| -> Result<Option<Vec<f64>>> {
        field(key)
            .map(|v| {
                v.split_whitespace()
                    .map(|n| n.parse::<f64>().with_context(|| format!("bad number in {}: {}", key, n)))
                    .collect()
            })
            .transpose()
    };
    let flag = |key: &str| field(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);

    let ndims: usize = field("NDims").ok_or_else(|| anyhow!("missing NDims"))?.parse()?;
    if !(2..=3).contains(&ndims) {
        bail!("only 2-D and 3-D MetaImages are supported, NDims = {}", ndims);
    }
    if let Some(channels) = field("ElementNumberOfChannels") {
        if channels != "1" {
            bail!("multi-channel MetaImages are not supported");
        }
    }

    let pad = |mut v: Vec<f64>, fill: f64| {
        v.resize(3, fill);
        v
    };
    let dims = pad(numbers("DimSize")?.ok_or_else(|| anyhow!("missing DimSize"))?, 1.0);
    let spacing = pad(
        numbers("ElementSpacing")?.or(numbers("ElementSize")?).unwrap_or_else(|| vec![1.0; ndims]),
        1.0,
    );
    let origin = pad(
        numbers("Offset")?
            .or(numbers("Origin")?)
            .or(numbers("Position")?)
            .unwrap_or_else(|| vec![0.0; ndims]),
        0.0,
    );
    let matrix = numbers("TransformMatrix")?
        .or(numbers("Rotation")?)
        .or(numbers("Orientation")?);
    let mut direction = Matrix3::identity();
    if let Some(m) = matrix {
        if m.len() != ndims * ndims {
            bail!("TransformMatrix has {} entries, expected {}", m.len(), ndims * ndims);
        }
        for axis in 0..ndims {
            for row in 0..ndims {
                direction[(row, axis)] = m[axis * ndims + row];
            }
        }
    }

    let pixel_type = pixel_type_from_name(field("ElementType").ok_or_else(|| anyhow!("missing ElementType"))?)?;
    let big_endian = flag("BinaryDataByteOrderMSB") || flag("ElementByteOrderMSB");
    if dims.iter().any(|d| !(d.fract() == 0.0 && *d >= 1.0 && *d <= usize::MAX as f64)) {
        bail!("invalid DimSize {:?}", &dims[..ndims]);
    }
    let size = [dims[0] as usize, dims[1] as usize, dims[2] as usize];
    let count = size[0]
        .checked_mul(size[1])
        .and_then(|n| n.checked_mul(size[2]))
        .filter(|n| n.checked_mul(pixel_type.size_in_bytes()).is_some())
        .ok_or_else(|| anyhow!("DimSize {:?} is too large", size))?;

    let data_file = field("ElementDataFile").ok_or_else(|| anyhow!("missing ElementDataFile"))?;
    let raw = if data_file == "LOCAL" {
        bytes[data_offset..].to_vec()
    } else {
        let raw_path = path.parent().unwrap_or_else(|| Path::new(".")).join(data_file);
        fs::read(&raw_path).with_context(|| format!("Failed to read {}", raw_path.display()))?
    };
    let raw = if flag("CompressedData") {
        let mut inflated = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut inflated)
            .context("Failed to inflate MetaImage data")?;
        inflated
    } else {
        raw
    };

    let samples = decode_samples(&raw, pixel_type, big_endian, count)?;
    let data = Array3::from_shape_vec((size[2], size[1], size[0]), samples)?;
    let geometry = Geometry {
        spacing: Vector3::new(spacing[0], spacing[1], spacing[2]),
        origin: Vector3::new(origin[0], origin[1], origin[2]),
        direction,
    };
    Volume::new(data, geometry, pixel_type)
}

/// Parses header lines up to and including `ElementDataFile`.
///
/// Returns the fields and the byte offset where voxel data starts.
fn parse_header(bytes: &[u8]) -> Result<(HashMap<String, String>, usize)> {
    let mut fields = HashMap::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p + 1)
            .unwrap_or(bytes.len());
        let line = std::str::from_utf8(&bytes[offset..end])
            .context("header line is not text")?
            .trim();
        offset = end;
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed header line {:?}", line))?;
        let key = key.trim().to_string();
        let is_last = key == "ElementDataFile";
        fields.insert(key, value.trim().to_string());
        if is_last {
            return Ok((fields, offset));
        }
    }
    bail!("header has no ElementDataFile entry")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume() -> Volume {
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (x as f32) - 10.0 * (y as f32) + 100.0 * (z as f32));
        let geometry = Geometry {
            spacing: Vector3::new(0.9375, 0.9375, 3.5),
            origin: Vector3::new(-120.5, 88.0, 12.25),
            direction: Matrix3::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0, 0.0),
        };
        Volume::new(data, geometry, PixelType::Int16).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let header = header_text(&sample_volume(), "LOCAL");
        assert!(header.starts_with("ObjectType = Image\nNDims = 3\n"));
        assert!(header.contains("DimSize = 4 3 2\n"));
        assert!(header.contains("ElementSpacing = 0.9375 0.9375 3.5\n"));
        assert!(header.contains("ElementType = MET_SHORT\n"));
        assert!(header.ends_with("ElementDataFile = LOCAL\n"));
    }

    #[test]
    fn test_identity_orientation_is_rai() {
        assert_eq!(anatomical_orientation(&Matrix3::identity()), "RAI");
    }

    #[test]
    fn test_mha_and_mhd_preserve_volume() {
        let dir = tempfile::tempdir().unwrap();
        let volume = sample_volume();

        let mha = dir.path().join("vol.mha");
        write_mha(&mha, &volume).unwrap();
        let mhd = dir.path().join("vol.mhd");
        write_mhd(&mhd, &volume).unwrap();
        assert!(dir.path().join("vol.raw").exists());

        for path in [&mha, &mhd] {
            let back = read(path).unwrap();
            assert_eq!(back.size(), [4, 3, 2]);
            assert_eq!(back.pixel_type(), PixelType::Int16);
            assert_eq!(back.geometry(), volume.geometry());
            assert_eq!(back.data(), volume.data());
        }
    }

    #[test]
    fn test_reads_compressed_big_endian_2d() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let samples: Vec<u8> = [1u16, 2, 3, 513].iter().flat_map(|v| v.to_be_bytes()).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&samples).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut file = b"ObjectType = Image\nNDims = 2\nBinaryData = True\n\
            BinaryDataByteOrderMSB = True\nCompressedData = True\nDimSize = 2 2\n\
            ElementType = MET_USHORT\nElementDataFile = LOCAL\n"
            .to_vec();
        file.extend(compressed);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.mha");
        fs::write(&path, file).unwrap();

        let volume = read(&path).unwrap();
        assert_eq!(volume.size(), [2, 2, 1]);
        assert_eq!(volume.value(1, 1, 0), 513.0);
        assert_eq!(volume.geometry().spacing, Vector3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.mha");
        for dim_size in ["4294967296 4294967296 4294967296", "3037000500 3037000500 1", "2 -1 2", "2 2.5 2"] {
            let header = format!(
                "ObjectType = Image\nNDims = 3\nDimSize = {}\nElementType = MET_FLOAT\nElementDataFile = LOCAL\n",
                dim_size
            );
            let mut file = header.into_bytes();
            file.extend([0u8; 16]);
            fs::write(&path, file).unwrap();

            let err = read(&path).unwrap_err().to_string();
            assert!(err.contains("DimSize"), "{}: {}", dim_size, err);
        }
    }
}
