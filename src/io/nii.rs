//! NIfTI-1 (`.nii`, `.nii.gz`) reading and writing through the `nifti` crate.
//!
//! NIfTI stores RAS world coordinates while DICOM and MetaImage use LPS, so
//! the first two rows of the affine change sign on the way in and out.

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use ndarray::{Array3, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use std::path::Path;

use crate::volume::{Geometry, PixelType, Volume};

const RAS_TO_LPS: [f64; 3] = [-1.0, -1.0, 1.0];

fn pixel_type_of(header: &NiftiHeader) -> PixelType {
    let scaled = header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0);
    if scaled {
        return PixelType::Float32;
    }
    match header.data_type() {
        Ok(NiftiType::Uint8) => PixelType::UInt8,
        Ok(NiftiType::Int8) => PixelType::Int8,
        Ok(NiftiType::Uint16) => PixelType::UInt16,
        Ok(NiftiType::Int16) => PixelType::Int16,
        Ok(NiftiType::Uint32) => PixelType::UInt32,
        Ok(NiftiType::Int32) => PixelType::Int32,
        Ok(NiftiType::Float64) => PixelType::Float64,
        _ => PixelType::Float32,
    }
}

/// Geometry in LPS from the sform, the qform, or plain voxel sizes, in that order.
fn geometry_of(header: &NiftiHeader) -> Geometry {
    let pixdim = |i: usize| {
        let d = header.pixdim[i].abs() as f64;
        if d > 0.0 {
            d
        } else {
            1.0
        }
    };
    let mut spacing = Vector3::new(pixdim(1), pixdim(2), pixdim(3));
    let mut direction = Matrix3::identity();
    let mut origin = Vector3::zeros();

    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut linear = Matrix3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                linear[(r, c)] = rows[r][c] as f64;
            }
            origin[r] = rows[r][3] as f64;
        }
        for c in 0..3 {
            let norm = linear.column(c).norm();
            if norm > 0.0 {
                spacing[c] = norm;
                direction.set_column(c, &(linear.column(c) / norm));
            }
        }
    } else if header.qform_code > 0 {
        let (b, c, d) = (header.quatern_b as f64, header.quatern_c as f64, header.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        direction = *UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d))
            .to_rotation_matrix()
            .matrix();
        if header.pixdim[0] < 0.0 {
            let flipped = -direction.column(2);
            direction.set_column(2, &flipped);
        }
        origin = Vector3::new(header.quatern_x as f64, header.quatern_y as f64, header.quatern_z as f64);
    } else {
        // no orientation stored: follow the RAS axes
        direction = Matrix3::from_diagonal(&Vector3::from(RAS_TO_LPS));
    }

    for r in 0..3 {
        origin[r] *= RAS_TO_LPS[r];
        for c in 0..3 {
            direction[(r, c)] *= RAS_TO_LPS[r];
        }
    }
    Geometry { spacing, origin, direction }
}

pub fn read(path: &Path) -> Result<Volume> {
    let object = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    let header = object.header().clone();
    let array = object
        .into_volume()
        .into_ndarray::<f32>()
        .with_context(|| format!("Failed to decode voxels of {}", path.display()))?;

    let shape = array.shape().to_vec();
    if shape.len() < 2 || shape.iter().skip(3).any(|&n| n != 1) {
        bail!("{} is not a 2-D or 3-D image (shape {:?})", path.display(), shape);
    }
    let (nx, ny) = (shape[0], shape[1]);
    let nz = shape.get(2).copied().unwrap_or(1);
    let rank = shape.len();

    let data = Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| {
        let mut index = vec![0usize; rank];
        index[0] = x;
        index[1] = y;
        if rank > 2 {
            index[2] = z;
        }
        array[IxDyn(&index)]
    });
    Volume::new(data, geometry_of(&header), pixel_type_of(&header))
}

/// Header carrying the geometry of `volume`; dims and datatype are filled by the writer.
fn header_for(volume: &Volume) -> NiftiHeader {
    let geometry = volume.geometry();
    let mut header = NiftiHeader::default();

    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = geometry.spacing[axis] as f32;
    }
    let mut rows = [[0f32; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for c in 0..3 {
            row[c] = (RAS_TO_LPS[r] * geometry.direction[(r, c)] * geometry.spacing[c]) as f32;
        }
        row[3] = (RAS_TO_LPS[r] * geometry.origin[r]) as f32;
    }
    header.srow_x = rows[0];
    header.srow_y = rows[1];
    header.srow_z = rows[2];
    header.sform_code = 1;
    header.qform_code = 0;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    // millimetres
    header.xyzt_units = 2;
    header
}

pub fn write(path: &Path, volume: &Volume) -> Result<()> {
    let header = header_for(volume);
    let pixel_type = volume.pixel_type();
    // NIfTI arrays are indexed [x, y, z]
    let samples = volume.data().view().reversed_axes();
    let options = WriterOptions::new(path).reference_header(&header);

    let written = match pixel_type {
        PixelType::UInt8 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as u8)),
        PixelType::Int8 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as i8)),
        PixelType::UInt16 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as u16)),
        PixelType::Int16 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as i16)),
        PixelType::UInt32 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as u32)),
        PixelType::Int32 => options.write_nifti(&samples.mapv(|v| pixel_type.convert(v) as i32)),
        PixelType::Float32 => options.write_nifti(&samples.to_owned()),
        PixelType::Float64 => options.write_nifti(&samples.mapv(|v| v as f64)),
    };
    written.with_context(|| format!("Failed to write NIfTI file {}", path.display()))
}
