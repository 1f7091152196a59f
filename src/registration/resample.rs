//! Resampling a moving volume onto the grid of a reference volume.

use anyhow::Result;
use nalgebra::Vector3;
use ndarray::Array3;

use super::transform::Euler3D;
use crate::volume::Volume;

/// Samples `moving` on the grid of `reference` through `transform` with
/// trilinear interpolation. Points mapping outside `moving` get `default_value`.
///
/// The result keeps the pixel type of `moving`.
pub fn resample(moving: &Volume, reference: &Volume, transform: &Euler3D, default_value: f32) -> Result<Volume> {
    let [nx, ny, nz] = reference.size();
    let pixel_type = moving.pixel_type();
    let data = Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| {
        let point = reference.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
        let index = moving.physical_to_index(&transform.transform_point(&point));
        pixel_type.convert(moving.interpolate(&index).unwrap_or(default_value))
    });
    Volume::with_grid_of(reference, data, pixel_type)
}
