//! In-memory 3-D image volumes.
//!
//! Samples are held as `f32` in an `ndarray` indexed `[z, y, x]`, so the
//! x index varies fastest in memory like in MetaImage and NIfTI files.
//! `pixel_type` remembers the element type the volume is written back as.

use anyhow::{bail, Result};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

/// Element type of a volume on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl PixelType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            PixelType::UInt8 | PixelType::Int8 => 1,
            PixelType::UInt16 | PixelType::Int16 => 2,
            PixelType::UInt32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Converts a sample into the value range of this type.
    pub fn convert(self, value: f32) -> f32 {
        let clamp_round = |min: f64, max: f64| {
            if value.is_nan() {
                0.0
            } else {
                (value as f64).round().clamp(min, max) as f32
            }
        };
        match self {
            PixelType::UInt8 => clamp_round(u8::MIN as f64, u8::MAX as f64),
            PixelType::Int8 => clamp_round(i8::MIN as f64, i8::MAX as f64),
            PixelType::UInt16 => clamp_round(u16::MIN as f64, u16::MAX as f64),
            PixelType::Int16 => clamp_round(i16::MIN as f64, i16::MAX as f64),
            PixelType::UInt32 => clamp_round(u32::MIN as f64, u32::MAX as f64),
            PixelType::Int32 => clamp_round(i32::MIN as f64, i32::MAX as f64),
            PixelType::Float32 | PixelType::Float64 => value,
        }
    }
}

/// Physical placement of the voxel grid.
///
/// Column `j` of `direction` is the unit vector of index axis `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub spacing: Vector3<f64>,
    pub origin: Vector3<f64>,
    pub direction: Matrix3<f64>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: Vector3::new(1.0, 1.0, 1.0),
            origin: Vector3::zeros(),
            direction: Matrix3::identity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    geometry: Geometry,
    pixel_type: PixelType,
    /// index -> physical, `direction * diag(spacing)`
    index_to_physical: Matrix3<f64>,
    physical_to_index: Matrix3<f64>,
}

impl Volume {
    /// `data` is indexed `[z, y, x]`.
    pub fn new(data: Array3<f32>, geometry: Geometry, pixel_type: PixelType) -> Result<Self> {
        if geometry.spacing.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            bail!("voxel spacing must be positive, got {:?}", geometry.spacing.as_slice());
        }
        let index_to_physical = geometry.direction * Matrix3::from_diagonal(&geometry.spacing);
        let Some(physical_to_index) = index_to_physical.try_inverse() else {
            bail!("direction matrix is singular");
        };
        Ok(Self { data, geometry, pixel_type, index_to_physical, physical_to_index })
    }

    /// A volume of `size` (x, y, z) filled with `value`.
    pub fn filled(size: [usize; 3], value: f32, geometry: Geometry, pixel_type: PixelType) -> Result<Self> {
        let data = Array3::from_elem((size[2], size[1], size[0]), value);
        Self::new(data, geometry, pixel_type)
    }

    /// A volume on the grid of `reference` holding `data`.
    pub fn with_grid_of(reference: &Volume, data: Array3<f32>, pixel_type: PixelType) -> Result<Self> {
        if data.dim() != reference.data.dim() {
            bail!("data shape {:?} does not match grid {:?}", data.dim(), reference.data.dim());
        }
        Self::new(data, reference.geometry.clone(), pixel_type)
    }

    /// Size along (x, y, z).
    pub fn size(&self) -> [usize; 3] {
        let (nz, ny, nx) = self.data.dim();
        [nx, ny, nz]
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn value(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    /// Converts the samples to `pixel_type`, as a toolkit cast filter would.
    pub fn cast(mut self, pixel_type: PixelType) -> Self {
        if pixel_type != self.pixel_type && !pixel_type.is_float() {
            self.data.mapv_inplace(|v| pixel_type.convert(v));
        }
        self.pixel_type = pixel_type;
        self
    }

    /// Divides every sample by `divisor` in single precision.
    pub fn divide_by(&mut self, divisor: f32) {
        self.data.mapv_inplace(|v| v / divisor);
    }

    /// Minimum and maximum sample value, `None` for an empty volume.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    pub fn index_to_physical(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.geometry.origin + self.index_to_physical * index
    }

    /// Continuous index of a physical point.
    pub fn physical_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.physical_to_index * (point - self.geometry.origin)
    }

    /// Maps a gradient taken along index axes to a physical-space gradient.
    pub fn index_gradient_to_physical(&self, gradient: &Vector3<f64>) -> Vector3<f64> {
        self.physical_to_index.transpose() * gradient
    }

    /// Physical positions of the eight grid corners.
    pub fn corner_points(&self) -> Vec<Vector3<f64>> {
        let [nx, ny, nz] = self.size();
        let last = |n: usize| n.saturating_sub(1) as f64;
        let mut corners = Vec::with_capacity(8);
        for &z in &[0.0, last(nz)] {
            for &y in &[0.0, last(ny)] {
                for &x in &[0.0, last(nx)] {
                    corners.push(self.index_to_physical(&Vector3::new(x, y, z)));
                }
            }
        }
        corners
    }

    /// Value of the voxel nearest to a physical point, `None` outside the grid.
    pub fn nearest_value(&self, point: &Vector3<f64>) -> Option<f32> {
        let index = self.physical_to_index(point);
        let size = self.size();
        let mut rounded = [0usize; 3];
        for axis in 0..3 {
            let r = index[axis].round();
            if r < 0.0 || r >= size[axis] as f64 {
                return None;
            }
            rounded[axis] = r as usize;
        }
        Some(self.value(rounded[0], rounded[1], rounded[2]))
    }

    /// Trilinear interpolation at a continuous index.
    ///
    /// Points within half a voxel of the grid are inside; neighbours past the
    /// edge are clamped to the border voxel.
    pub fn interpolate(&self, index: &Vector3<f64>) -> Option<f32> {
        let cell = self.interpolation_cell(index)?;
        Some(cell.blend(|x, y, z| self.data[[z, y, x]]))
    }

    pub(crate) fn interpolation_cell(&self, index: &Vector3<f64>) -> Option<Cell> {
        let size = self.size();
        let mut lower = [0usize; 3];
        let mut upper = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let c = index[axis];
            let n = size[axis];
            if !(c >= -0.5 && c < n as f64 - 0.5) {
                return None;
            }
            let floor = c.floor();
            let base = floor as i64;
            frac[axis] = c - floor;
            lower[axis] = base.clamp(0, n as i64 - 1) as usize;
            upper[axis] = (base + 1).clamp(0, n as i64 - 1) as usize;
        }
        Some(Cell { lower, upper, frac })
    }
}

/// The eight neighbours of a continuous index and its fractional offsets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cell {
    lower: [usize; 3],
    upper: [usize; 3],
    frac: [f64; 3],
}

impl Cell {
    /// Trilinear blend of `sample(x, y, z)` over the cell corners.
    pub(crate) fn blend<F: Fn(usize, usize, usize) -> f32>(&self, sample: F) -> f32 {
        let [fx, fy, fz] = self.frac;
        let [x0, y0, z0] = self.lower;
        let [x1, y1, z1] = self.upper;

        let lerp = |a: f32, b: f32, t: f64| (a as f64 * (1.0 - t) + b as f64 * t);
        let c00 = lerp(sample(x0, y0, z0), sample(x1, y0, z0), fx);
        let c10 = lerp(sample(x0, y1, z0), sample(x1, y1, z0), fx);
        let c01 = lerp(sample(x0, y0, z1), sample(x1, y0, z1), fx);
        let c11 = lerp(sample(x0, y1, z1), sample(x1, y1, z1), fx);
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        (c0 * (1.0 - fz) + c1 * fz) as f32
    }
}
