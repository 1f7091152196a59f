//! Mattes mutual information between a fixed and a moving volume.
//!
//! The joint histogram uses a box window on the fixed intensity and a cubic
//! B-spline window on the moving intensity, so the metric is differentiable
//! with respect to the transform parameters.

use anyhow::{bail, Result};
use nalgebra::Vector3;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::transform::{Euler3D, Parameters, PARAMETER_COUNT};
use crate::volume::Volume;

/// Empty bins kept on each side of the intensity range.
const PADDING: usize = 2;

const CLOSE_TO_ZERO: f64 = 1e-16;

/// Cubic B-spline kernel.
pub fn bspline3(x: f64) -> f64 {
    let a = x.abs();
    if a < 1.0 {
        (4.0 - 6.0 * a * a + 3.0 * a * a * a) / 6.0
    } else if a < 2.0 {
        let t = 2.0 - a;
        t * t * t / 6.0
    } else {
        0.0
    }
}

/// First derivative of [`bspline3`].
pub fn bspline3_derivative(x: f64) -> f64 {
    let a = x.abs();
    if a < 1.0 {
        -2.0 * x + 1.5 * x * a
    } else if a < 2.0 {
        let t = 2.0 - a;
        -0.5 * t * t * x.signum()
    } else {
        0.0
    }
}

/// Maps intensities onto histogram bins.
#[derive(Debug, Clone, Copy)]
struct BinMapping {
    bin_size: f64,
    normalized_min: f64,
    bins: usize,
}

impl BinMapping {
    fn new(min: f64, max: f64, bins: usize) -> Self {
        let range = max - min;
        let bin_size = if range > 0.0 {
            range / (bins - 2 * PADDING) as f64
        } else {
            1.0
        };
        Self { bin_size, normalized_min: min / bin_size - PADDING as f64, bins }
    }

    /// Continuous bin coordinate of `value`.
    fn term(&self, value: f64) -> f64 {
        value / self.bin_size - self.normalized_min
    }

    fn box_bin(&self, value: f64) -> usize {
        let bin = self.term(value).floor() as i64;
        bin.clamp(PADDING as i64, (self.bins - PADDING - 1) as i64) as usize
    }

    /// First of the four bins touched by the B-spline window.
    fn spline_start(&self, term: f64) -> usize {
        let start = term.floor() as i64 - 1;
        start.clamp(1, self.bins as i64 - 4) as usize
    }
}

#[derive(Debug, Clone)]
struct FixedSample {
    point: Vector3<f64>,
    bin: usize,
}

/// Metric value and its gradient for one transform.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Negated mutual information; lower is better.
    pub value: f64,
    /// Gradient of the mutual information (ascent direction).
    pub derivative: Parameters,
    /// Samples that mapped inside the moving image.
    pub valid_samples: usize,
}

pub struct MattesMutualInformation<'a> {
    moving: &'a Volume,
    /// Index-space central differences of the moving volume, one per axis.
    moving_gradient: [Array3<f32>; 3],
    samples: Vec<FixedSample>,
    moving_bins: BinMapping,
    bins: usize,
}

impl<'a> MattesMutualInformation<'a> {
    /// Draws `sampling_percentage` of the fixed voxels at random positions,
    /// keeping those where `mask` is non-zero.
    pub fn new(
        fixed: &Volume,
        moving: &'a Volume,
        mask: &Volume,
        bins: usize,
        sampling_percentage: f64,
        seed: u64,
    ) -> Result<Self> {
        let (fixed_min, fixed_max) = match fixed.min_max() {
            Some(range) => range,
            None => bail!("Fixed image is empty"),
        };
        let (moving_min, moving_max) = match moving.min_max() {
            Some(range) => range,
            None => bail!("Moving image is empty"),
        };
        let fixed_bins = BinMapping::new(fixed_min as f64, fixed_max as f64, bins);
        let moving_bins = BinMapping::new(moving_min as f64, moving_max as f64, bins);

        let [nx, ny, nz] = fixed.size();
        let draws = ((fixed.voxel_count() as f64) * sampling_percentage).round().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(draws);
        for _ in 0..draws {
            let (x, y, z) = (rng.gen_range(0..nx), rng.gen_range(0..ny), rng.gen_range(0..nz));
            let point = fixed.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
            if !matches!(mask.nearest_value(&point), Some(v) if v != 0.0) {
                continue;
            }
            samples.push(FixedSample { point, bin: fixed_bins.box_bin(fixed.value(x, y, z) as f64) });
        }
        if samples.is_empty() {
            bail!("No fixed image samples fall inside the mask");
        }
        debug!("{} of {} random samples inside the mask", samples.len(), draws);

        Ok(Self {
            moving,
            moving_gradient: central_differences(moving.data()),
            samples,
            moving_bins,
            bins,
        })
    }

    pub fn evaluate(&self, transform: &Euler3D) -> Result<Evaluation> {
        let n = self.bins;
        let mut joint = vec![0.0f64; n * n];
        let mut joint_derivative = vec![[0.0f64; PARAMETER_COUNT]; n * n];
        let data = self.moving.data();
        let [gx, gy, gz] = &self.moving_gradient;
        let mut valid = 0usize;

        for sample in &self.samples {
            let mapped = transform.transform_point(&sample.point);
            let index = self.moving.physical_to_index(&mapped);
            let Some(cell) = self.moving.interpolation_cell(&index) else {
                continue;
            };
            let value = cell.blend(|x, y, z| data[[z, y, x]]) as f64;
            let index_gradient = Vector3::new(
                cell.blend(|x, y, z| gx[[z, y, x]]) as f64,
                cell.blend(|x, y, z| gy[[z, y, x]]) as f64,
                cell.blend(|x, y, z| gz[[z, y, x]]) as f64,
            );
            let gradient = self.moving.index_gradient_to_physical(&index_gradient);
            let d_value = gradient.transpose() * transform.jacobian(&sample.point);

            let term = self.moving_bins.term(value);
            let start = self.moving_bins.spline_start(term);
            let row = sample.bin * n;
            for bin in start..start + 4 {
                let arg = bin as f64 - term;
                joint[row + bin] += bspline3(arg);
                // d(weight)/d(value) = -B3'(arg) / bin_size
                let factor = -bspline3_derivative(arg) / self.moving_bins.bin_size;
                let cell_derivative = &mut joint_derivative[row + bin];
                for (k, d) in cell_derivative.iter_mut().enumerate() {
                    *d += factor * d_value[k];
                }
            }
            valid += 1;
        }

        if valid == 0 {
            bail!("All samples map outside the moving image buffer");
        }

        let norm = 1.0 / valid as f64;
        joint.iter_mut().for_each(|p| *p *= norm);
        let mut fixed_pdf = vec![0.0f64; n];
        let mut moving_pdf = vec![0.0f64; n];
        for f in 0..n {
            for m in 0..n {
                fixed_pdf[f] += joint[f * n + m];
                moving_pdf[m] += joint[f * n + m];
            }
        }

        let mut mutual_information = 0.0;
        let mut derivative = [0.0f64; PARAMETER_COUNT];
        for f in 0..n {
            for m in 0..n {
                let p = joint[f * n + m];
                if p <= CLOSE_TO_ZERO || moving_pdf[m] <= CLOSE_TO_ZERO || fixed_pdf[f] <= CLOSE_TO_ZERO {
                    continue;
                }
                mutual_information += p * (p / (fixed_pdf[f] * moving_pdf[m])).ln();
                let ratio = (p / moving_pdf[m]).ln();
                for (k, d) in derivative.iter_mut().enumerate() {
                    *d += joint_derivative[f * n + m][k] * norm * ratio;
                }
            }
        }

        Ok(Evaluation { value: -mutual_information, derivative, valid_samples: valid })
    }
}

/// Central differences along x, y and z of a `[z, y, x]` array, one-sided at the borders.
fn central_differences(data: &Array3<f32>) -> [Array3<f32>; 3] {
    let (nz, ny, nx) = data.dim();
    let diff = |lo: f32, hi: f32, span: usize| if span == 0 { 0.0 } else { (hi - lo) / span as f32 };
    let along = |axis: usize| {
        Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| {
            let (c, n) = match axis {
                0 => (x, nx),
                1 => (y, ny),
                _ => (z, nz),
            };
            let lo = c.saturating_sub(1);
            let hi = (c + 1).min(n - 1);
            let at = |i: usize| match axis {
                0 => data[[z, y, i]],
                1 => data[[z, i, x]],
                _ => data[[i, y, x]],
            };
            diff(at(lo), at(hi), hi - lo)
        })
    };
    [along(0), along(1), along(2)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Geometry, PixelType};

    fn blob(center: Vector3<f64>) -> Volume {
        let data = Array3::from_shape_fn((16, 16, 16), |(z, y, x)| {
            let d = Vector3::new(x as f64, y as f64, z as f64) - center;
            let r2 = d.x * d.x / 9.0 + d.y * d.y / 16.0 + d.z * d.z / 6.0;
            (100.0 * (-r2 / 2.0).exp()) as f32
        });
        Volume::new(data, Geometry::default(), PixelType::Float32).unwrap()
    }

    fn ones() -> Volume {
        Volume::filled([16, 16, 16], 1.0, Geometry::default(), PixelType::UInt8).unwrap()
    }

    #[test]
    fn test_bspline_partition_of_unity() {
        for &term in &[2.0f64, 2.25, 5.5, 9.999] {
            let start = term.floor() - 1.0;
            let sum: f64 = (0..4).map(|k| bspline3(start + k as f64 - term)).sum();
            let dsum: f64 = (0..4).map(|k| bspline3_derivative(start + k as f64 - term)).sum();
            assert!((sum - 1.0).abs() < 1e-12, "term {}", term);
            assert!(dsum.abs() < 1e-12, "term {}", term);
        }
    }

    #[test]
    fn test_bspline_derivative_matches_finite_differences() {
        let h = 1e-6;
        for &x in &[-1.7, -0.4, 0.0, 0.3, 1.2, 1.9] {
            let numeric = (bspline3(x + h) - bspline3(x - h)) / (2.0 * h);
            assert!((numeric - bspline3_derivative(x)).abs() < 1e-6, "x = {}", x);
        }
    }

    #[test]
    fn test_aligned_images_score_better() {
        let fixed = blob(Vector3::new(7.5, 7.5, 7.5));
        let moving = blob(Vector3::new(9.0, 7.5, 7.5));
        let mask = ones();
        let metric = MattesMutualInformation::new(&fixed, &moving, &mask, 32, 0.5, 7).unwrap();

        let misaligned = metric.evaluate(&Euler3D::identity()).unwrap();
        let aligned = metric
            .evaluate(&Euler3D::with_parameters([0.0, 0.0, 0.0, 1.5, 0.0, 0.0]))
            .unwrap();
        assert!(aligned.value < misaligned.value);
        // moving towards the true shift raises the mutual information
        assert!(misaligned.derivative[3] > 0.0);
    }

    #[test]
    fn test_step_along_derivative_improves_metric() {
        let fixed = blob(Vector3::new(7.5, 7.5, 7.5));
        let moving = blob(Vector3::new(8.5, 7.0, 8.0));
        let mask = ones();
        let metric = MattesMutualInformation::new(&fixed, &moving, &mask, 32, 0.5, 3).unwrap();

        let parameters = [0.0, 0.0, 0.0, 0.3, -0.2, 0.1];
        let start = metric.evaluate(&Euler3D::with_parameters(parameters)).unwrap();
        let translation = &start.derivative[3..];
        let norm = translation.iter().map(|d| d * d).sum::<f64>().sqrt();
        assert!(norm > 0.0);

        let mut stepped = parameters;
        for k in 0..3 {
            stepped[3 + k] += 0.05 * translation[k] / norm;
        }
        let after = metric.evaluate(&Euler3D::with_parameters(stepped)).unwrap();
        assert!(after.value < start.value, "{} !< {}", after.value, start.value);
    }

    #[test]
    fn test_samples_mapped_outside_are_not_counted() {
        let fixed = blob(Vector3::new(7.5, 7.5, 7.5));
        let metric = MattesMutualInformation::new(&fixed, &fixed, &ones(), 32, 0.5, 11).unwrap();

        let identity = metric.evaluate(&Euler3D::identity()).unwrap();
        let shifted = metric
            .evaluate(&Euler3D::with_parameters([0.0, 0.0, 0.0, 8.0, 0.0, 0.0]))
            .unwrap();
        assert!(shifted.valid_samples > 0);
        assert!(shifted.valid_samples < identity.valid_samples);
    }

    #[test]
    fn test_empty_mask_is_an_error() {
        let fixed = blob(Vector3::new(7.5, 7.5, 7.5));
        let mask = Volume::filled([16, 16, 16], 0.0, Geometry::default(), PixelType::UInt8).unwrap();
        assert!(MattesMutualInformation::new(&fixed, &fixed, &mask, 32, 0.4, 1).is_err());
    }
}
