//! Rigid registration of a moving volume onto a fixed reference.
//!
//! Mattes mutual information sampled at random inside the reference mask,
//! maximized over an Euler 3-D transform with scaled gradient descent.

pub mod metric;
pub mod optimizer;
pub mod resample;
pub mod transform;

use anyhow::{bail, Result};
use tracing::info;

pub use optimizer::StopReason;
pub use resample::resample;
pub use transform::Euler3D;

use metric::MattesMutualInformation;
use optimizer::{GradientDescent, PhysicalShiftScales};

use crate::volume::Volume;

/// Tunable registration settings; the defaults match the reference protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationSettings {
    pub histogram_bins: usize,
    /// Fraction of fixed voxels drawn as metric samples.
    pub sampling_percentage: f64,
    pub learning_rate: f64,
    pub number_of_iterations: usize,
    pub convergence_minimum_value: f64,
    pub convergence_window_size: usize,
    pub estimate_learning_rate: bool,
    pub random_seed: u64,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            histogram_bins: 64,
            sampling_percentage: 0.4,
            learning_rate: 10.0,
            number_of_iterations: 100,
            convergence_minimum_value: 1e-6,
            convergence_window_size: 10,
            estimate_learning_rate: true,
            random_seed: 121_212,
        }
    }
}

impl RegistrationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.histogram_bins < 8 {
            bail!("histogram_bins must be at least 8, got {}", self.histogram_bins);
        }
        if !(self.sampling_percentage > 0.0 && self.sampling_percentage <= 1.0) {
            bail!("sampling_percentage must be in (0, 1], got {}", self.sampling_percentage);
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.number_of_iterations == 0 {
            bail!("number_of_iterations must be positive");
        }
        if self.convergence_window_size < 2 {
            bail!("convergence_window_size must be at least 2, got {}", self.convergence_window_size);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub transform: Euler3D,
    /// Negated mutual information at the last evaluation.
    pub final_metric: f64,
    pub iterations: usize,
    pub stop_reason: StopReason,
}

/// Finds the transform mapping `fixed` space into `moving` space.
///
/// Starts at identity without any geometric pre-alignment.
pub fn register(
    fixed: &Volume,
    moving: &Volume,
    mask: &Volume,
    settings: &RegistrationSettings,
) -> Result<RegistrationOutcome> {
    settings.validate()?;

    let metric = MattesMutualInformation::new(
        fixed,
        moving,
        mask,
        settings.histogram_bins,
        settings.sampling_percentage,
        settings.random_seed,
    )?;

    let spacing = &fixed.geometry().spacing;
    let optimizer = GradientDescent {
        learning_rate: settings.learning_rate,
        number_of_iterations: settings.number_of_iterations,
        convergence_minimum_value: settings.convergence_minimum_value,
        convergence_window_size: settings.convergence_window_size,
        estimate_learning_rate: settings.estimate_learning_rate,
        maximum_step_size: spacing.min(),
    };
    let scales = PhysicalShiftScales::new(fixed.corner_points());

    let outcome = optimizer.optimize(Euler3D::identity(), &scales, |t| metric.evaluate(t))?;

    info!("Optimizer stop condition: {}", outcome.stop_reason);
    info!("Final metric value: {}", outcome.final_value);

    Ok(RegistrationOutcome {
        transform: outcome.transform,
        final_metric: outcome.final_value,
        iterations: outcome.iterations,
        stop_reason: outcome.stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Geometry, PixelType};
    use nalgebra::Vector3;
    use ndarray::Array3;

    fn blob(center: Vector3<f64>) -> Volume {
        let data = Array3::from_shape_fn((20, 20, 20), |(z, y, x)| {
            let d = Vector3::new(x as f64, y as f64, z as f64) - center;
            let r2 = d.x * d.x / 9.0 + d.y * d.y / 16.0 + d.z * d.z / 6.0;
            (100.0 * (-r2 / 2.0).exp()) as f32
        });
        Volume::new(data, Geometry::default(), PixelType::Float32).unwrap()
    }

    #[test]
    fn test_settings_validation() {
        assert!(RegistrationSettings::default().validate().is_ok());
        let bad = RegistrationSettings { sampling_percentage: 1.5, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = RegistrationSettings { histogram_bins: 4, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_registration_reduces_known_translation() {
        let center = Vector3::new(9.5, 9.5, 9.5);
        let shift = Vector3::new(1.5, -1.0, 0.5);
        let fixed = blob(center);
        let moving = blob(center + shift);
        let mask = Volume::filled([20, 20, 20], 1.0, Geometry::default(), PixelType::UInt8).unwrap();

        let settings = RegistrationSettings { histogram_bins: 32, ..Default::default() };
        let outcome = register(&fixed, &moving, &mask, &settings).unwrap();

        let error = (outcome.transform.translation() - shift).norm();
        assert!(error < shift.norm(), "residual {} from {}", error, shift.norm());
        assert!(outcome.final_metric < 0.0);
        assert!(outcome.iterations > 0);
    }
}
