//! Gradient descent over the Euler parameters.

use anyhow::Result;
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

use super::metric::Evaluation;
use super::transform::{Euler3D, Parameters, PARAMETER_COUNT};

/// Parameter perturbation used when measuring physical shifts.
const SMALL_PARAMETER_VARIATION: f64 = 0.01;

/// Estimates per-parameter scales and step sizes from how far a parameter
/// change moves a set of physical points.
#[derive(Debug, Clone)]
pub struct PhysicalShiftScales {
    points: Vec<Vector3<f64>>,
}

impl PhysicalShiftScales {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        Self { points }
    }

    fn max_shift(&self, transform: &Euler3D, step: &Parameters) -> f64 {
        let mut moved = transform.clone();
        let mut parameters = *transform.parameters();
        for (p, s) in parameters.iter_mut().zip(step) {
            *p += s;
        }
        moved.set_parameters(parameters);
        self.points
            .iter()
            .map(|p| (moved.transform_point(p) - transform.transform_point(p)).norm())
            .fold(0.0, f64::max)
    }

    /// Squared shift per unit change of each parameter.
    pub fn estimate_scales(&self, transform: &Euler3D) -> Parameters {
        let mut scales = [1.0; PARAMETER_COUNT];
        for (k, scale) in scales.iter_mut().enumerate() {
            let mut step = [0.0; PARAMETER_COUNT];
            step[k] = SMALL_PARAMETER_VARIATION;
            let shift = self.max_shift(transform, &step) / SMALL_PARAMETER_VARIATION;
            if shift > f64::EPSILON {
                *scale = shift * shift;
            }
        }
        scales
    }

    /// Largest physical displacement caused by applying `step`.
    pub fn step_scale(&self, transform: &Euler3D, step: &Parameters) -> f64 {
        self.max_shift(transform, step)
    }
}

/// Tracks the trend of the last few metric values.
#[derive(Debug, Clone)]
pub struct ConvergenceWindow {
    size: usize,
    energies: VecDeque<f64>,
    total_energy: f64,
}

impl ConvergenceWindow {
    pub fn new(size: usize) -> Self {
        Self { size, energies: VecDeque::with_capacity(size), total_energy: 0.0 }
    }

    pub fn push(&mut self, energy: f64) {
        self.total_energy += energy.abs();
        if self.energies.len() == self.size {
            self.energies.pop_front();
        }
        self.energies.push_back(energy);
    }

    /// Negated slope of the normalized energies across the window, `None`
    /// until the window has filled.
    pub fn value(&self) -> Option<f64> {
        if self.size < 2 || self.energies.len() < self.size || self.total_energy <= 0.0 {
            return None;
        }
        let n = self.size as f64;
        let ts: Vec<f64> = (0..self.size).map(|i| i as f64 / (n - 1.0)).collect();
        let es: Vec<f64> = self.energies.iter().map(|e| e / self.total_energy).collect();
        let t_mean = ts.iter().sum::<f64>() / n;
        let e_mean = es.iter().sum::<f64>() / n;
        let (mut cov, mut var) = (0.0, 0.0);
        for (t, e) in ts.iter().zip(&es) {
            cov += (t - t_mean) * (e - e_mean);
            var += (t - t_mean) * (t - t_mean);
        }
        Some(-cov / var)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    MaximumIterations(usize),
    Converged { iteration: usize, value: f64 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaximumIterations(n) => {
                write!(f, "Maximum number of iterations ({}) exceeded.", n)
            }
            StopReason::Converged { iteration, value } => write!(
                f,
                "Convergence checker passed at iteration {} (convergence value {:e}).",
                iteration, value
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradientDescent {
    pub learning_rate: f64,
    pub number_of_iterations: usize,
    pub convergence_minimum_value: f64,
    pub convergence_window_size: usize,
    pub estimate_learning_rate: bool,
    /// Largest physical move of the first step when estimating the rate.
    pub maximum_step_size: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub transform: Euler3D,
    pub final_value: f64,
    pub iterations: usize,
    pub stop_reason: StopReason,
}

impl GradientDescent {
    /// Maximizes the mutual information reported by `evaluate`, starting at `transform`.
    pub fn optimize<F>(
        &self,
        mut transform: Euler3D,
        scales_estimator: &PhysicalShiftScales,
        mut evaluate: F,
    ) -> Result<OptimizationOutcome>
    where
        F: FnMut(&Euler3D) -> Result<Evaluation>,
    {
        let scales = scales_estimator.estimate_scales(&transform);
        debug!("parameter scales: {:?}", scales);

        let mut learning_rate = self.learning_rate;
        let mut window = ConvergenceWindow::new(self.convergence_window_size);
        let mut final_value = f64::MAX;

        for iteration in 0..self.number_of_iterations {
            let evaluation = evaluate(&transform)?;
            final_value = evaluation.value;
            debug!("{}: metric = {} ({} samples)", iteration, evaluation.value, evaluation.valid_samples);

            window.push(evaluation.value);
            if let Some(value) = window.value() {
                if value <= self.convergence_minimum_value {
                    return Ok(OptimizationOutcome {
                        transform,
                        final_value,
                        iterations: iteration + 1,
                        stop_reason: StopReason::Converged { iteration, value },
                    });
                }
            }

            let mut scaled = evaluation.derivative;
            for (g, s) in scaled.iter_mut().zip(&scales) {
                *g /= s;
            }

            if self.estimate_learning_rate && iteration == 0 {
                let shift = scales_estimator.step_scale(&transform, &scaled);
                learning_rate = if shift > f64::EPSILON {
                    self.maximum_step_size / shift
                } else {
                    1.0
                };
                debug!("estimated learning rate: {}", learning_rate);
            }

            let mut parameters = *transform.parameters();
            for (p, g) in parameters.iter_mut().zip(&scaled) {
                *p += learning_rate * g;
            }
            transform.set_parameters(parameters);
        }

        Ok(OptimizationOutcome {
            transform,
            final_value,
            iterations: self.number_of_iterations,
            stop_reason: StopReason::MaximumIterations(self.number_of_iterations),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corners() -> PhysicalShiftScales {
        let mut points = Vec::new();
        for &z in &[0.0, 10.0] {
            for &y in &[0.0, 10.0] {
                for &x in &[0.0, 10.0] {
                    points.push(Vector3::new(x, y, z));
                }
            }
        }
        PhysicalShiftScales::new(points)
    }

    #[test]
    fn test_translation_scales_are_one() {
        let scales = corners().estimate_scales(&Euler3D::identity());
        for s in &scales[3..] {
            assert!((s - 1.0).abs() < 1e-9);
        }
        // rotations move the far corners by about the corner radius
        for s in &scales[..3] {
            assert!(*s > 150.0 && *s < 250.0, "scale {}", s);
        }
    }

    #[test]
    fn test_convergence_window() {
        let mut window = ConvergenceWindow::new(4);
        for e in [-1.0, -1.0, -1.0] {
            window.push(e);
            assert!(window.value().is_none());
        }
        window.push(-1.0);
        assert!(window.value().unwrap().abs() < 1e-12);

        let mut improving = ConvergenceWindow::new(3);
        for e in [-0.1, -0.2, -0.3] {
            improving.push(e);
        }
        assert!(improving.value().unwrap() > 0.1);
    }

    #[test]
    fn test_gradient_descent_climbs_quadratic() {
        // mutual information stand-in peaking at tx = 2
        let evaluate = |t: &Euler3D| -> Result<Evaluation> {
            let tx = t.parameters()[3];
            let mut derivative = [0.0; PARAMETER_COUNT];
            derivative[3] = -2.0 * (tx - 2.0);
            Ok(Evaluation { value: (tx - 2.0).powi(2), derivative, valid_samples: 1 })
        };
        let optimizer = GradientDescent {
            learning_rate: 0.25,
            number_of_iterations: 50,
            convergence_minimum_value: 1e-6,
            convergence_window_size: 10,
            estimate_learning_rate: false,
            maximum_step_size: 1.0,
        };
        let outcome = optimizer.optimize(Euler3D::identity(), &corners(), evaluate).unwrap();
        assert!((outcome.transform.parameters()[3] - 2.0).abs() < 1e-3);
        assert!(matches!(outcome.stop_reason, StopReason::Converged { .. }));
    }

    #[test]
    fn test_estimated_first_step_is_one_spacing() {
        let evaluate = |_: &Euler3D| -> Result<Evaluation> {
            Ok(Evaluation { value: 0.0, derivative: [0.0, 0.0, 0.0, 3.0, 4.0, 0.0], valid_samples: 1 })
        };
        let optimizer = GradientDescent {
            learning_rate: 10.0,
            number_of_iterations: 1,
            convergence_minimum_value: 1e-6,
            convergence_window_size: 10,
            estimate_learning_rate: true,
            maximum_step_size: 0.5,
        };
        let outcome = optimizer.optimize(Euler3D::identity(), &corners(), evaluate).unwrap();
        let moved = outcome.transform.translation().norm();
        assert!((moved - 0.5).abs() < 1e-9, "moved {}", moved);
        assert_eq!(outcome.stop_reason, StopReason::MaximumIterations(1));
    }
}
