//! Rigid Euler 3-D transform.

use nalgebra::{Matrix3, SMatrix, Vector3};

pub const PARAMETER_COUNT: usize = 6;

/// Parameter vector `[angle_x, angle_y, angle_z, tx, ty, tz]` (radians, mm).
pub type Parameters = [f64; PARAMETER_COUNT];

/// Derivative of a mapped point with respect to each parameter.
pub type Jacobian = SMatrix<f64, 3, PARAMETER_COUNT>;

/// Rotation about a fixed center followed by a translation.
///
/// The rotation is applied about y first, then x, then z
/// (`R = Rz * Rx * Ry`), and maps fixed-space points into moving space.
#[derive(Debug, Clone, PartialEq)]
pub struct Euler3D {
    parameters: Parameters,
    center: Vector3<f64>,
}

fn rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

fn rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

fn rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn d_rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(0.0, 0.0, 0.0, 0.0, -s, -c, 0.0, c, -s)
}

fn d_rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, 0.0, c, 0.0, 0.0, 0.0, -c, 0.0, -s)
}

fn d_rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, -c, 0.0, c, -s, 0.0, 0.0, 0.0, 0.0)
}

impl Default for Euler3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Euler3D {
    pub fn identity() -> Self {
        Self { parameters: [0.0; PARAMETER_COUNT], center: Vector3::zeros() }
    }

    pub fn with_parameters(parameters: Parameters) -> Self {
        Self { parameters, center: Vector3::zeros() }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: Parameters) {
        self.parameters = parameters;
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        let [ax, ay, az, ..] = self.parameters;
        rot_z(az) * rot_x(ax) * rot_y(ay)
    }

    pub fn translation(&self) -> Vector3<f64> {
        let [_, _, _, tx, ty, tz] = self.parameters;
        Vector3::new(tx, ty, tz)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * (point - self.center) + self.center + self.translation()
    }

    /// Jacobian of `transform_point` at `point`.
    pub fn jacobian(&self, point: &Vector3<f64>) -> Jacobian {
        let [ax, ay, az, ..] = self.parameters;
        let (rx, ry, rz) = (rot_x(ax), rot_y(ay), rot_z(az));
        let p = point - self.center;

        let mut jacobian = Jacobian::zeros();
        jacobian.set_column(0, &(rz * d_rot_x(ax) * ry * p));
        jacobian.set_column(1, &(rz * rx * d_rot_y(ay) * p));
        jacobian.set_column(2, &(d_rot_z(az) * rx * ry * p));
        jacobian.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
        jacobian
    }
}
