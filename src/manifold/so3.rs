//! SO(3) helpers: cross-product matrices, rotation updates and the
//! rotation-vector minimal parameterization.
//!
//! All rotation vectors here use the passive convention `C(p) = exp(−[p]×)`.

use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

/// Cross-product (skew-symmetric) matrix.
///
/// [v]ₓ = [0 -vz vy; vz 0 -vx; -vy vx 0]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Apply a passive left perturbation: `q ← exp(−[δ]×) · q`.
pub fn rotation_boxplus(q: &UnitQuaternion<f64>, delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(-delta) * q
}

/// Active axis-angle vector of a unit quaternion.
///
/// Uses `atan2` instead of `acos` so small angles keep full precision, which the
/// finite-difference checks on error terms rely on.
fn log_quaternion(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let q = q.quaternion();
    let sin_half_squared = q.i * q.i + q.j * q.j + q.k * q.k;

    let log_coeff = if sin_half_squared > f64::EPSILON {
        let sin_half = sin_half_squared.sqrt();
        let cos_half = q.w;
        // Keep the angle in [-π, π] regardless of the quaternion sign.
        let two_angle = 2.0
            * if cos_half < 0.0 {
                f64::atan2(-sin_half, -cos_half)
            } else {
                f64::atan2(sin_half, cos_half)
            };
        two_angle / sin_half
    } else {
        2.0 / q.w
    };

    Vector3::new(q.i * log_coeff, q.j * log_coeff, q.k * log_coeff)
}

/// Rotation-vector minimal parameterization of SO(3).
///
/// Stateless; every method is an associated function. The S-matrix maps a
/// parameter perturbation to the (passive, left) rotation perturbation:
/// `C(p + δp) ≈ exp(−[S(p)·δp]×) · C(p)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationVector;

impl RotationVector {
    /// `C(p) = exp(−[p]×)`
    pub fn parameters_to_rotation_matrix(p: &Vector3<f64>) -> Matrix3<f64> {
        Rotation3::new(-p).into_inner()
    }

    /// Inverse of [`parameters_to_rotation_matrix`](Self::parameters_to_rotation_matrix);
    /// the returned vector has norm in `[0, π]`.
    pub fn rotation_matrix_to_parameters(c: &Matrix3<f64>) -> Vector3<f64> {
        let rotation = Rotation3::from_matrix_unchecked(*c);
        -log_quaternion(&UnitQuaternion::from_rotation_matrix(&rotation))
    }

    pub fn quaternion_to_parameters(q: &UnitQuaternion<f64>) -> Vector3<f64> {
        -log_quaternion(q)
    }

    pub fn parameters_to_quaternion(p: &Vector3<f64>) -> UnitQuaternion<f64> {
        let theta_squared = p.norm_squared();
        if theta_squared > f64::EPSILON {
            UnitQuaternion::from_scaled_axis(-p)
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(1.0, -p.x / 2.0, -p.y / 2.0, -p.z / 2.0))
        }
    }

    /// S(p) = I − (1 − cos θ)/θ² [p]ₓ + (θ − sin θ)/θ³ [p]ₓ²
    pub fn parameters_to_s_matrix(p: &Vector3<f64>) -> Matrix3<f64> {
        let theta_squared = p.norm_squared();
        let p_skew = skew(p);

        if theta_squared <= f64::EPSILON {
            Matrix3::identity() - 0.5 * p_skew
        } else {
            let theta = theta_squared.sqrt();
            let (sin_theta, cos_theta) = theta.sin_cos();
            Matrix3::identity() - (1.0 - cos_theta) / theta_squared * p_skew
                + (theta - sin_theta) / (theta_squared * theta) * p_skew * p_skew
        }
    }

    /// Closed-form S(p)⁻¹ = I + ½[p]ₓ + (1/θ² − cot(θ/2)/(2θ)) [p]ₓ²
    ///
    /// Well defined for all θ in `[0, π]`.
    pub fn s_matrix_inverse(p: &Vector3<f64>) -> Matrix3<f64> {
        let theta_squared = p.norm_squared();
        let p_skew = skew(p);

        let coeff = if theta_squared <= 1e-8 {
            1.0 / 12.0 + theta_squared / 720.0
        } else {
            let theta = theta_squared.sqrt();
            let (sin_half, cos_half) = (0.5 * theta).sin_cos();
            1.0 / theta_squared - cos_half / (sin_half * 2.0 * theta)
        };

        Matrix3::identity() + 0.5 * p_skew + coeff * p_skew * p_skew
    }
}
