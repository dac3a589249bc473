//! SE(3) perturbation helpers.
//!
//! A pose `T = (C, t)` is perturbed from the left by `δ = [δρ; δφ]`:
//! `T ← ΔT(δ) ∘ T` with `ΔT = (exp(−[δφ]×), δρ)`. To first order this gives
//! `t ← t + δρ + [t]ₓ δφ` and `C ← (I − [δφ]ₓ) C`.

use nalgebra::{Isometry3, Matrix6, Translation3, UnitQuaternion, Vector6};

use super::so3::skew;

/// `ΔT(δ) ∘ T`
pub fn pose_boxplus(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let delta_pose = Isometry3::from_parts(
        Translation3::new(delta[0], delta[1], delta[2]),
        UnitQuaternion::from_scaled_axis(-delta.fixed_rows::<3>(3)),
    );
    delta_pose * pose
}

/// Adjoint of `T` for the left perturbation above.
///
/// If `B` is perturbed by `δ_B`, then `A ∘ B` is perturbed by `Ad(A) δ_B`:
///
/// ```text
/// Ad(A) = [ C   −[t]ₓ C ]
///         [ 0      C    ]
/// ```
pub fn adjoint(pose: &Isometry3<f64>) -> Matrix6<f64> {
    let rotation = pose.rotation.to_rotation_matrix().into_inner();
    let mut adj = Matrix6::zeros();
    adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    adj.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-skew(&pose.translation.vector) * rotation));
    adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&rotation);
    adj
}

/// Local-tangent difference `δ` with `ΔT(δ) ∘ reference ≈ pose`, exact in rotation.
pub fn pose_boxminus(pose: &Isometry3<f64>, reference: &Isometry3<f64>) -> Vector6<f64> {
    // ΔT = pose ∘ reference⁻¹ = (exp(−[δφ]×), δρ)
    let delta_pose = pose * reference.inverse();
    let phi = super::so3::RotationVector::quaternion_to_parameters(&delta_pose.rotation);
    let mut delta = Vector6::zeros();
    delta
        .fixed_rows_mut::<3>(0)
        .copy_from(&delta_pose.translation.vector);
    delta.fixed_rows_mut::<3>(3).copy_from(&phi);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    const TOLERANCE: f64 = 1e-9;

    fn sample_pose() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.5, -1.0, 2.0),
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.9),
        )
    }

    #[test]
    fn test_boxplus_first_order_translation() {
        let pose = sample_pose();
        let mut delta = Vector6::zeros();
        delta[3] = 1e-7;
        delta[4] = -2e-7;
        let updated = pose_boxplus(&pose, &delta);
        let phi = Vector3::new(1e-7, -2e-7, 0.0);
        let expected = pose.translation.vector + skew(&pose.translation.vector) * phi;
        assert!((updated.translation.vector - expected).norm() < 1e-12);
    }

    #[test]
    fn test_adjoint_moves_perturbation_through_composition() {
        let a = sample_pose();
        let b = Isometry3::from_parts(
            Translation3::new(-0.3, 0.2, 0.1),
            UnitQuaternion::from_euler_angles(-0.5, 0.4, 0.1),
        );
        let delta_b = Vector6::new(1e-6, -2e-6, 0.5e-6, 2e-6, 1e-6, -1e-6);

        let perturbed = a * pose_boxplus(&b, &delta_b);
        let delta_t = pose_boxminus(&perturbed, &(a * b));
        assert!((delta_t - adjoint(&a) * delta_b).norm() < TOLERANCE);
    }

    #[test]
    fn test_boxminus_inverts_boxplus() {
        let pose = sample_pose();
        let delta = Vector6::new(0.1, -0.2, 0.3, 0.05, -0.1, 0.2);
        let recovered = pose_boxminus(&pose_boxplus(&pose, &delta), &pose);
        assert!((recovered - delta).norm() < TOLERANCE);
    }
}
