//! Local parameterizations of the stored design-variable representations.
//!
//! Kind        | stored              | dof | update (δ local)
//! ----------- | ------------------- | --- | --------------------------------------
//! Euclidean   | v ∈ Rⁿ              | n   | v + δ
//! Rotation    | q ∈ S³ (unit quat.) | 3   | exp(−[δ]×) · C
//! Pose        | T = (C, t) ∈ SE(3)  | 6   | ΔT(δ) ∘ T,  ΔT = (exp(−[δφ]×), δρ)
//!
//! Rotations are perturbed passively from the left. Rotation vectors follow the
//! same convention, `C(p) = exp(−[p]×)`, which keeps the S-matrix of
//! [`so3::RotationVector`] consistent with the pose perturbation used by
//! [`crate::core::expression::TransformExpression`].

use nalgebra::{DVector, DVectorView, Isometry3, UnitQuaternion};

pub mod se3;
pub mod so3;

pub use se3::{adjoint, pose_boxplus};
pub use so3::{RotationVector, rotation_boxplus, skew};

/// Update rule of a stored value under a minimal local perturbation.
pub trait LocalParameterization: Clone {
    /// Number of local degrees of freedom.
    fn local_dimension(&self) -> usize;

    /// Apply a local perturbation of size [`local_dimension`](Self::local_dimension).
    fn boxplus(&self, delta: DVectorView<f64>) -> Self;
}

impl LocalParameterization for DVector<f64> {
    fn local_dimension(&self) -> usize {
        self.len()
    }

    fn boxplus(&self, delta: DVectorView<f64>) -> Self {
        self + delta
    }
}

impl LocalParameterization for UnitQuaternion<f64> {
    fn local_dimension(&self) -> usize {
        3
    }

    fn boxplus(&self, delta: DVectorView<f64>) -> Self {
        rotation_boxplus(self, &delta.fixed_rows::<3>(0).into_owned())
    }
}

impl LocalParameterization for Isometry3<f64> {
    fn local_dimension(&self) -> usize {
        6
    }

    fn boxplus(&self, delta: DVectorView<f64>) -> Self {
        pose_boxplus(self, &delta.fixed_rows::<6>(0).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, Vector3, dvector};

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_euclidean_boxplus_is_addition() {
        let v = dvector![1.0, 2.0, 3.0];
        let updated = v.boxplus(dvector![0.5, -1.0, 0.0].as_view());
        assert_eq!(updated, dvector![1.5, 1.0, 3.0]);
        assert_eq!(updated.local_dimension(), 3);
    }

    #[test]
    fn test_zero_update_keeps_value() {
        let q = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let q2 = q.boxplus(DVector::zeros(3).as_view());
        assert!(q.angle_to(&q2) < TOLERANCE);

        let pose = Isometry3::from_parts(Translation3::new(1.0, 2.0, 3.0), q);
        let pose2 = pose.boxplus(DVector::zeros(6).as_view());
        assert!((pose.translation.vector - pose2.translation.vector).norm() < TOLERANCE);
        assert!(pose.rotation.angle_to(&pose2.rotation) < TOLERANCE);
    }

    #[test]
    fn test_rotation_update_is_passive_left() {
        let q = UnitQuaternion::identity();
        let updated = q.boxplus(dvector![0.0, 0.0, 0.1].as_view());
        let expected = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, -0.1));
        assert!(updated.angle_to(&expected) < TOLERANCE);
    }
}
