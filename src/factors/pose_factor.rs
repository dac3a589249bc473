//! Pose error term: compares a predicted rigid-body transform with a measured pose.
//!
//! # Residual
//!
//! ```text
//! r[0..3] = t_pred − t_meas
//! r[3..6] = p(C_pred · C_measᵀ)
//! ```
//!
//! where `p(·)` is the rotation-vector parameterization. The rotational part
//! has three components, one per rotational degree of freedom.
//!
//! # Jacobian
//!
//! With respect to a left perturbation `δ = [δρ; δφ]` of the predicted transform:
//!
//! ```text
//! J = [ I   [t_pred]ₓ ]
//!     [ 0   S(p)⁻¹    ]
//! ```
//!
//! which the transform expression then distributes over its variables.

use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Matrix6, SVector, SymmetricEigen, UnitQuaternion,
    Vector3,
};

use crate::core::error_term::{ErrorTerm, sqrt_information};
use crate::core::expression::TransformExpression;
use crate::core::jacobian::JacobianContainer;
use crate::core::variable::{VariableId, VariableStore};
use crate::error::{CalibError, CalibResult};
use crate::manifold::{RotationVector, skew};

/// A measured pose with optional covariance blocks.
///
/// A block whose `(0, 0)` entry is zero means "not available".
#[derive(Debug, Clone, PartialEq)]
pub struct PoseMeasurement {
    pub t: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub cov_t: Matrix3<f64>,
    pub cov_r: Matrix3<f64>,
}

impl PoseMeasurement {
    /// Measurement without covariance information.
    pub fn new(t: Vector3<f64>, q: UnitQuaternion<f64>) -> Self {
        Self {
            t,
            q,
            cov_t: Matrix3::zeros(),
            cov_r: Matrix3::zeros(),
        }
    }

    pub fn with_covariances(mut self, cov_t: Matrix3<f64>, cov_r: Matrix3<f64>) -> Self {
        self.cov_t = cov_t;
        self.cov_r = cov_r;
        self
    }

    pub fn from_isometry(pose: &Isometry3<f64>) -> Self {
        Self::new(pose.translation.vector, pose.rotation)
    }
}

#[derive(Debug, Clone)]
pub struct PoseErrorTerm {
    expression: TransformExpression,
    variables: Vec<VariableId>,
    t_meas: Vector3<f64>,
    q_meas: UnitQuaternion<f64>,
    c_meas: Matrix3<f64>,
    information: DMatrix<f64>,
    sqrt_information: DMatrix<f64>,
    group: String,
}

impl PoseErrorTerm {
    /// Weighted by the inverse of a 6×6 covariance ordered `[translation; rotation]`.
    ///
    /// A covariance with `Q[(0, 0)] == 0.0` is replaced by the identity. Any
    /// other covariance must be symmetric positive definite.
    pub fn new(
        expression: TransformExpression,
        t: Vector3<f64>,
        q: UnitQuaternion<f64>,
        covariance: Matrix6<f64>,
    ) -> CalibResult<Self> {
        if covariance[(0, 0)] == 0.0 {
            return Self::with_information(expression, t, q, Matrix6::identity());
        }
        let (information, sqrt_information) = weights_from_covariance(&covariance)?;
        Ok(Self::from_weights(expression, t, q, information, sqrt_information))
    }

    /// Weighted by the inverse of `blockdiag(cov_t, cov_r)`.
    pub fn with_covariance_blocks(
        expression: TransformExpression,
        t: Vector3<f64>,
        q: UnitQuaternion<f64>,
        cov_t: Matrix3<f64>,
        cov_r: Matrix3<f64>,
    ) -> CalibResult<Self> {
        let mut covariance = Matrix6::zeros();
        covariance.fixed_view_mut::<3, 3>(0, 0).copy_from(&cov_t);
        covariance.fixed_view_mut::<3, 3>(3, 3).copy_from(&cov_r);
        Self::new(expression, t, q, covariance)
    }

    pub fn from_measurement(
        expression: TransformExpression,
        measurement: &PoseMeasurement,
    ) -> CalibResult<Self> {
        Self::with_covariance_blocks(
            expression,
            measurement.t,
            measurement.q,
            measurement.cov_t,
            measurement.cov_r,
        )
    }

    /// Weighted directly by a 6×6 information matrix; no inversion takes place.
    ///
    /// `information` must be symmetric positive semi-definite.
    pub fn with_information(
        expression: TransformExpression,
        t: Vector3<f64>,
        q: UnitQuaternion<f64>,
        information: Matrix6<f64>,
    ) -> CalibResult<Self> {
        let information = symmetrized(&information, "information")?;
        let information = DMatrix::from_column_slice(6, 6, information.as_slice());
        let sqrt_information = sqrt_information(&information)?;
        Ok(Self::from_weights(expression, t, q, information, sqrt_information))
    }

    fn from_weights(
        expression: TransformExpression,
        t: Vector3<f64>,
        q: UnitQuaternion<f64>,
        information: DMatrix<f64>,
        sqrt_information: DMatrix<f64>,
    ) -> Self {
        let variables = expression.design_variables();
        Self {
            expression,
            variables,
            t_meas: t,
            q_meas: q,
            c_meas: q.to_rotation_matrix().into_inner(),
            information,
            sqrt_information,
            group: "pose".to_string(),
        }
    }

    /// Label the term for the per-group cost breakdown.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn expression(&self) -> &TransformExpression {
        &self.expression
    }

    /// `[tx, ty, tz, qx, qy, qz, qw]` of the predicted transform.
    pub fn prediction(&self, store: &VariableStore) -> CalibResult<SVector<f64, 7>> {
        let predicted = self.expression.evaluate(store)?;
        Ok(pose_to_vector(
            &predicted.translation.vector,
            &predicted.rotation,
        ))
    }

    /// `[tx, ty, tz, qx, qy, qz, qw]` of the measurement.
    pub fn measurement(&self) -> SVector<f64, 7> {
        pose_to_vector(&self.t_meas, &self.q_meas)
    }

    fn rotation_residual(&self, predicted: &Isometry3<f64>) -> Vector3<f64> {
        let c_pred = predicted.rotation.to_rotation_matrix().into_inner();
        RotationVector::rotation_matrix_to_parameters(&(c_pred * self.c_meas.transpose()))
    }
}

/// Largest tolerated asymmetry, relative to the largest entry.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Average `m` with its transpose after checking it is symmetric up to round-off.
fn symmetrized(m: &Matrix6<f64>, what: &str) -> CalibResult<Matrix6<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(CalibError::SingularCovariance(format!(
            "pose {what} has non-finite entries: {m}"
        )));
    }
    let asymmetry = (m - m.transpose()).amax();
    if asymmetry > SYMMETRY_TOLERANCE * m.amax() {
        return Err(CalibError::SingularCovariance(format!(
            "pose {what} is not symmetric (asymmetry {asymmetry:.3e})"
        )));
    }
    Ok((m + m.transpose()) * 0.5)
}

/// `W = V Λ⁻¹ Vᵀ` and `U = Λ^-½ Vᵀ` from one eigen decomposition `Q = V Λ Vᵀ`.
fn weights_from_covariance(
    covariance: &Matrix6<f64>,
) -> CalibResult<(DMatrix<f64>, DMatrix<f64>)> {
    let covariance = symmetrized(covariance, "covariance")?;
    let eigen = SymmetricEigen::new(covariance);
    if let Some(lambda) = eigen
        .eigenvalues
        .iter()
        .find(|lambda| !lambda.is_finite() || **lambda <= 0.0) {
        return Err(CalibError::SingularCovariance(format!(
            "pose covariance is not positive definite (eigenvalue {lambda:.3e}): {covariance}"
        )));
    }

    let inverse = eigen.eigenvalues.map(|lambda| 1.0 / lambda);
    let v = &eigen.eigenvectors;
    let information = v * Matrix6::from_diagonal(&inverse) * v.transpose();
    let sqrt_information = Matrix6::from_diagonal(&inverse.map(f64::sqrt)) * v.transpose();
    if information.iter().any(|w| !w.is_finite()) {
        return Err(CalibError::SingularCovariance(format!(
            "pose covariance is not invertible: {covariance}"
        )));
    }
    Ok((
        DMatrix::from_column_slice(6, 6, information.as_slice()),
        DMatrix::from_column_slice(6, 6, sqrt_information.as_slice()),
    ))
}

fn pose_to_vector(t: &Vector3<f64>, q: &UnitQuaternion<f64>) -> SVector<f64, 7> {
    SVector::<f64, 7>::from_column_slice(&[t.x, t.y, t.z, q.i, q.j, q.k, q.w])
}

impl ErrorTerm for PoseErrorTerm {
    fn dimension(&self) -> usize {
        6
    }

    fn design_variables(&self) -> Vec<VariableId> {
        self.variables.clone()
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    fn evaluate_error(&self, store: &VariableStore) -> CalibResult<DVector<f64>> {
        let predicted = self.expression.evaluate(store)?;
        let translation = predicted.translation.vector - self.t_meas;
        let rotation = self.rotation_residual(&predicted);
        Ok(DVector::from_column_slice(&[
            translation.x,
            translation.y,
            translation.z,
            rotation.x,
            rotation.y,
            rotation.z,
        ]))
    }

    fn evaluate_jacobians(
        &self,
        store: &VariableStore,
        container: &mut JacobianContainer,
    ) -> CalibResult<()> {
        let predicted = self.expression.evaluate(store)?;
        let p = self.rotation_residual(&predicted);

        let mut local = DMatrix::identity(6, 6);
        local
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&skew(&predicted.translation.vector));
        local
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&RotationVector::s_matrix_inverse(&p));

        self.expression.evaluate_jacobians(store, &local, container)
    }

    fn name(&self) -> &str {
        "pose"
    }

    fn group(&self) -> &str {
        &self.group
    }
}
