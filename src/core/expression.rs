//! Predicted rigid-body transforms as expressions over design variables.
//!
//! An expression is evaluated against a [`VariableStore`] and can push a
//! chain-rule Jacobian down to its leaves. Jacobians are with respect to the
//! left pose perturbation `T ← ΔT(δ) ∘ T` with `δ = [δρ; δφ]`, see
//! [`crate::manifold`].

use nalgebra::{DMatrix, Isometry3, Matrix6, Translation3, UnitQuaternion, Vector3};

use super::jacobian::JacobianContainer;
use super::variable::{VariableId, VariableStore};
use crate::error::{CalibError, CalibResult};
use crate::manifold::adjoint;

#[derive(Debug, Clone, PartialEq)]
pub enum TransformExpression {
    /// Fixed transform, contributes no Jacobian.
    Constant(Isometry3<f64>),
    /// A pose variable.
    Pose(VariableId),
    /// A 3-vector Euclidean variable used as a pure translation.
    Translation(VariableId),
    /// A rotation variable used as a pure rotation.
    Rotation(VariableId),
    /// `lhs ∘ rhs`
    Compose(Box<TransformExpression>, Box<TransformExpression>),
    /// `inner⁻¹`
    Inverse(Box<TransformExpression>),
}

impl TransformExpression {
    pub fn constant(transform: Isometry3<f64>) -> Self {
        TransformExpression::Constant(transform)
    }

    pub fn pose(id: VariableId) -> Self {
        TransformExpression::Pose(id)
    }

    pub fn translation(id: VariableId) -> Self {
        TransformExpression::Translation(id)
    }

    pub fn rotation(id: VariableId) -> Self {
        TransformExpression::Rotation(id)
    }

    /// `self ∘ rhs`
    pub fn compose(self, rhs: TransformExpression) -> Self {
        TransformExpression::Compose(Box::new(self), Box::new(rhs))
    }

    pub fn inverse(self) -> Self {
        TransformExpression::Inverse(Box::new(self))
    }

    pub fn evaluate(&self, store: &VariableStore) -> CalibResult<Isometry3<f64>> {
        match self {
            TransformExpression::Constant(t) => Ok(*t),
            TransformExpression::Pose(id) => store.pose(*id),
            TransformExpression::Translation(id) => {
                let v = store.vector(*id)?;
                if v.len() != 3 {
                    return Err(CalibError::InvalidInput(format!(
                        "translation variable {id} has dimension {}, expected 3",
                        v.len()
                    )));
                }
                Ok(Isometry3::from_parts(
                    Translation3::from(Vector3::new(v[0], v[1], v[2])),
                    UnitQuaternion::identity(),
                ))
            }
            TransformExpression::Rotation(id) => Ok(Isometry3::from_parts(
                Translation3::identity(),
                store.rotation(*id)?,
            )),
            TransformExpression::Compose(lhs, rhs) => {
                Ok(lhs.evaluate(store)? * rhs.evaluate(store)?)
            }
            TransformExpression::Inverse(inner) => Ok(inner.evaluate(store)?.inverse()),
        }
    }

    /// Distinct variables referenced by the expression, in first-appearance order.
    pub fn design_variables(&self) -> Vec<VariableId> {
        let mut ids = Vec::new();
        self.collect_variables(&mut ids);
        ids
    }

    fn collect_variables(&self, ids: &mut Vec<VariableId>) {
        match self {
            TransformExpression::Constant(_) => {}
            TransformExpression::Pose(id)
            | TransformExpression::Translation(id)
            | TransformExpression::Rotation(id) => {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
            TransformExpression::Compose(lhs, rhs) => {
                lhs.collect_variables(ids);
                rhs.collect_variables(ids);
            }
            TransformExpression::Inverse(inner) => inner.collect_variables(ids),
        }
    }

    /// Propagate `chain` (`k × 6`, derivative of the error with respect to a
    /// perturbation of this transform) to the leaves and accumulate one
    /// `k × d` block per variable into `container`.
    pub fn evaluate_jacobians(
        &self,
        store: &VariableStore,
        chain: &DMatrix<f64>,
        container: &mut JacobianContainer,
    ) -> CalibResult<()> {
        match self {
            TransformExpression::Constant(_) => Ok(()),
            TransformExpression::Pose(id) => {
                container.add(*id, chain.as_view());
                Ok(())
            }
            TransformExpression::Translation(id) => {
                container.add(*id, chain.columns(0, 3));
                Ok(())
            }
            TransformExpression::Rotation(id) => {
                container.add(*id, chain.columns(3, 3));
                Ok(())
            }
            TransformExpression::Compose(lhs, rhs) => {
                // A perturbation of rhs reaches the product through Ad(lhs).
                let lhs_value = lhs.evaluate(store)?;
                lhs.evaluate_jacobians(store, chain, container)?;
                let rhs_chain = chain * to_dynamic(&adjoint(&lhs_value));
                rhs.evaluate_jacobians(store, &rhs_chain, container)
            }
            TransformExpression::Inverse(inner) => {
                // δ(A⁻¹) = −Ad(A⁻¹) δA
                let value = inner.evaluate(store)?.inverse();
                let inner_chain = -(chain * to_dynamic(&adjoint(&value)));
                inner.evaluate_jacobians(store, &inner_chain, container)
            }
        }
    }
}

fn to_dynamic(m: &Matrix6<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(6, 6, m.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable::{DesignVariable, VariableValue};
    use crate::manifold::se3::pose_boxminus;
    use nalgebra::{DVector, dvector};

    const EPS: f64 = 1e-6;
    const TOLERANCE: f64 = 1e-6;

    struct Fixture {
        store: VariableStore,
        pose: VariableId,
        offset: VariableId,
        rotation: VariableId,
    }

    fn fixture() -> Fixture {
        let mut store = VariableStore::new();
        let pose = store.add(DesignVariable::state(
            "T_w_b",
            VariableValue::Pose(Isometry3::from_parts(
                Translation3::new(1.0, -0.5, 2.0),
                UnitQuaternion::from_euler_angles(0.3, -0.1, 0.7),
            )),
        ));
        let offset = store.add(DesignVariable::calibration(
            "t_b_s",
            VariableValue::Euclidean(dvector![0.2, 0.1, -0.3]),
        ));
        let rotation = store.add(DesignVariable::calibration(
            "C_b_s",
            VariableValue::Rotation(UnitQuaternion::from_euler_angles(-0.2, 0.4, 0.1)),
        ));
        Fixture {
            store,
            pose,
            offset,
            rotation,
        }
    }

    fn numeric_jacobian(
        expr: &TransformExpression,
        store: &VariableStore,
        id: VariableId,
    ) -> CalibResult<DMatrix<f64>> {
        let reference = expr.evaluate(store)?;
        let mut jacobian = DMatrix::zeros(6, id.dimension());
        for j in 0..id.dimension() {
            let mut delta = DVector::zeros(id.dimension());
            delta[j] = EPS;

            let mut plus = store.clone();
            if let Some(v) = plus.get_mut(id) {
                v.update(delta.as_view());
            }
            let mut minus = store.clone();
            if let Some(v) = minus.get_mut(id) {
                v.update((-&delta).as_view());
            }

            let d_plus = pose_boxminus(&expr.evaluate(&plus)?, &reference);
            let d_minus = pose_boxminus(&expr.evaluate(&minus)?, &reference);
            jacobian
                .column_mut(j)
                .copy_from(&((d_plus - d_minus) / (2.0 * EPS)));
        }
        Ok(jacobian)
    }

    #[test]
    fn test_design_variables_are_distinct() {
        let f = fixture();
        let expr = TransformExpression::pose(f.pose)
            .compose(TransformExpression::pose(f.pose).inverse())
            .compose(TransformExpression::translation(f.offset));
        assert_eq!(expr.design_variables(), vec![f.pose, f.offset]);
    }

    #[test]
    fn test_translation_rotation_compose() -> CalibResult<()> {
        let f = fixture();
        let expr = TransformExpression::translation(f.offset)
            .compose(TransformExpression::rotation(f.rotation));
        let value = expr.evaluate(&f.store)?;
        assert!((value.translation.vector - Vector3::new(0.2, 0.1, -0.3)).norm() < 1e-12);
        assert!(value.rotation.angle_to(&f.store.rotation(f.rotation)?) < 1e-12);
        Ok(())
    }

    #[test]
    fn test_analytic_matches_numeric_jacobian() -> CalibResult<()> {
        let f = fixture();
        // T_w_b ∘ (t_b_s ∘ C_b_s)⁻¹ ∘ T_const
        let expr = TransformExpression::pose(f.pose)
            .compose(
                TransformExpression::translation(f.offset)
                    .compose(TransformExpression::rotation(f.rotation))
                    .inverse(),
            )
            .compose(TransformExpression::constant(Isometry3::from_parts(
                Translation3::new(0.0, 0.3, 0.1),
                UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            )));

        let mut container = JacobianContainer::new(6);
        expr.evaluate_jacobians(&f.store, &DMatrix::identity(6, 6), &mut container)?;
        assert_eq!(container.len(), 3);

        for id in [f.pose, f.offset, f.rotation] {
            let analytic = container
                .get(id)
                .ok_or_else(|| CalibError::InvalidInput(format!("missing block {id}")))?;
            let numeric = numeric_jacobian(&expr, &f.store, id)?;
            assert!(
                (analytic - &numeric).norm() < TOLERANCE,
                "variable {id}: analytic {analytic} numeric {numeric}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_repeated_variable_accumulates() -> CalibResult<()> {
        let f = fixture();
        // T ∘ T⁻¹ is constant, so the accumulated block vanishes.
        let expr = TransformExpression::pose(f.pose)
            .compose(TransformExpression::pose(f.pose).inverse());
        let mut container = JacobianContainer::new(6);
        expr.evaluate_jacobians(&f.store, &DMatrix::identity(6, 6), &mut container)?;
        let block = container
            .get(f.pose)
            .ok_or_else(|| CalibError::InvalidInput("missing block".to_string()))?;
        assert!(block.norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_wrong_kind_is_reported() {
        let f = fixture();
        let expr = TransformExpression::pose(f.offset);
        assert!(matches!(
            expr.evaluate(&f.store),
            Err(CalibError::InvalidInput(_))
        ));
    }
}
