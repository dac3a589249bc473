use std::fmt;

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use super::jacobian::JacobianContainer;
use super::variable::{VariableId, VariableStore};
use crate::error::{CalibError, CalibResult};

/// A weighted residual over a fixed, ordered set of design variables.
///
/// Implementors recompute the residual from the current values in the store on
/// every call. The cost contribution is `rᵀ W r`.
pub trait ErrorTerm: fmt::Debug + Send + Sync {
    /// Residual length `k`; constant for the lifetime of the term.
    fn dimension(&self) -> usize;

    /// Variables the residual depends on.
    fn design_variables(&self) -> Vec<VariableId>;

    /// `k × k` symmetric positive semi-definite information matrix `W`.
    fn information(&self) -> &DMatrix<f64>;

    /// `U` with `UᵀU = W`, used to whiten residuals and Jacobians.
    fn sqrt_information(&self) -> &DMatrix<f64>;

    fn evaluate_error(&self, store: &VariableStore) -> CalibResult<DVector<f64>>;

    /// Unwhitened `∂r/∂δ` blocks, one per contributing variable.
    fn evaluate_jacobians(
        &self,
        store: &VariableStore,
        container: &mut JacobianContainer,
    ) -> CalibResult<()>;

    fn weighted_squared_error(&self, store: &VariableStore) -> CalibResult<f64> {
        let r = self.evaluate_error(store)?;
        Ok(r.dot(&(self.information() * &r)))
    }

    /// Short label used in diagnostics.
    fn name(&self) -> &str {
        "error term"
    }

    /// Group used for the per-group cost breakdown.
    fn group(&self) -> &str {
        self.name()
    }
}

/// Relative size below which a negative eigenvalue counts as round-off.
const EIGENVALUE_TOLERANCE: f64 = 1e-12;

/// Square root of a symmetric PSD matrix: `U = Λ^½ Vᵀ` so that `UᵀU = W`.
///
/// Tiny negative eigenvalues from round-off are clamped to zero. An indefinite
/// matrix has no real square root and is rejected.
pub fn sqrt_information(information: &DMatrix<f64>) -> CalibResult<DMatrix<f64>> {
    let eigen = SymmetricEigen::new(information.clone());
    let floor = -EIGENVALUE_TOLERANCE * eigen.eigenvalues.amax();
    if let Some(lambda) = eigen
        .eigenvalues
        .iter()
        .find(|lambda| !lambda.is_finite() || **lambda < floor)
    {
        return Err(CalibError::SingularCovariance(format!(
            "information matrix is not positive semi-definite (eigenvalue {lambda:.3e})"
        )));
    }
    let sqrt_values = eigen.eigenvalues.map(|lambda| lambda.max(0.0).sqrt());
    Ok(DMatrix::from_diagonal(&sqrt_values) * eigen.eigenvectors.transpose())
}

/// Whitened residual and Jacobian of one error term at the current values.
#[derive(Debug, Clone)]
pub struct LinearizedTerm {
    pub residual: DVector<f64>,
    pub jacobians: JacobianContainer,
    /// `rᵀ W r` before whitening, equal to `‖U r‖²`.
    pub cost: f64,
}

/// Evaluate and whiten one error term.
pub fn linearize(term: &dyn ErrorTerm, store: &VariableStore) -> CalibResult<LinearizedTerm> {
    let raw = term.evaluate_error(store)?;
    let mut jacobians = JacobianContainer::new(term.dimension());
    term.evaluate_jacobians(store, &mut jacobians)?;

    let sqrt_info = term.sqrt_information();
    let residual = sqrt_info * raw;
    jacobians.premultiply(sqrt_info);
    let cost = residual.norm_squared();

    Ok(LinearizedTerm {
        residual,
        jacobians,
        cost,
    })
}
