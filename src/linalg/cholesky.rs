use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::{Mat, Side};

use super::{FaerMatrix, LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix};

/// Sparse LLᵀ solver for the damped normal equations.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    gradient: Option<FaerMatrix>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(JᵀJ, −Jᵀr)`
    fn normal_terms(
        residuals: &FaerMatrix,
        jacobian: &SparseMatrix,
    ) -> LinAlgResult<(SparseMatrix, FaerMatrix)> {
        if residuals.nrows() != jacobian.nrows() {
            return Err(LinAlgError::InvalidMatrix(format!(
                "residual length {} does not match Jacobian rows {}",
                residuals.nrows(),
                jacobian.nrows()
            )));
        }

        let jacobian_t = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::InvalidMatrix(format!("transpose failed: {e:?}")))?;
        let hessian = jacobian_t.as_ref().mul(jacobian.as_ref());
        let gradient = jacobian_t.as_ref().mul(-residuals);
        Ok((hessian, gradient))
    }

    fn factorize_and_solve(
        symbolic: solvers::SymbolicLlt<usize>,
        matrix: &SparseMatrix,
        rhs: &FaerMatrix,
    ) -> LinAlgResult<FaerMatrix> {
        let cholesky = solvers::Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        let dx: Mat<f64> = cholesky.solve(rhs);
        if (0..dx.nrows()).any(|i| !dx[(i, 0)].is_finite()) {
            return Err(LinAlgError::SolveFailed("non-finite solution".to_string()));
        }
        Ok(dx)
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobian: &SparseMatrix,
        lambda: f64,
    ) -> LinAlgResult<FaerMatrix> {
        let n = jacobian.ncols();
        let (hessian, gradient) = Self::normal_terms(residuals, jacobian)?;

        // H_aug = H + lambda * I
        let lambda_i = super::scaled_identity(n, lambda)?;
        let augmented_hessian = &hessian + &lambda_i;

        // The diagonal makes the augmented pattern differ from JᵀJ, so it is analyzed fresh.
        let sym = solvers::SymbolicLlt::try_new(augmented_hessian.symbolic(), Side::Lower)
            .map_err(|e| LinAlgError::SolveFailed(format!("symbolic analysis: {e:?}")))?;

        let dx = Self::factorize_and_solve(sym, &augmented_hessian, &gradient);
        self.gradient = Some(gradient);
        dx
    }

    fn gradient(&self) -> Option<&FaerMatrix> {
        self.gradient.as_ref()
    }
}
