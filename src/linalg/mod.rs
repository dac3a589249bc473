//! Sparse linear algebra for the normal equations.
//!
//! The optimizer assembles the whitened Jacobian `J` as a faer
//! [`SparseColMat`] and solves `(JᵀJ + λI) δ = −Jᵀr` with a sparse Cholesky
//! factorization. Dense per-term blocks stay in nalgebra.

use faer::sparse::{SparseColMat, Triplet};
use thiserror::Error;

pub mod cholesky;

pub use cholesky::SparseCholeskySolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = SparseColMat<usize, f64>;

/// Type alias for faer matrices (used for vectors)
pub type FaerMatrix = faer::Mat<f64>;

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Errors raised by the sparse linear solvers
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Cholesky factorization failed (matrix not positive definite)
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// Symbolic analysis or triangular solve failed
    #[error("Solve failed: {0}")]
    SolveFailed(String),

    /// Malformed matrix input (bad triplets, dimension mismatch)
    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),
}

/// Solver for the damped normal equations of a least-squares problem.
pub trait SparseLinearSolver: Send {
    /// Solve `(JᵀJ + λI) δ = −Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobian: &SparseMatrix,
        lambda: f64,
    ) -> LinAlgResult<FaerMatrix>;

    /// `−Jᵀr` from the most recent solve.
    fn gradient(&self) -> Option<&FaerMatrix>;
}

/// Create sparse matrix from triplets using faer
pub fn sparse_from_triplets(
    rows: usize,
    cols: usize,
    triplets: &[Triplet<usize, usize, f64>],
) -> LinAlgResult<SparseMatrix> {
    SparseColMat::try_new_from_triplets(rows, cols, triplets)
        .map_err(|e| LinAlgError::InvalidMatrix(format!("Failed to create sparse matrix: {e:?}")))
}

/// Sparse `λI` of size `n`.
pub fn scaled_identity(n: usize, lambda: f64) -> LinAlgResult<SparseMatrix> {
    let triplets: Vec<_> = (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
    sparse_from_triplets(n, n, &triplets)
}
