use std::collections::BTreeMap;

use nalgebra::{DMatrix, DMatrixView};

use super::variable::VariableId;

/// Per-variable Jacobian blocks of one error term.
///
/// Every block has the error term's row count. Adding to an existing key
/// accumulates, which is how a variable that appears several times in an
/// expression receives the sum of its contributions. Iteration order is the
/// variable order, so merging into the global Jacobian is deterministic.
#[derive(Debug, Clone)]
pub struct JacobianContainer {
    rows: usize,
    blocks: BTreeMap<VariableId, DMatrix<f64>>,
}

impl JacobianContainer {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            blocks: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Accumulate a `rows × id.dimension()` block.
    pub fn add(&mut self, id: VariableId, block: DMatrixView<f64>) {
        debug_assert_eq!(block.nrows(), self.rows);
        debug_assert_eq!(block.ncols(), id.dimension());
        match self.blocks.get_mut(&id) {
            Some(existing) => *existing += block,
            None => {
                self.blocks.insert(id, block.into_owned());
            }
        }
    }

    pub fn get(&self, id: VariableId) -> Option<&DMatrix<f64>> {
        self.blocks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VariableId, &DMatrix<f64>)> {
        self.blocks.iter().map(|(id, block)| (*id, block))
    }

    /// Left-multiply every block, e.g. by the square-root information.
    pub fn premultiply(&mut self, matrix: &DMatrix<f64>) {
        for block in self.blocks.values_mut() {
            *block = matrix * &*block;
        }
    }
}
