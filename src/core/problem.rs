//! One calibration problem: the variables to estimate and the error terms over them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::error_term::ErrorTerm;
use super::variable::{VariableId, VariableStore};
use crate::error::CalibResult;

/// Variables and error terms of one calibration pass.
///
/// Holds handles into a [`VariableStore`] rather than the variables
/// themselves. Error terms are shared with whoever created them. A problem is
/// built fresh for every pass.
#[derive(Debug, Default)]
pub struct CalibrationProblem {
    calibration_variables: Vec<VariableId>,
    state_variables: Vec<VariableId>,
    dim_calibration: usize,
    dim_state: usize,
    error_terms: Vec<Arc<dyn ErrorTerm>>,
    /// variable → indices into `error_terms`
    errors_by_variable: HashMap<VariableId, Vec<usize>>,
}

impl CalibrationProblem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a calibration variable. Registering the same handle twice counts it twice.
    pub fn add_calibration_variable(&mut self, id: VariableId) {
        self.dim_calibration += id.dimension();
        self.calibration_variables.push(id);
    }

    /// Register a state variable. Registering the same handle twice counts it twice.
    pub fn add_state_variable(&mut self, id: VariableId) {
        self.dim_state += id.dimension();
        self.state_variables.push(id);
    }

    pub fn add_error_term(&mut self, term: Arc<dyn ErrorTerm>) {
        let index = self.error_terms.len();
        for id in term.design_variables() {
            self.errors_by_variable.entry(id).or_default().push(index);
        }
        self.error_terms.push(term);
    }

    /// Error terms that reference `id`, in registration order.
    pub fn errors_for(&self, id: VariableId) -> Vec<Arc<dyn ErrorTerm>> {
        self.errors_by_variable
            .get(&id)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&i| Arc::clone(&self.error_terms[i]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn num_error_terms(&self) -> usize {
        self.error_terms.len()
    }

    pub fn dim_calibration_variables(&self) -> usize {
        self.dim_calibration
    }

    pub fn dim_state_variables(&self) -> usize {
        self.dim_state
    }

    pub fn error_terms(&self) -> &[Arc<dyn ErrorTerm>] {
        &self.error_terms
    }

    pub fn calibration_variables(&self) -> &[VariableId] {
        &self.calibration_variables
    }

    pub fn state_variables(&self) -> &[VariableId] {
        &self.state_variables
    }

    /// Registered variables that no error term depends on.
    pub fn unconstrained_variables(&self) -> Vec<VariableId> {
        let mut seen = HashSet::new();
        self.calibration_variables
            .iter()
            .chain(&self.state_variables)
            .copied()
            .filter(|id| seen.insert(*id) && !self.errors_by_variable.contains_key(id))
            .collect()
    }

    /// `Σ rᵀ W r` over all error terms.
    pub fn total_weighted_squared_error(&self, store: &VariableStore) -> CalibResult<f64> {
        self.error_terms
            .iter()
            .map(|term| term.weighted_squared_error(store))
            .sum()
    }

    /// Weighted squared error summed per error-term group.
    pub fn cost_by_group(&self, store: &VariableStore) -> CalibResult<BTreeMap<String, (usize, f64)>> {
        let mut groups: BTreeMap<String, (usize, f64)> = BTreeMap::new();
        for term in &self.error_terms {
            let cost = term.weighted_squared_error(store)?;
            let entry = groups.entry(term.group().to_string()).or_default();
            entry.0 += 1;
            entry.1 += cost;
        }
        Ok(groups)
    }
}
