use std::fmt;

use nalgebra::{DVector, DVectorView, Isometry3, UnitQuaternion, Vector3};

use crate::error::{CalibError, CalibResult};
use crate::manifold::{LocalParameterization, RotationVector};

/// Stable handle of a design variable inside a [`VariableStore`].
///
/// Carries the minimal dimension so that problem bookkeeping does not need
/// access to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId {
    index: usize,
    dimension: usize,
}

impl VariableId {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Whether a variable is estimated once for the whole dataset or per time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableCategory {
    Calibration,
    State,
}

impl fmt::Display for VariableCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableCategory::Calibration => write!(f, "calibration"),
            VariableCategory::State => write!(f, "state"),
        }
    }
}

/// Stored representation of a design variable
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// Euclidean vector, updated additively
    Euclidean(DVector<f64>),
    /// Unit quaternion, updated by a passive left rotation
    Rotation(UnitQuaternion<f64>),
    /// Rigid-body transform, updated by a left pose perturbation
    Pose(Isometry3<f64>),
}

impl VariableValue {
    pub fn minimal_dimension(&self) -> usize {
        match self {
            VariableValue::Euclidean(v) => v.local_dimension(),
            VariableValue::Rotation(q) => q.local_dimension(),
            VariableValue::Pose(t) => t.local_dimension(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VariableValue::Euclidean(_) => "euclidean",
            VariableValue::Rotation(_) => "rotation",
            VariableValue::Pose(_) => "pose",
        }
    }

    /// Apply a local perturbation; the kind of the value never changes.
    pub fn boxplus(&self, delta: DVectorView<f64>) -> VariableValue {
        match self {
            VariableValue::Euclidean(v) => VariableValue::Euclidean(v.boxplus(delta)),
            VariableValue::Rotation(q) => VariableValue::Rotation(q.boxplus(delta)),
            VariableValue::Pose(t) => VariableValue::Pose(t.boxplus(delta)),
        }
    }

    fn same_shape(&self, other: &VariableValue) -> bool {
        match (self, other) {
            (VariableValue::Euclidean(a), VariableValue::Euclidean(b)) => a.len() == b.len(),
            (VariableValue::Rotation(_), VariableValue::Rotation(_))
            | (VariableValue::Pose(_), VariableValue::Pose(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Euclidean(v) => {
                let entries: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
                write!(f, "[{}]", entries.join(", "))
            }
            VariableValue::Rotation(q) => {
                let p: Vector3<f64> = RotationVector::quaternion_to_parameters(q);
                write!(f, "rotation vector [{:.6}, {:.6}, {:.6}]", p.x, p.y, p.z)
            }
            VariableValue::Pose(t) => {
                let p = RotationVector::quaternion_to_parameters(&t.rotation);
                let v = t.translation.vector;
                write!(
                    f,
                    "t = [{:.6}, {:.6}, {:.6}], rotation vector [{:.6}, {:.6}, {:.6}]",
                    v.x, v.y, v.z, p.x, p.y, p.z
                )
            }
        }
    }
}

/// A mutable unknown of the calibration problem.
#[derive(Debug, Clone)]
pub struct DesignVariable {
    name: String,
    category: VariableCategory,
    value: VariableValue,
    active: bool,
}

impl DesignVariable {
    /// New active variable.
    pub fn new(name: impl Into<String>, category: VariableCategory, value: VariableValue) -> Self {
        Self {
            name: name.into(),
            category,
            value,
            active: true,
        }
    }

    pub fn calibration(name: impl Into<String>, value: VariableValue) -> Self {
        Self::new(name, VariableCategory::Calibration, value)
    }

    pub fn state(name: impl Into<String>, value: VariableValue) -> Self {
        Self::new(name, VariableCategory::State, value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> VariableCategory {
        self.category
    }

    pub fn value(&self) -> &VariableValue {
        &self.value
    }

    pub fn minimal_dimension(&self) -> usize {
        self.value.minimal_dimension()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Apply a local perturbation of size [`minimal_dimension`](Self::minimal_dimension).
    pub fn update(&mut self, delta: DVectorView<f64>) {
        self.value = self.value.boxplus(delta);
    }

    /// Replace the stored value. The new value must have the same kind and dimension.
    pub fn set_value(&mut self, value: VariableValue) -> CalibResult<()> {
        if !self.value.same_shape(&value) {
            return Err(CalibError::InvalidInput(format!(
                "variable '{}' holds a {} value of dimension {}, got {} of dimension {}",
                self.name,
                self.value.kind(),
                self.value.minimal_dimension(),
                value.kind(),
                value.minimal_dimension()
            )));
        }
        self.value = value;
        Ok(())
    }
}

impl fmt::Display for DesignVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.category)?;
        if !self.active {
            write!(f, ", inactive")?;
        }
        write!(f, "): {}", self.value)
    }
}

/// Arena owning every design variable of a model.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    variables: Vec<DesignVariable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, variable: DesignVariable) -> VariableId {
        let id = VariableId {
            index: self.variables.len(),
            dimension: variable.minimal_dimension(),
        };
        self.variables.push(variable);
        id
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn get(&self, id: VariableId) -> Option<&DesignVariable> {
        self.variables.get(id.index)
    }

    pub fn get_mut(&mut self, id: VariableId) -> Option<&mut DesignVariable> {
        self.variables.get_mut(id.index)
    }

    fn require(&self, id: VariableId) -> CalibResult<&DesignVariable> {
        self.get(id)
            .ok_or_else(|| CalibError::InvalidInput(format!("unknown design variable {id}")))
    }

    /// Value of a pose variable.
    pub fn pose(&self, id: VariableId) -> CalibResult<Isometry3<f64>> {
        match self.require(id)?.value() {
            VariableValue::Pose(t) => Ok(*t),
            other => Err(self.kind_mismatch(id, "pose", other)),
        }
    }

    /// Value of a rotation variable.
    pub fn rotation(&self, id: VariableId) -> CalibResult<UnitQuaternion<f64>> {
        match self.require(id)?.value() {
            VariableValue::Rotation(q) => Ok(*q),
            other => Err(self.kind_mismatch(id, "rotation", other)),
        }
    }

    /// Value of a Euclidean variable.
    pub fn vector(&self, id: VariableId) -> CalibResult<&DVector<f64>> {
        match self.require(id)?.value() {
            VariableValue::Euclidean(v) => Ok(v),
            other => Err(self.kind_mismatch(id, "euclidean", other)),
        }
    }

    fn kind_mismatch(&self, id: VariableId, expected: &str, found: &VariableValue) -> CalibError {
        let name = self.get(id).map(DesignVariable::name).unwrap_or("?");
        CalibError::InvalidInput(format!(
            "variable '{name}' ({id}) is a {} variable, expected {expected}",
            found.kind()
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (VariableId, &DesignVariable)> {
        self.variables.iter().enumerate().map(|(index, variable)| {
            (
                VariableId {
                    index,
                    dimension: variable.minimal_dimension(),
                },
                variable,
            )
        })
    }

    /// Copy of every stored value, in arena order.
    pub fn snapshot(&self) -> Vec<VariableValue> {
        self.variables.iter().map(|v| v.value.clone()).collect()
    }

    /// Restore values captured by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, snapshot: Vec<VariableValue>) {
        for (variable, value) in self.variables.iter_mut().zip(snapshot) {
            variable.value = value;
        }
    }
}
