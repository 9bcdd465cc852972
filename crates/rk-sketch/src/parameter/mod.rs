//! Parametric values
//!
//! A [`Parameter`] is a named number, either a literal or derived from a
//! [`Formula`] over other parameters. Parameters live in hierarchical
//! [`ParameterScope`]s owned by a [`ParameterStore`], which keeps the
//! reverse dependency index and re-evaluates dependents eagerly whenever a
//! value changes.

pub mod formula;
mod scope;

pub use formula::{BinaryOp, Expr, Formula, FormulaError, FormulaResult, Function, UnaryOp};
pub use scope::{InstanceData, ParameterData, ParameterScope, ParameterStore, Preset, ScopeData};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors from parameter operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Parameter not found: {0}")]
    NotFound(Uuid),
    #[error("Scope not found: {0}")]
    ScopeNotFound(Uuid),
    #[error("Parameter '{0}' is locked")]
    Locked(String),
    #[error("Unknown standard '{0}'")]
    UnknownStandard(String),
    #[error("Unknown type '{0}'")]
    UnknownType(String),
}

/// Result type for parameter operations
pub type ParameterResult<T> = Result<T, ParameterError>;

/// How an instance value was produced
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceSource {
    /// Set directly as a number
    Literal,
    /// Set as an instance-specific formula
    Formula(Formula),
    /// Base formula evaluated with upstream instance values
    Derived,
}

/// Per-instance override of a parameter
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOverride {
    pub value: f64,
    pub source: InstanceSource,
}

/// A value change produced by a parameter operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    /// Changed parameter
    pub parameter: Uuid,
    /// Instance whose value changed, `None` for the base value
    pub instance: Option<Uuid>,
    pub old: f64,
    pub new: f64,
}

/// A named numeric value
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Unique identifier
    pub id: Uuid,
    scope: Uuid,
    name: String,
    value: f64,
    formula: Option<Formula>,
    instances: HashMap<Uuid, InstanceOverride>,
    hidden: bool,
    locked: bool,
}

impl Parameter {
    pub(crate) fn new(scope: Uuid, name: impl Into<String>, value: f64) -> Self {
        Self::with_id(Uuid::new_v4(), scope, name, value)
    }

    pub(crate) fn with_id(id: Uuid, scope: Uuid, name: impl Into<String>, value: f64) -> Self {
        Self {
            id,
            scope,
            name: name.into(),
            value,
            formula: None,
            instances: HashMap::new(),
            hidden: false,
            locked: false,
        }
    }

    /// Owning scope
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Value seen by an instance, falling back to the base value
    pub fn instance_value(&self, instance: Option<Uuid>) -> f64 {
        instance
            .and_then(|i| self.instances.get(&i))
            .map_or(self.value, |o| o.value)
    }

    /// Base formula, `None` for a literal
    pub fn formula(&self) -> Option<&Formula> {
        self.formula.as_ref()
    }

    /// Formula used for an instance: its own formula, else the base formula
    pub fn instance_formula(&self, instance: Option<Uuid>) -> Option<&Formula> {
        match instance.and_then(|i| self.instances.get(&i)) {
            Some(InstanceOverride {
                source: InstanceSource::Formula(f),
                ..
            }) => Some(f),
            Some(InstanceOverride {
                source: InstanceSource::Literal,
                ..
            }) => None,
            _ => self.formula.as_ref(),
        }
    }

    /// Get an instance override
    pub fn instance(&self, instance: Uuid) -> Option<&InstanceOverride> {
        self.instances.get(&instance)
    }

    /// Iterate over instance overrides
    pub fn instances(&self) -> impl Iterator<Item = (&Uuid, &InstanceOverride)> {
        self.instances.iter()
    }

    /// Check if the base value is formula-driven
    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// All formulas of this parameter, base first
    pub(crate) fn formulas(&self) -> impl Iterator<Item = &Formula> {
        self.formula.iter().chain(self.instances.values().filter_map(|o| match &o.source {
            InstanceSource::Formula(f) => Some(f),
            _ => None,
        }))
    }

    /// Direct upstream parameter IDs over base and instance formulas
    pub fn references(&self) -> Vec<Uuid> {
        formula::union_references(self.formulas())
    }

    /// Check if any formula of this parameter references `id`
    pub fn references_parameter(&self, id: Uuid) -> bool {
        self.formulas().any(|f| f.references_parameter(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_value_falls_back_to_base() {
        let mut param = Parameter::new(Uuid::new_v4(), "width", 10.0);
        let instance = Uuid::new_v4();

        assert_eq!(param.instance_value(Some(instance)), 10.0);
        assert_eq!(param.instance_value(None), 10.0);

        param.instances.insert(
            instance,
            InstanceOverride {
                value: 4.0,
                source: InstanceSource::Literal,
            },
        );
        assert_eq!(param.instance_value(Some(instance)), 4.0);
        assert_eq!(param.instance_value(None), 10.0);
        assert!(param.instance_formula(Some(instance)).is_none());
    }
}
