//! Operation parameter metadata and the positional input/output mapping.
//!
//! The mapping is computed once from an operation's parameter list when the
//! dispatcher is configured and then consumed per call as plain index lists.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Direction of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterDirection {
    /// By-value input supplied by the caller.
    In,
    /// Output written by the method and returned to the caller.
    Out,
}

/// One positional parameter of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescription {
    pub name: String,
    pub direction: ParameterDirection,
}

impl ParameterDescription {
    #[must_use]
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ParameterDirection::In,
        }
    }

    #[must_use]
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ParameterDirection::Out,
        }
    }
}

/// Disjoint positional split of a parameter list into inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    names: Vec<String>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl ParameterMap {
    #[must_use]
    pub fn new(parameters: &[ParameterDescription]) -> Self {
        let mut map = Self::default();
        for (idx, param) in parameters.iter().enumerate() {
            map.names.push(param.name.clone());
            match param.direction {
                ParameterDirection::In => map.inputs.push(idx),
                ParameterDirection::Out => map.outputs.push(idx),
            }
        }
        map
    }

    /// Total number of positional parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Fresh input array, one `Null` per input parameter.
    #[must_use]
    pub fn allocate_inputs(&self) -> Vec<Value> {
        vec![Value::Null; self.inputs.len()]
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|&i| self.names[i].as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|&i| self.names[i].as_str())
    }

    /// Spread `inputs` into a full positional argument list; output slots are `Null`.
    /// Missing inputs are left `Null`, extra inputs are ignored.
    #[must_use]
    pub fn assemble(&self, inputs: Vec<Value>) -> Vec<Value> {
        let mut full = vec![Value::Null; self.names.len()];
        for (&slot, value) in self.inputs.iter().zip(inputs) {
            full[slot] = value;
        }
        full
    }

    /// Pull output slots out of a full argument list after the call.
    #[must_use]
    pub fn extract_outputs(&self, mut full: Vec<Value>) -> Vec<Value> {
        self.outputs
            .iter()
            .map(|&slot| full.get_mut(slot).map(std::mem::take).unwrap_or_default())
            .collect()
    }
}
