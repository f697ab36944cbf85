use std::{collections::BTreeMap, fmt};

use crate::error::{Result, WorkflowError};

/// Named tensors making up the persistent state of a model.
pub type ModelState = BTreeMap<String, Vec<f32>>;

/// A trainable tensor together with its last computed gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Vec<f32>,
    pub grad: Option<Vec<f32>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// A non trainable tensor that's still part of the model's state, e.g. running statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub name: String,
    pub value: Vec<f32>,
}

/// The model abstraction the workflow drives. The numerics live in the runner, the
/// workflow only moves parameters, gradients and state around.
pub trait Model: Send + fmt::Display {
    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn buffers(&self) -> &[Buffer] {
        &[]
    }

    fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut []
    }

    /// Switches between training and inference behaviour.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Drops every gradient.
    fn zero_grad(&mut self) {
        self.parameters_mut().iter_mut().for_each(|p| p.grad = None);
    }

    /// Snapshots parameters and buffers by name.
    fn state(&self) -> ModelState {
        let params = self.parameters().iter().map(|p| (p.name.clone(), p.value.clone()));
        let buffers = self.buffers().iter().map(|b| (b.name.clone(), b.value.clone()));
        params.chain(buffers).collect()
    }

    /// Overwrites parameters and buffers from `state`.
    ///
    /// Every tensor of the model must be present with the same length, extra entries in
    /// `state` are rejected too. Nothing is overwritten unless the whole state fits.
    fn load_state(&mut self, state: &ModelState) -> Result<()> {
        let params = self.parameters().iter().map(|p| (&p.name, p.value.len()));
        let buffers = self.buffers().iter().map(|b| (&b.name, b.value.len()));

        let mut expected = 0;
        for (name, len) in params.chain(buffers) {
            check_tensor(name, len, state)?;
            expected += 1;
        }

        if state.len() != expected {
            return Err(WorkflowError::IncompatibleState(format!(
                "state holds {} tensors, the model has {expected}",
                state.len()
            )));
        }

        for p in self.parameters_mut() {
            p.value.copy_from_slice(&state[&p.name]);
        }
        for b in self.buffers_mut() {
            b.value.copy_from_slice(&state[&b.name]);
        }

        Ok(())
    }
}

fn check_tensor(name: &str, len: usize, state: &ModelState) -> Result<()> {
    let src = state
        .get(name)
        .ok_or_else(|| WorkflowError::IncompatibleState(format!("missing tensor {name}")))?;

    if src.len() != len {
        return Err(WorkflowError::IncompatibleState(format!(
            "tensor {name} has {} values, the model expects {len}",
            src.len()
        )));
    }

    Ok(())
}
