//! Elementwise activation functions, applied in place.

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::layers::Layer;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// The supported elementwise nonlinearities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    LeakyRelu { alpha: f32 },
    Sigmoid,
    Tanh,
}

impl ActivationKind {
    fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationKind::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed in terms of the forward *output*, which is what
    /// the activation buffer holds when backward runs.
    fn derivative_from_output(&self, y: f32) -> f32 {
        match self {
            ActivationKind::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationKind::LeakyRelu { alpha } => {
                if y > 0.0 {
                    1.0
                } else {
                    *alpha
                }
            }
            ActivationKind::Sigmoid => y * (1.0 - y),
            ActivationKind::Tanh => 1.0 - y * y,
        }
    }
}

/// Applies one [`ActivationKind`] to every element. Reflexive: the output
/// overwrites the input region, and backward scales the gradient in place by
/// the derivative evaluated on the forward output.
///
/// The output is retained in a private scratch buffer: by the time backward
/// runs, the shared activation region has usually been recycled by a layer
/// further down the pipeline.
pub struct ActivationLayer {
    kind: ActivationKind,
    shape: Option<Shape>,
    io: Option<LayerBuffers>,
    saved_output: RefCell<Vec<f32>>,
}

impl ActivationLayer {
    pub fn new(kind: ActivationKind) -> Self {
        Self {
            kind,
            shape: None,
            io: None,
            saved_output: RefCell::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Layer for ActivationLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.shape {
            return Ok(shape);
        }
        buffers.output.declare_sample_volume(input.volume())?;
        self.saved_output = RefCell::new(vec![0.0; max_batch * input.volume()]);
        self.io = Some(buffers);
        self.shape = Some(input);
        Ok(input)
    }

    fn forward(&self, batch_size: usize) {
        let shape = self.shape.expect("activation layer not started");
        let io = self.io.as_ref().expect("activation layer not started");
        let len = batch_size * shape.volume();

        let mut data = io.output.activations_mut();
        let mut saved = self.saved_output.borrow_mut();
        for (value, slot) in data[..len].iter_mut().zip(&mut saved[..len]) {
            *value = self.kind.apply(*value);
            *slot = *value;
        }
    }

    fn backward(&self, batch_size: usize, _update: bool) {
        let shape = self.shape.expect("activation layer not started");
        let io = self.io.as_ref().expect("activation layer not started");
        let len = batch_size * shape.volume();

        let saved = self.saved_output.borrow();
        let mut grad = io.output.gradients_mut();
        for (g, &y) in grad[..len].iter_mut().zip(&saved[..len]) {
            *g *= self.kind.derivative_from_output(y);
        }
    }

    fn reflexive(&self) -> bool {
        true
    }
}
