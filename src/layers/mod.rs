//! Layer contract and implementations.
//!
//! Every computation unit in a pipeline implements [`Layer`]: a one-time
//! [`Layer::startup`] that resolves geometry and declares buffer capacity,
//! then any number of alternating [`Layer::forward`]/[`Layer::backward`]
//! calls. Capability is expressed with flags rather than marker types:
//! a layer reports whether it is reflexive (reads and writes the same buffer
//! region in place) and which [`Weights`] objects it owns.

pub mod activation;
pub mod augmentation;
pub mod batch_norm;
pub mod convolution;
pub mod dense;
pub mod input;
pub mod structural;
pub mod trans_conv;

pub use activation::{ActivationKind, ActivationLayer};
pub use augmentation::{Augmentation, AugmentationLayer};
pub use batch_norm::BatchNormLayer;
pub use convolution::ConvolutionLayer;
pub use dense::DenseLayer;
pub use input::InputLayer;
pub use structural::{
    AveragePoolLayer, ConcatenateLayer, ForkLayer, ReshapeLayer, TapChannel, UpsampleLayer,
};
pub use trans_conv::TransConvLayer;

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::initializer::Initializer;
use crate::kernels;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use crate::weights::Weights;
use std::cell::{Ref, RefCell};
use std::rc::Rc;

/// The per-layer contract the network drives.
pub trait Layer {
    /// One-time initialization: resolve the output geometry from the input
    /// shape, declare how much space one batch element of output needs on the
    /// output buffer pair, allocate any per-layer scratch, and create owned
    /// weights. Idempotent: a second call returns the cached output shape
    /// without redeclaring anything.
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError>;

    /// Read the input activation view, write the output activation view.
    ///
    /// Must only be called after a successful `startup`.
    fn forward(&self, batch_size: usize);

    /// Read the incoming gradient from the output pair, write the outgoing
    /// gradient to the input pair. When `update` is false only the outgoing
    /// gradient is produced; filter/bias gradient accumulation is skipped.
    fn backward(&self, batch_size: usize, update: bool);

    /// Reinitialize any owned weights from their initializer strategies.
    fn reset(&mut self, rng: &mut SimpleRng) {
        let _ = rng;
    }

    /// Whether this layer operates in place (input and output share one
    /// buffer pair, so the network does not ping-pong after it).
    fn reflexive(&self) -> bool {
        false
    }

    /// The trainable tensors this layer owns, for the network registry.
    /// Convention for weighted layers: index 0 is the main weight tensor,
    /// index 1 the bias.
    fn weights(&self) -> Vec<Rc<Weights>> {
        Vec::new()
    }
}

/// Shared state of every weighted layer: the weight tensor, the optional
/// per-channel bias, and the retained copy of the forward input that the
/// filter-gradient kernel reads during the backward pass.
///
/// The input copy is taken *before* the output region is overwritten, because
/// buffer ping-pong means the input region will be recycled as some later
/// layer's output long before `backward` runs.
pub struct WeightedCore {
    pub weights: Rc<Weights>,
    pub bias: Rc<Weights>,
    saved_input: RefCell<Vec<f32>>,
}

impl WeightedCore {
    pub fn new(
        weight_len: usize,
        weight_init: Initializer,
        bias_len: usize,
        scratch_len: usize,
        rng: &mut SimpleRng,
    ) -> Self {
        Self {
            weights: Weights::new(weight_len, weight_init, rng),
            bias: Weights::new(bias_len, Initializer::Constant { value: 0.0 }, rng),
            saved_input: RefCell::new(vec![0.0; scratch_len]),
        }
    }

    /// Retain a copy of the forward input for the backward pass.
    pub fn save_input(&self, input: &[f32]) {
        self.saved_input.borrow_mut()[..input.len()].copy_from_slice(input);
    }

    /// The retained forward input.
    pub fn saved(&self) -> Ref<'_, Vec<f32>> {
        self.saved_input.borrow()
    }

    /// Add the bias, one value per output channel.
    pub fn add_bias(&self, output: &mut [f32], shape: &Shape, batch_size: usize) {
        let bias = self.bias.values();
        kernels::add_bias(output, &bias, shape, batch_size);
    }

    /// Accumulate the per-channel bias gradient from the incoming gradient.
    pub fn accumulate_bias_gradient(&self, grad: &[f32], shape: &Shape, batch_size: usize) {
        let mut bias_grad = self.bias.gradient_mut();
        kernels::bias_gradient(grad, &mut bias_grad, shape, batch_size);
    }

    pub fn reset(&self, rng: &mut SimpleRng) {
        self.weights.reset(rng);
        self.bias.reset(rng);
    }

    pub fn weight_list(&self) -> Vec<Rc<Weights>> {
        vec![Rc::clone(&self.weights), Rc::clone(&self.bias)]
    }
}
