//! Loss collaborators: given ground truth, score the final activations and
//! seed the gradient stream for the backward pass.

use crate::buffers::BufferPair;
use crate::shape::Shape;
use crate::Tensor;
use std::rc::Rc;

/// Scores the pipeline output and writes the initial gradient.
///
/// `startup` hands the loss the buffer pair the last layer writes into, the
/// output shape, and the batch capacity. `compute` reads the activation view,
/// writes `d(loss)/d(output)` into the gradient view, and returns the loss
/// plus one auxiliary metric (implementation-defined, e.g. mean absolute
/// error). A NaN loss signals a corrupted step; the network skips backward
/// and update for it.
pub trait Loss {
    fn startup(&mut self, buffers: Rc<BufferPair>, output: Shape, max_batch: usize);

    fn compute(&self, ground_truth: &[Tensor]) -> (f32, f32);
}

/// Mean squared error over every output element, averaged across the batch.
/// The auxiliary metric is the mean absolute error.
pub struct MeanSquaredError {
    buffers: Option<Rc<BufferPair>>,
    shape: Option<Shape>,
}

impl MeanSquaredError {
    pub fn new() -> Self {
        Self {
            buffers: None,
            shape: None,
        }
    }
}

impl Default for MeanSquaredError {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for MeanSquaredError {
    fn startup(&mut self, buffers: Rc<BufferPair>, output: Shape, _max_batch: usize) {
        self.buffers = Some(buffers);
        self.shape = Some(output);
    }

    fn compute(&self, ground_truth: &[Tensor]) -> (f32, f32) {
        let buffers = self.buffers.as_ref().expect("loss not started");
        let shape = self.shape.expect("loss not started");
        let volume = shape.volume();

        let output = buffers.activations();
        let mut grad = buffers.gradients_mut();

        let batch = ground_truth.len();
        let count = (batch * volume) as f32;
        let mut squared = 0.0f32;
        let mut absolute = 0.0f32;
        for (b, expected) in ground_truth.iter().enumerate() {
            assert_eq!(
                expected.len(),
                volume,
                "ground truth sample {} has {} elements, output volume is {}",
                b,
                expected.len(),
                volume
            );
            let base = b * volume;
            for (i, &t) in expected.iter().enumerate() {
                let diff = output[base + i] - t;
                squared += diff * diff;
                absolute += diff.abs();
                grad[base + i] = 2.0 * diff / count;
            }
        }
        (squared / count, absolute / count)
    }
}
