//! Input layer: stages host tensors and copies them into the pipeline's
//! first activation buffer.

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::layers::Layer;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use std::cell::{Cell, RefCell};

/// The entry point of every pipeline. Samples are staged with
/// [`InputLayer::set_input`] and copied into the shared activation buffer at
/// the start of each forward pass.
///
/// The layer is reflexive in the buffer-pair sense: it produces into the
/// current pair without consuming anything, so no ping-pong happens before
/// the first real layer.
pub struct InputLayer {
    shape: Shape,
    staged: RefCell<Vec<f32>>,
    staged_count: Cell<usize>,
    io: Option<LayerBuffers>,
}

impl InputLayer {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            staged: RefCell::new(Vec::new()),
            staged_count: Cell::new(0),
            io: None,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Stage one flat tensor per batch element.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when any sample's length differs from the declared
    /// volume.
    pub fn set_input(&self, samples: &[Vec<f32>]) -> Result<(), EngineError> {
        let volume = self.shape.volume();
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != volume {
                return Err(EngineError::ShapeMismatch(format!(
                    "input sample {} has {} elements, layer declares volume {}",
                    i,
                    sample.len(),
                    volume
                )));
            }
        }
        let mut staged = self.staged.borrow_mut();
        staged.clear();
        for sample in samples {
            staged.extend_from_slice(sample);
        }
        self.staged_count.set(samples.len());
        Ok(())
    }

    /// Stage multi-channel samples, one area-sized tensor per channel.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when a sample's channel count differs from the
    /// declared dimensions or any channel's length differs from the declared
    /// area.
    pub fn set_channel_input(&self, samples: &[Vec<Vec<f32>>]) -> Result<(), EngineError> {
        let area = self.shape.area();
        for (i, channels) in samples.iter().enumerate() {
            if channels.len() != self.shape.dimensions {
                return Err(EngineError::ShapeMismatch(format!(
                    "input sample {} has {} channels, layer declares {}",
                    i,
                    channels.len(),
                    self.shape.dimensions
                )));
            }
            for (d, channel) in channels.iter().enumerate() {
                if channel.len() != area {
                    return Err(EngineError::ShapeMismatch(format!(
                        "input sample {} channel {} has {} elements, layer declares area {}",
                        i,
                        d,
                        channel.len(),
                        area
                    )));
                }
            }
        }
        let mut staged = self.staged.borrow_mut();
        staged.clear();
        for channels in samples {
            for channel in channels {
                staged.extend_from_slice(channel);
            }
        }
        self.staged_count.set(samples.len());
        Ok(())
    }

    /// Number of currently staged samples.
    pub fn staged_count(&self) -> usize {
        self.staged_count.get()
    }
}

impl Layer for InputLayer {
    fn startup(
        &mut self,
        _input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if self.io.is_none() {
            buffers.output.declare_sample_volume(self.shape.volume())?;
            self.io = Some(buffers);
        }
        Ok(self.shape)
    }

    fn forward(&self, batch_size: usize) {
        let io = self.io.as_ref().expect("input layer not started");
        assert!(
            batch_size <= self.staged_count.get(),
            "forward over {} samples but only {} staged",
            batch_size,
            self.staged_count.get()
        );
        let staged = self.staged.borrow();
        let len = batch_size * self.shape.volume();
        io.output.activations_mut()[..len].copy_from_slice(&staged[..len]);
    }

    fn backward(&self, _batch_size: usize, _update: bool) {
        // Nothing upstream to propagate to.
    }

    fn reflexive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPair;
    use std::rc::Rc;

    fn started(shape: Shape, max_batch: usize) -> InputLayer {
        let pair = BufferPair::new();
        let mut layer = InputLayer::new(shape);
        let mut rng = SimpleRng::new(1);
        layer
            .startup(shape, LayerBuffers::new(Rc::clone(&pair), pair), max_batch, &mut rng)
            .unwrap();
        layer.io.as_ref().unwrap().output.allocate(max_batch);
        layer
    }

    #[test]
    fn test_area_mismatch_rejected() {
        let layer = started(Shape::new(2, 2, 1), 2);
        assert!(layer.set_input(&[vec![1.0; 3]]).is_err());
        assert!(layer.set_input(&[vec![1.0; 4]]).is_ok());
    }

    #[test]
    fn test_forward_copies_batch() {
        let layer = started(Shape::new(2, 1, 1), 4);
        layer
            .set_input(&[vec![1.0, 2.0], vec![3.0, 4.0]])
            .unwrap();
        layer.forward(2);

        let acts = layer.io.as_ref().unwrap().output.activations();
        assert_eq!(&acts[..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_channel_input() {
        let layer = started(Shape::new(2, 1, 2), 2);
        assert!(layer
            .set_channel_input(&[vec![vec![1.0, 2.0]]])
            .is_err());
        layer
            .set_channel_input(&[vec![vec![1.0, 2.0], vec![3.0, 4.0]]])
            .unwrap();
        layer.forward(1);

        let acts = layer.io.as_ref().unwrap().output.activations();
        assert_eq!(&acts[..4], &[1.0, 2.0, 3.0, 4.0]);
    }
}
