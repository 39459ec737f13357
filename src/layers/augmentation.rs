//! Pass-through hook for externally supplied data augmentation.
//!
//! The engine defines no transform math of its own. An [`Augmentation`]
//! collaborator may be installed on the layer; forward hands it the batch's
//! activation region to rewrite in place, and backward passes the gradient
//! through untouched: the transform is treated as data preparation, not as a
//! differentiated operation. Without a collaborator the layer is an identity.

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::layers::Layer;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use std::rc::Rc;

/// An externally supplied transform applied to a batch of activations in
/// place during the forward pass.
pub trait Augmentation {
    fn apply(&self, activations: &mut [f32], shape: Shape, batch_size: usize);
}

/// Reflexive hook layer that hands its activation region to an installed
/// [`Augmentation`] collaborator, or does nothing when none is installed.
pub struct AugmentationLayer {
    transform: Option<Rc<dyn Augmentation>>,
    shape: Option<Shape>,
    io: Option<LayerBuffers>,
}

impl AugmentationLayer {
    pub fn new(transform: Option<Rc<dyn Augmentation>>) -> Self {
        Self {
            transform,
            shape: None,
            io: None,
        }
    }
}

impl Layer for AugmentationLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.shape {
            return Ok(shape);
        }
        buffers.output.declare_sample_volume(input.volume())?;
        self.io = Some(buffers);
        self.shape = Some(input);
        Ok(input)
    }

    fn forward(&self, batch_size: usize) {
        let transform = match &self.transform {
            Some(transform) => transform,
            None => return,
        };
        let shape = self.shape.expect("augmentation layer not started");
        let io = self.io.as_ref().expect("augmentation layer not started");

        let mut data = io.output.activations_mut();
        let len = batch_size * shape.volume();
        transform.apply(&mut data[..len], shape, batch_size);
    }

    fn backward(&self, _batch_size: usize, _update: bool) {}

    fn reflexive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPair;

    struct Doubler;

    impl Augmentation for Doubler {
        fn apply(&self, activations: &mut [f32], _shape: Shape, _batch_size: usize) {
            for value in activations {
                *value *= 2.0;
            }
        }
    }

    fn started(
        transform: Option<Rc<dyn Augmentation>>,
        volume: usize,
        batch: usize,
    ) -> (AugmentationLayer, Rc<BufferPair>) {
        let pair = BufferPair::new();
        pair.declare_sample_volume(volume).unwrap();
        let mut layer = AugmentationLayer::new(transform);
        let mut rng = SimpleRng::new(1);
        layer
            .startup(
                Shape::new(volume, 1, 1),
                LayerBuffers::new(Rc::clone(&pair), Rc::clone(&pair)),
                batch,
                &mut rng,
            )
            .unwrap();
        pair.allocate(batch);
        (layer, pair)
    }

    #[test]
    fn test_identity_without_collaborator() {
        let (layer, pair) = started(None, 3, 1);
        pair.activations_mut()[..3].copy_from_slice(&[1.0, -2.0, 3.0]);
        layer.forward(1);
        assert_eq!(&pair.activations()[..3], &[1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_collaborator_rewrites_activations() {
        let (layer, pair) = started(Some(Rc::new(Doubler)), 2, 2);
        pair.activations_mut()[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.forward(2);
        assert_eq!(&pair.activations()[..4], &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_backward_leaves_gradient_untouched() {
        let (layer, pair) = started(Some(Rc::new(Doubler)), 2, 1);
        pair.activations_mut()[..2].fill(1.0);
        layer.forward(1);

        pair.gradients_mut()[..2].copy_from_slice(&[0.5, -0.5]);
        layer.backward(1, true);
        assert_eq!(&pair.gradients()[..2], &[0.5, -0.5]);
    }
}
