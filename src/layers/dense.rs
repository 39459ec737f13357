//! Fully connected layer.

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::initializer::Initializer;
use crate::kernels;
use crate::layers::{Layer, WeightedCore};
use crate::shape::Shape;
use crate::utils::SimpleRng;
use crate::weights::Weights;
use rayon::prelude::*;
use std::rc::Rc;

/// Dense connection from the flattened input volume to `units` outputs.
/// The output shape is `1 x 1 x units`, so each unit is its own channel and
/// the shared bias kernels apply one bias value per unit.
///
/// Weight layout is `[unit][input element]`.
pub struct DenseLayer {
    units: usize,
    input_shape: Option<Shape>,
    core: Option<WeightedCore>,
    io: Option<LayerBuffers>,
}

impl DenseLayer {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            input_shape: None,
            core: None,
            io: None,
        }
    }

    fn parts(&self) -> (Shape, &WeightedCore, &LayerBuffers) {
        (
            self.input_shape.expect("dense layer not started"),
            self.core.as_ref().expect("dense layer not started"),
            self.io.as_ref().expect("dense layer not started"),
        )
    }

    fn output_shape(&self) -> Shape {
        Shape::new(1, 1, self.units)
    }
}

impl Layer for DenseLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if self.input_shape.is_some() {
            return Ok(self.output_shape());
        }

        let volume = input.volume();
        buffers.output.declare_sample_volume(self.units)?;
        self.core = Some(WeightedCore::new(
            self.units * volume,
            Initializer::xavier(volume, self.units),
            self.units,
            max_batch * volume,
            rng,
        ));
        self.io = Some(buffers);
        self.input_shape = Some(input);
        Ok(self.output_shape())
    }

    fn forward(&self, batch_size: usize) {
        let (in_shape, core, io) = self.parts();
        let volume = in_shape.volume();

        let input_view = io.input.activations();
        core.save_input(&input_view[..batch_size * volume]);

        let weights_view = core.weights.values();
        // Plain slices for the data-parallel loops; the views stay alive
        // (and the live counts pinned) until the end of the call.
        let input: &[f32] = &input_view;
        let weights: &[f32] = &weights_view;
        let mut output = io.output.activations_mut();
        output[..batch_size * self.units]
            .par_chunks_mut(self.units)
            .enumerate()
            .for_each(|(b, out)| {
                let sample = &input[b * volume..(b + 1) * volume];
                for (u, slot) in out.iter_mut().enumerate() {
                    let row = &weights[u * volume..(u + 1) * volume];
                    *slot = row.iter().zip(sample).map(|(w, x)| w * x).sum();
                }
            });
        core.add_bias(&mut output, &self.output_shape(), batch_size);
    }

    fn backward(&self, batch_size: usize, update: bool) {
        let (in_shape, core, io) = self.parts();
        let volume = in_shape.volume();

        let grad_view = io.output.gradients();
        let weights_view = core.weights.values();
        let grad_out: &[f32] = &grad_view;
        let weights: &[f32] = &weights_view;
        let units = self.units;
        {
            let mut grad_in = io.input.gradients_mut();
            grad_in[..batch_size * volume]
                .par_chunks_mut(volume)
                .enumerate()
                .for_each(|(b, out)| {
                    let grads = &grad_out[b * units..(b + 1) * units];
                    for (i, slot) in out.iter_mut().enumerate() {
                        let mut acc = 0.0f32;
                        for (u, g) in grads.iter().enumerate() {
                            acc += weights[u * volume + i] * g;
                        }
                        *slot = acc;
                    }
                });
        }

        if update {
            let saved_view = core.saved();
            let saved: &[f32] = &saved_view;
            let mut weight_grad = core.weights.gradient_mut();
            weight_grad
                .par_chunks_mut(volume)
                .enumerate()
                .for_each(|(u, row)| {
                    for b in 0..batch_size {
                        let g = grad_out[b * units + u];
                        let sample = &saved[b * volume..(b + 1) * volume];
                        for (slot, x) in row.iter_mut().zip(sample) {
                            *slot += g * x;
                        }
                    }
                });
            drop(weight_grad);
            core.accumulate_bias_gradient(grad_out, &self.output_shape(), batch_size);
        }
    }

    fn reset(&mut self, rng: &mut SimpleRng) {
        if let Some(core) = &self.core {
            core.reset(rng);
        }
    }

    fn weights(&self) -> Vec<Rc<Weights>> {
        self.core.as_ref().map(WeightedCore::weight_list).unwrap_or_default()
    }
}
