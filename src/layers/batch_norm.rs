//! Per-channel batch normalization, computed in place.

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::initializer::Initializer;
use crate::layers::Layer;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use crate::weights::Weights;
use std::cell::RefCell;
use std::rc::Rc;

const EPSILON: f32 = 1e-5;

/// Normalizes each channel to zero mean and unit variance over the
/// batch × area population, then applies the learned scale `gamma` and shift
/// `beta`. The epsilon floor under the square root keeps a zero-variance
/// channel finite: the normalized values collapse to zero and the output is
/// exactly `beta`.
///
/// Reflexive: activations and gradients are rewritten in place. The
/// normalized values and per-channel sigmas are retained for the backward
/// pass, since the activation region holds `y`, not `x_hat`, after forward.
pub struct BatchNormLayer {
    shape: Option<Shape>,
    gamma: Option<Rc<Weights>>,
    beta: Option<Rc<Weights>>,
    io: Option<LayerBuffers>,
    normalized: RefCell<Vec<f32>>,
    sigma: RefCell<Vec<f32>>,
}

impl BatchNormLayer {
    pub fn new() -> Self {
        Self {
            shape: None,
            gamma: None,
            beta: None,
            io: None,
            normalized: RefCell::new(Vec::new()),
            sigma: RefCell::new(Vec::new()),
        }
    }

    fn parts(&self) -> (Shape, &Rc<Weights>, &Rc<Weights>, &LayerBuffers) {
        (
            self.shape.expect("batch norm layer not started"),
            self.gamma.as_ref().expect("batch norm layer not started"),
            self.beta.as_ref().expect("batch norm layer not started"),
            self.io.as_ref().expect("batch norm layer not started"),
        )
    }
}

impl Default for BatchNormLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for BatchNormLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.shape {
            return Ok(shape);
        }

        buffers.output.declare_sample_volume(input.volume())?;
        self.gamma = Some(Weights::new(
            input.dimensions,
            Initializer::Constant { value: 1.0 },
            rng,
        ));
        self.beta = Some(Weights::new(
            input.dimensions,
            Initializer::Constant { value: 0.0 },
            rng,
        ));
        self.normalized = RefCell::new(vec![0.0; max_batch * input.volume()]);
        self.sigma = RefCell::new(vec![0.0; input.dimensions]);
        self.io = Some(buffers);
        self.shape = Some(input);
        Ok(input)
    }

    fn forward(&self, batch_size: usize) {
        let (shape, gamma, beta, io) = self.parts();
        let area = shape.area();
        let population = (batch_size * area) as f32;

        let gamma = gamma.values();
        let beta = beta.values();
        let mut data = io.output.activations_mut();
        let mut normalized = self.normalized.borrow_mut();
        let mut sigma = self.sigma.borrow_mut();

        for d in 0..shape.dimensions {
            let mut sum = 0.0f32;
            for b in 0..batch_size {
                let base = shape.offset(b, d);
                sum += data[base..base + area].iter().sum::<f32>();
            }
            let mean = sum / population;

            let mut var_sum = 0.0f32;
            for b in 0..batch_size {
                let base = shape.offset(b, d);
                for &x in &data[base..base + area] {
                    let delta = x - mean;
                    var_sum += delta * delta;
                }
            }
            let s = (var_sum / population + EPSILON).sqrt();
            sigma[d] = s;

            for b in 0..batch_size {
                let base = shape.offset(b, d);
                for i in base..base + area {
                    let x_hat = (data[i] - mean) / s;
                    normalized[i] = x_hat;
                    data[i] = gamma[d] * x_hat + beta[d];
                }
            }
        }
    }

    fn backward(&self, batch_size: usize, update: bool) {
        let (shape, gamma_w, beta_w, io) = self.parts();
        let area = shape.area();
        let population = (batch_size * area) as f32;

        let gamma = gamma_w.values();
        let mut grad = io.output.gradients_mut();
        let normalized = self.normalized.borrow();
        let sigma = self.sigma.borrow();

        for d in 0..shape.dimensions {
            let mut sum_dy = 0.0f32;
            let mut sum_dy_xhat = 0.0f32;
            for b in 0..batch_size {
                let base = shape.offset(b, d);
                for i in base..base + area {
                    sum_dy += grad[i];
                    sum_dy_xhat += grad[i] * normalized[i];
                }
            }

            // Three-term input gradient: direct, mean and variance paths.
            let scale = gamma[d] / sigma[d];
            let mean_dy = sum_dy / population;
            let mean_dy_xhat = sum_dy_xhat / population;
            for b in 0..batch_size {
                let base = shape.offset(b, d);
                for i in base..base + area {
                    grad[i] = scale * (grad[i] - mean_dy - normalized[i] * mean_dy_xhat);
                }
            }

            if update {
                gamma_w.gradient_mut()[d] += sum_dy_xhat;
                beta_w.gradient_mut()[d] += sum_dy;
            }
        }
    }

    fn reset(&mut self, rng: &mut SimpleRng) {
        if let Some(gamma) = &self.gamma {
            gamma.reset(rng);
        }
        if let Some(beta) = &self.beta {
            beta.reset(rng);
        }
    }

    fn reflexive(&self) -> bool {
        true
    }

    fn weights(&self) -> Vec<Rc<Weights>> {
        match (&self.gamma, &self.beta) {
            (Some(g), Some(b)) => vec![Rc::clone(g), Rc::clone(b)],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPair;

    fn started(shape: Shape, batch: usize) -> (BatchNormLayer, Rc<BufferPair>) {
        let pair = BufferPair::new();
        pair.declare_sample_volume(shape.volume()).unwrap();
        let mut layer = BatchNormLayer::new();
        let mut rng = SimpleRng::new(3);
        layer
            .startup(
                shape,
                LayerBuffers::new(Rc::clone(&pair), Rc::clone(&pair)),
                batch,
                &mut rng,
            )
            .unwrap();
        pair.allocate(batch);
        (layer, pair)
    }

    #[test]
    fn test_normalizes_to_zero_mean_unit_variance() {
        let shape = Shape::new(4, 1, 1);
        let (layer, pair) = started(shape, 1);
        pair.activations_mut()[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.forward(1);

        let out = pair.activations();
        let mean: f32 = out[..4].iter().sum::<f32>() / 4.0;
        let var: f32 = out[..4].iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_zero_variance_channel_outputs_beta() {
        let shape = Shape::new(3, 1, 1);
        let (layer, pair) = started(shape, 1);
        layer.weights()[1].load(&[0.25]).unwrap();
        pair.activations_mut()[..3].fill(7.0);
        layer.forward(1);

        let out = pair.activations();
        assert!(out[..3].iter().all(|&y| (y - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_gamma_beta_gradients() {
        let shape = Shape::new(2, 1, 1);
        let (layer, pair) = started(shape, 1);
        pair.activations_mut()[..2].copy_from_slice(&[0.0, 2.0]);
        layer.forward(1);

        pair.gradients_mut()[..2].copy_from_slice(&[1.0, 1.0]);
        layer.backward(1, true);

        // beta gradient is the raw sum of incoming gradients; gamma gradient
        // pairs them with the antisymmetric normalized values.
        let weights = layer.weights();
        let gg = weights[0].gradient_mut();
        let bg = weights[1].gradient_mut();
        assert!(gg[0].abs() < 1e-4);
        assert!((bg[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_gradient_produces_zero_input_gradient() {
        // A uniform incoming gradient has no component orthogonal to the
        // mean/variance constraints, so the input gradient vanishes.
        let shape = Shape::new(4, 1, 1);
        let (layer, pair) = started(shape, 1);
        pair.activations_mut()[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.forward(1);

        pair.gradients_mut()[..4].fill(0.5);
        layer.backward(1, false);

        let grad = pair.gradients();
        assert!(grad[..4].iter().all(|&g| g.abs() < 1e-4));
    }
}
