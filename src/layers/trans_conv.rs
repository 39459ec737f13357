//! Transposed convolution: the contraction side of the geometry is the input.
//!
//! Runs the same three kernels as [`ConvolutionLayer`] with the roles
//! swapped: [`crate::kernels::scatter_expand`] produces the upsampled output,
//! [`crate::kernels::forward_contract`] pulls the gradient back down.
//!
//! [`ConvolutionLayer`]: crate::layers::ConvolutionLayer

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::geometry::LayerInfo;
use crate::initializer::Initializer;
use crate::kernels;
use crate::layers::{Layer, WeightedCore};
use crate::shape::Shape;
use crate::utils::SimpleRng;
use crate::weights::Weights;
use std::rc::Rc;

/// Stride-upsampling convolution transpose. Output spatial size per axis is
/// `(input - 1) * stride + filter_size`, the exact inverse of the
/// convolution formula for matching filter and stride.
pub struct TransConvLayer {
    filter_size: usize,
    stride: usize,
    output_dimensions: usize,
    info: Option<LayerInfo>,
    core: Option<WeightedCore>,
    io: Option<LayerBuffers>,
}

impl TransConvLayer {
    pub fn new(filter_size: usize, stride: usize, output_dimensions: usize) -> Self {
        Self {
            filter_size,
            stride,
            output_dimensions,
            info: None,
            core: None,
            io: None,
        }
    }

    pub fn info(&self) -> Option<&LayerInfo> {
        self.info.as_ref()
    }

    fn parts(&self) -> (&LayerInfo, &WeightedCore, &LayerBuffers) {
        (
            self.info.as_ref().expect("transposed convolution layer not started"),
            self.core.as_ref().expect("transposed convolution layer not started"),
            self.io.as_ref().expect("transposed convolution layer not started"),
        )
    }
}

impl Layer for TransConvLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(info) = &self.info {
            return Ok(info.expansion);
        }

        let info = LayerInfo::expand(self.filter_size, self.stride, input, self.output_dimensions)?;
        buffers.output.declare_sample_volume(info.expansion.volume())?;

        let taps = self.filter_size * self.filter_size;
        let init = Initializer::xavier(
            taps * input.dimensions,
            taps * self.output_dimensions,
        );
        self.core = Some(WeightedCore::new(
            info.filter_volume(),
            init,
            self.output_dimensions,
            max_batch * input.volume(),
            rng,
        ));
        let output = info.expansion;
        self.io = Some(buffers);
        self.info = Some(info);
        Ok(output)
    }

    fn forward(&self, batch_size: usize) {
        let (info, core, io) = self.parts();
        let out_shape = info.expansion;

        let input = io.input.activations();
        core.save_input(&input[..batch_size * info.contraction.volume()]);

        let weights = core.weights.values();
        let mut output = io.output.activations_mut();
        output[..batch_size * out_shape.volume()].fill(0.0);
        kernels::scatter_expand(info, &weights, &input, &mut output, batch_size);
        core.add_bias(&mut output, &out_shape, batch_size);
    }

    fn backward(&self, batch_size: usize, update: bool) {
        let (info, core, io) = self.parts();
        let out_shape = info.expansion;

        let grad_out = io.output.gradients();
        let weights = core.weights.values();
        {
            let mut grad_in = io.input.gradients_mut();
            grad_in[..batch_size * info.contraction.volume()].fill(0.0);
            kernels::forward_contract(info, &weights, &grad_out, &mut grad_in, batch_size);
        }

        if update {
            // Filter gradient pairs the contraction-side saved input with the
            // expansion-side incoming gradient.
            let saved = core.saved();
            let mut filter_grad = core.weights.gradient_mut();
            kernels::filter_gradient(info, &saved, &grad_out, &mut filter_grad, batch_size);
            drop(filter_grad);
            core.accumulate_bias_gradient(&grad_out, &out_shape, batch_size);
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
