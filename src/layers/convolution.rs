//! Strided convolution: the contraction side of the geometry is the output.

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

/// Convolution with a square `filter_size` window and `stride` step,
/// downsampling the spatial extent. Output spatial size per axis is
/// `(input - filter_size) / stride + 1`; non-divisible extents are a startup
/// error.
///
/// Weights hold `filter_size^2 * input_dims * output_dims` coefficients; the
/// bias has one value per output channel.
pub struct ConvolutionLayer {
    filter_size: usize,
    stride: usize,
    output_dimensions: usize,
    info: Option<LayerInfo>,
    core: Option<WeightedCore>,
    io: Option<LayerBuffers>,
}

impl ConvolutionLayer {
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
            self.info.as_ref().expect("convolution layer not started"),
            self.core.as_ref().expect("convolution layer not started"),
            self.io.as_ref().expect("convolution layer not started"),
        )
    }
}

impl Layer for ConvolutionLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(info) = &self.info {
            return Ok(info.contraction);
        }

        let info = LayerInfo::contract(self.filter_size, self.stride, input, self.output_dimensions)?;
        buffers.output.declare_sample_volume(info.contraction.volume())?;

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
        let output = info.contraction;
        self.io = Some(buffers);
        self.info = Some(info);
        Ok(output)
    }

    fn forward(&self, batch_size: usize) {
        let (info, core, io) = self.parts();
        let out_shape = info.contraction;

        let input = io.input.activations();
        // The input region will be recycled by later layers; keep the copy
        // the filter-gradient kernel needs.
        core.save_input(&input[..batch_size * info.expansion.volume()]);

        let weights = core.weights.values();
        let mut output = io.output.activations_mut();
        output[..batch_size * out_shape.volume()].fill(0.0);
        kernels::forward_contract(info, &weights, &input, &mut output, batch_size);
        core.add_bias(&mut output, &out_shape, batch_size);
    }

    fn backward(&self, batch_size: usize, update: bool) {
        let (info, core, io) = self.parts();
        let out_shape = info.contraction;

        let grad_out = io.output.gradients();
        let weights = core.weights.values();
        {
            let mut grad_in = io.input.gradients_mut();
            grad_in[..batch_size * info.expansion.volume()].fill(0.0);
            kernels::scatter_expand(info, &weights, &grad_out, &mut grad_in, batch_size);
        }

        if update {
            let saved = core.saved();
            let mut filter_grad = core.weights.gradient_mut();
            kernels::filter_gradient(info, &grad_out, &saved, &mut filter_grad, batch_size);
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
