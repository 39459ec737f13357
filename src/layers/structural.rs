//! Weightless layers that reroute or resample data: reshape, pooling,
//! upsampling, and the fork/concatenate pair that carries skip connections
//! through a [`TapChannel`].

use crate::buffers::LayerBuffers;
use crate::error::EngineError;
use crate::layers::Layer;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Side channel shared by one [`ForkLayer`] and one or more
/// [`ConcatenateLayer`]s. The fork deposits its activations here on the way
/// down; concatenations read them and deposit gradient on the way back up,
/// which the fork folds into the main gradient stream.
pub struct TapChannel {
    shape: Cell<Option<Shape>>,
    activations: RefCell<Vec<f32>>,
    gradients: RefCell<Vec<f32>>,
}

impl TapChannel {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            shape: Cell::new(None),
            activations: RefCell::new(Vec::new()),
            gradients: RefCell::new(Vec::new()),
        })
    }

    /// Shape of the forked activations, once the fork has started up.
    pub fn shape(&self) -> Option<Shape> {
        self.shape.get()
    }

    fn declare(&self, shape: Shape, max_batch: usize) {
        if self.shape.get().is_none() {
            self.shape.set(Some(shape));
            self.activations
                .borrow_mut()
                .resize(max_batch * shape.volume(), 0.0);
            self.gradients
                .borrow_mut()
                .resize(max_batch * shape.volume(), 0.0);
        }
    }
}

/// Reinterprets the sample volume under a new shape. Pure metadata: no data
/// moves, so the layer is reflexive and forward/backward are no-ops.
pub struct ReshapeLayer {
    target: Shape,
    started: bool,
}

impl ReshapeLayer {
    pub fn new(target: Shape) -> Self {
        Self {
            target,
            started: false,
        }
    }
}

impl Layer for ReshapeLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if self.started {
            return Ok(self.target);
        }
        if input.volume() != self.target.volume() {
            return Err(EngineError::ShapeMismatch(format!(
                "cannot reshape volume {} into {}x{}x{}",
                input.volume(),
                self.target.width,
                self.target.length,
                self.target.dimensions
            )));
        }
        buffers.output.declare_sample_volume(self.target.volume())?;
        self.started = true;
        Ok(self.target)
    }

    fn forward(&self, _batch_size: usize) {}

    fn backward(&self, _batch_size: usize, _update: bool) {}

    fn reflexive(&self) -> bool {
        true
    }
}

/// Mean pooling over non-overlapping `size x size` windows. Extents must be
/// divisible by the window size.
pub struct AveragePoolLayer {
    size: usize,
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    io: Option<LayerBuffers>,
}

impl AveragePoolLayer {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            input_shape: None,
            output_shape: None,
            io: None,
        }
    }

    fn parts(&self) -> (Shape, Shape, &LayerBuffers) {
        (
            self.input_shape.expect("average pool layer not started"),
            self.output_shape.expect("average pool layer not started"),
            self.io.as_ref().expect("average pool layer not started"),
        )
    }
}

impl Layer for AveragePoolLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.output_shape {
            return Ok(shape);
        }
        if input.width % self.size != 0 || input.length % self.size != 0 {
            return Err(EngineError::ConstraintUnsatisfiable(format!(
                "pool window {} does not tile a {}x{} extent",
                self.size, input.width, input.length
            )));
        }
        let output = Shape::new(
            input.width / self.size,
            input.length / self.size,
            input.dimensions,
        );
        buffers.output.declare_sample_volume(output.volume())?;
        self.io = Some(buffers);
        self.input_shape = Some(input);
        self.output_shape = Some(output);
        Ok(output)
    }

    fn forward(&self, batch_size: usize) {
        let (in_shape, out_shape, io) = self.parts();
        let inv = 1.0 / (self.size * self.size) as f32;

        let input = io.input.activations();
        let mut output = io.output.activations_mut();
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let in_base = in_shape.offset(b, d);
                let out_base = out_shape.offset(b, d);
                for oy in 0..out_shape.length {
                    for ox in 0..out_shape.width {
                        let mut acc = 0.0f32;
                        for wy in 0..self.size {
                            let row = in_base + (oy * self.size + wy) * in_shape.width;
                            for wx in 0..self.size {
                                acc += input[row + ox * self.size + wx];
                            }
                        }
                        output[out_base + oy * out_shape.width + ox] = acc * inv;
                    }
                }
            }
        }
    }

    fn backward(&self, batch_size: usize, _update: bool) {
        let (in_shape, out_shape, io) = self.parts();
        let inv = 1.0 / (self.size * self.size) as f32;

        let grad_out = io.output.gradients();
        let mut grad_in = io.input.gradients_mut();
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let in_base = in_shape.offset(b, d);
                let out_base = out_shape.offset(b, d);
                for oy in 0..out_shape.length {
                    for ox in 0..out_shape.width {
                        let g = grad_out[out_base + oy * out_shape.width + ox] * inv;
                        for wy in 0..self.size {
                            let row = in_base + (oy * self.size + wy) * in_shape.width;
                            for wx in 0..self.size {
                                grad_in[row + ox * self.size + wx] = g;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Nearest-neighbour upsampling by an integer factor.
pub struct UpsampleLayer {
    factor: usize,
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    io: Option<LayerBuffers>,
}

impl UpsampleLayer {
    pub fn new(factor: usize) -> Self {
        Self {
            factor,
            input_shape: None,
            output_shape: None,
            io: None,
        }
    }

    fn parts(&self) -> (Shape, Shape, &LayerBuffers) {
        (
            self.input_shape.expect("upsample layer not started"),
            self.output_shape.expect("upsample layer not started"),
            self.io.as_ref().expect("upsample layer not started"),
        )
    }
}

impl Layer for UpsampleLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.output_shape {
            return Ok(shape);
        }
        let output = Shape::new(
            input.width * self.factor,
            input.length * self.factor,
            input.dimensions,
        );
        buffers.output.declare_sample_volume(output.volume())?;
        self.io = Some(buffers);
        self.input_shape = Some(input);
        self.output_shape = Some(output);
        Ok(output)
    }

    fn forward(&self, batch_size: usize) {
        let (in_shape, out_shape, io) = self.parts();
        let input = io.input.activations();
        let mut output = io.output.activations_mut();
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let in_base = in_shape.offset(b, d);
                let out_base = out_shape.offset(b, d);
                for oy in 0..out_shape.length {
                    let in_row = in_base + (oy / self.factor) * in_shape.width;
                    let out_row = out_base + oy * out_shape.width;
                    for ox in 0..out_shape.width {
                        output[out_row + ox] = input[in_row + ox / self.factor];
                    }
                }
            }
        }
    }

    fn backward(&self, batch_size: usize, _update: bool) {
        let (in_shape, out_shape, io) = self.parts();
        let grad_out = io.output.gradients();
        let mut grad_in = io.input.gradients_mut();

        grad_in[..batch_size * in_shape.volume()].fill(0.0);
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let in_base = in_shape.offset(b, d);
                let out_base = out_shape.offset(b, d);
                for oy in 0..out_shape.length {
                    let in_row = in_base + (oy / self.factor) * in_shape.width;
                    let out_row = out_base + oy * out_shape.width;
                    for ox in 0..out_shape.width {
                        grad_in[in_row + ox / self.factor] += grad_out[out_row + ox];
                    }
                }
            }
        }
    }
}

/// Records the activation stream into a [`TapChannel`] and passes it through
/// unchanged. During backward, gradient deposited on the tap by downstream
/// concatenations is folded back into the main gradient.
pub struct ForkLayer {
    tap: Rc<TapChannel>,
    shape: Option<Shape>,
    io: Option<LayerBuffers>,
}

impl ForkLayer {
    pub fn new(tap: Rc<TapChannel>) -> Self {
        Self {
            tap,
            shape: None,
            io: None,
        }
    }
}

impl Layer for ForkLayer {
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
        self.tap.declare(input, max_batch);
        self.io = Some(buffers);
        self.shape = Some(input);
        Ok(input)
    }

    fn forward(&self, batch_size: usize) {
        let shape = self.shape.expect("fork layer not started");
        let io = self.io.as_ref().expect("fork layer not started");
        let len = batch_size * shape.volume();

        let data = io.input.activations();
        self.tap.activations.borrow_mut()[..len].copy_from_slice(&data[..len]);
    }

    fn backward(&self, batch_size: usize, _update: bool) {
        let shape = self.shape.expect("fork layer not started");
        let io = self.io.as_ref().expect("fork layer not started");
        let len = batch_size * shape.volume();

        let mut tap_grad = self.tap.gradients.borrow_mut();
        let mut grad = io.input.gradients_mut();
        for (g, t) in grad[..len].iter_mut().zip(&mut tap_grad[..len]) {
            *g += *t;
            *t = 0.0;
        }
    }

    fn reflexive(&self) -> bool {
        true
    }
}

/// Joins the tap's activations onto the channel axis of the main stream.
/// Spatial extents must agree with the fork's; output channel count is the
/// sum of both.
pub struct ConcatenateLayer {
    tap: Rc<TapChannel>,
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    io: Option<LayerBuffers>,
}

impl ConcatenateLayer {
    pub fn new(tap: Rc<TapChannel>) -> Self {
        Self {
            tap,
            input_shape: None,
            output_shape: None,
            io: None,
        }
    }

    fn parts(&self) -> (Shape, Shape, Shape, &LayerBuffers) {
        (
            self.input_shape.expect("concatenate layer not started"),
            self.tap.shape().expect("concatenate layer not started"),
            self.output_shape.expect("concatenate layer not started"),
            self.io.as_ref().expect("concatenate layer not started"),
        )
    }
}

impl Layer for ConcatenateLayer {
    fn startup(
        &mut self,
        input: Shape,
        buffers: LayerBuffers,
        _max_batch: usize,
        _rng: &mut SimpleRng,
    ) -> Result<Shape, EngineError> {
        if let Some(shape) = self.output_shape {
            return Ok(shape);
        }
        let tap_shape = self.tap.shape().ok_or_else(|| {
            EngineError::InvalidOperationAtUse(
                "concatenation placed before its fork".to_string(),
            )
        })?;
        if tap_shape.width != input.width || tap_shape.length != input.length {
            return Err(EngineError::ShapeMismatch(format!(
                "cannot concatenate {}x{} tap onto {}x{} stream",
                tap_shape.width, tap_shape.length, input.width, input.length
            )));
        }
        let output = input.with_dimensions(input.dimensions + tap_shape.dimensions);
        buffers.output.declare_sample_volume(output.volume())?;
        self.io = Some(buffers);
        self.input_shape = Some(input);
        self.output_shape = Some(output);
        Ok(output)
    }

    fn forward(&self, batch_size: usize) {
        let (in_shape, tap_shape, out_shape, io) = self.parts();
        let area = in_shape.area();

        let input = io.input.activations();
        let tap = self.tap.activations.borrow();
        let mut output = io.output.activations_mut();
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let src = in_shape.offset(b, d);
                let dst = out_shape.offset(b, d);
                output[dst..dst + area].copy_from_slice(&input[src..src + area]);
            }
            for d in 0..tap_shape.dimensions {
                let src = tap_shape.offset(b, d);
                let dst = out_shape.offset(b, in_shape.dimensions + d);
                output[dst..dst + area].copy_from_slice(&tap[src..src + area]);
            }
        }
    }

    fn backward(&self, batch_size: usize, _update: bool) {
        let (in_shape, tap_shape, out_shape, io) = self.parts();
        let area = in_shape.area();

        let grad_out = io.output.gradients();
        let mut tap_grad = self.tap.gradients.borrow_mut();
        let mut grad_in = io.input.gradients_mut();
        for b in 0..batch_size {
            for d in 0..in_shape.dimensions {
                let dst = in_shape.offset(b, d);
                let src = out_shape.offset(b, d);
                grad_in[dst..dst + area].copy_from_slice(&grad_out[src..src + area]);
            }
            for d in 0..tap_shape.dimensions {
                let dst = tap_shape.offset(b, d);
                let src = out_shape.offset(b, in_shape.dimensions + d);
                for (t, &g) in tap_grad[dst..dst + area]
                    .iter_mut()
                    .zip(&grad_out[src..src + area])
                {
                    *t += g;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPair;

    fn pair_for(volume: usize, batch: usize) -> Rc<BufferPair> {
        let pair = BufferPair::new();
        pair.declare_sample_volume(volume).unwrap();
        pair.allocate(batch);
        pair
    }

    #[test]
    fn test_reshape_volume_checked() {
        let mut rng = SimpleRng::new(1);
        let pair = BufferPair::new();
        let mut bad = ReshapeLayer::new(Shape::new(2, 2, 2));
        assert!(bad
            .startup(
                Shape::new(3, 3, 1),
                LayerBuffers::new(Rc::clone(&pair), Rc::clone(&pair)),
                1,
                &mut rng
            )
            .is_err());

        let mut ok = ReshapeLayer::new(Shape::new(9, 1, 1));
        let shape = ok
            .startup(
                Shape::new(3, 3, 1),
                LayerBuffers::new(Rc::clone(&pair), pair),
                1,
                &mut rng,
            )
            .unwrap();
        assert_eq!(shape, Shape::new(9, 1, 1));
    }

    #[test]
    fn test_average_pool_means_windows() {
        let input = Shape::new(4, 4, 1);
        let a = pair_for(input.volume(), 1);
        let b = BufferPair::new();
        let mut layer = AveragePoolLayer::new(2);
        let mut rng = SimpleRng::new(1);
        layer
            .startup(input, LayerBuffers::new(Rc::clone(&a), Rc::clone(&b)), 1, &mut rng)
            .unwrap();
        b.allocate(1);

        for (i, slot) in a.activations_mut()[..16].iter_mut().enumerate() {
            *slot = i as f32;
        }
        layer.forward(1);
        // Top-left window is {0, 1, 4, 5}.
        assert!((b.activations()[0] - 2.5).abs() < 1e-6);

        b.gradients_mut()[..4].fill(4.0);
        layer.backward(1, false);
        assert!(a.gradients()[..16].iter().all(|&g| (g - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_average_pool_rejects_non_tiling_window() {
        let mut layer = AveragePoolLayer::new(3);
        let mut rng = SimpleRng::new(1);
        let a = BufferPair::new();
        let b = BufferPair::new();
        assert!(layer
            .startup(Shape::new(4, 4, 1), LayerBuffers::new(a, b), 1, &mut rng)
            .is_err());
    }

    #[test]
    fn test_upsample_replicates_and_sums_back() {
        let input = Shape::new(2, 2, 1);
        let a = pair_for(input.volume(), 1);
        let b = BufferPair::new();
        let mut layer = UpsampleLayer::new(2);
        let mut rng = SimpleRng::new(1);
        let out = layer
            .startup(input, LayerBuffers::new(Rc::clone(&a), Rc::clone(&b)), 1, &mut rng)
            .unwrap();
        assert_eq!(out, Shape::new(4, 4, 1));
        b.allocate(1);

        a.activations_mut()[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.forward(1);
        let acts = b.activations();
        assert_eq!(acts[0], 1.0);
        assert_eq!(acts[1], 1.0);
        assert_eq!(acts[3], 2.0);
        assert_eq!(acts[5], 1.0);
        drop(acts);

        b.gradients_mut()[..16].fill(1.0);
        layer.backward(1, false);
        assert!(a.gradients()[..4].iter().all(|&g| (g - 4.0).abs() < 1e-6));
    }

    #[test]
    fn test_fork_concatenate_round_trip() {
        let mut rng = SimpleRng::new(1);
        let shape = Shape::new(2, 1, 1);
        let tap = TapChannel::new();

        let main = pair_for(shape.volume(), 1);
        let mut fork = ForkLayer::new(Rc::clone(&tap));
        fork.startup(
            shape,
            LayerBuffers::new(Rc::clone(&main), Rc::clone(&main)),
            1,
            &mut rng,
        )
        .unwrap();

        let out = BufferPair::new();
        let mut concat = ConcatenateLayer::new(Rc::clone(&tap));
        let out_shape = concat
            .startup(
                shape,
                LayerBuffers::new(Rc::clone(&main), Rc::clone(&out)),
                1,
                &mut rng,
            )
            .unwrap();
        assert_eq!(out_shape, Shape::new(2, 1, 2));
        out.allocate(1);

        main.activations_mut()[..2].copy_from_slice(&[1.0, 2.0]);
        fork.forward(1);
        concat.forward(1);
        assert_eq!(&out.activations()[..4], &[1.0, 2.0, 1.0, 2.0]);

        out.gradients_mut()[..4].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        concat.backward(1, false);
        fork.backward(1, false);
        // Main half plus the tap half folded back in.
        let grad = main.gradients();
        assert!((grad[0] - 0.4).abs() < 1e-6);
        assert!((grad[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_concatenate_before_fork_is_error() {
        let tap = TapChannel::new();
        let mut layer = ConcatenateLayer::new(tap);
        let mut rng = SimpleRng::new(1);
        let a = BufferPair::new();
        let b = BufferPair::new();
        assert!(matches!(
            layer.startup(Shape::new(2, 2, 1), LayerBuffers::new(a, b), 1, &mut rng),
            Err(EngineError::InvalidOperationAtUse(_))
        ));
    }
}
