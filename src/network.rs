//! Network orchestration: descriptor list, layer construction, buffer
//! threading, and the train/test/generate entry points.

use crate::buffers::{BufferPair, LayerBuffers};
use crate::descriptor::{LayerDescriptor, NetworkDescriptor};
use crate::error::EngineError;
use crate::layers::{
    ActivationKind, ActivationLayer, Augmentation, AugmentationLayer, AveragePoolLayer,
    BatchNormLayer, ConcatenateLayer, ConvolutionLayer, DenseLayer, ForkLayer, InputLayer, Layer,
    ReshapeLayer, TapChannel, TransConvLayer, UpsampleLayer,
};
use crate::loss::Loss;
use crate::shape::Shape;
use crate::utils::SimpleRng;
use crate::weights::{AdamParams, Weights};
use crate::Tensor;
use std::collections::HashMap;
use std::rc::Rc;

/// A pipeline of layers plus everything needed to drive it: the two shared
/// buffer pairs, the weights registry, the Adam schedule, and the loss
/// collaborator.
///
/// Built in two phases. The `add_*` builder methods only append descriptors;
/// [`Network::startup`] resolves them into concrete layers, threads shapes
/// and buffers through every `Layer::startup`, and allocates memory. Using
/// the training surface before startup is `InvalidOperationAtUse`.
pub struct Network {
    descriptor: NetworkDescriptor,
    loss: Box<dyn Loss>,
    hyper: AdamParams,
    rng: SimpleRng,
    augmentations: Vec<Option<Rc<dyn Augmentation>>>,
    input: Option<InputLayer>,
    layers: Vec<Box<dyn Layer>>,
    registry: Vec<Rc<Weights>>,
    output_shape: Option<Shape>,
    output_pair: Option<Rc<BufferPair>>,
    max_batch: usize,
    ready: bool,
}

impl Network {
    pub fn new(loss: Box<dyn Loss>, learning_rate: f32, seed: u64) -> Self {
        Self::from_descriptor(NetworkDescriptor::new(seed), loss, learning_rate)
    }

    /// Rebuild a network from a deserialized descriptor. Weights are freshly
    /// initialized from the descriptor's seed.
    pub fn from_descriptor(
        descriptor: NetworkDescriptor,
        loss: Box<dyn Loss>,
        learning_rate: f32,
    ) -> Self {
        let rng = SimpleRng::new(descriptor.seed);
        Self {
            descriptor,
            loss,
            hyper: AdamParams::default_params(learning_rate),
            rng,
            augmentations: Vec::new(),
            input: None,
            layers: Vec::new(),
            registry: Vec::new(),
            output_shape: None,
            output_pair: None,
            max_batch: 0,
            ready: false,
        }
    }

    pub fn descriptor(&self) -> &NetworkDescriptor {
        &self.descriptor
    }

    pub fn hyperparameters(&self) -> &AdamParams {
        &self.hyper
    }

    /// Shape of the final layer's output, once started.
    pub fn output_shape(&self) -> Option<Shape> {
        self.output_shape
    }

    // Builder surface. Each call appends a descriptor; nothing is constructed
    // until startup.

    pub fn add_input(&mut self, shape: Shape) -> &mut Self {
        self.push(LayerDescriptor::Input { shape })
    }

    pub fn add_convolution(
        &mut self,
        filter_size: usize,
        stride: usize,
        output_dimensions: usize,
    ) -> &mut Self {
        self.push(LayerDescriptor::Convolution {
            filter_size,
            stride,
            output_dimensions,
        })
    }

    pub fn add_trans_conv(
        &mut self,
        filter_size: usize,
        stride: usize,
        output_dimensions: usize,
    ) -> &mut Self {
        self.push(LayerDescriptor::TransConvolution {
            filter_size,
            stride,
            output_dimensions,
        })
    }

    pub fn add_dense(&mut self, units: usize) -> &mut Self {
        self.push(LayerDescriptor::Dense { units })
    }

    pub fn add_batch_norm(&mut self) -> &mut Self {
        self.push(LayerDescriptor::BatchNorm)
    }

    pub fn add_activation(&mut self, kind: ActivationKind) -> &mut Self {
        self.push(LayerDescriptor::Activation { kind })
    }

    /// Augmentation hook with no installed transform: an identity layer.
    pub fn add_augmentation(&mut self) -> &mut Self {
        self.augmentations.push(None);
        self.push(LayerDescriptor::Augmentation)
    }

    /// Augmentation hook driven by an external transform collaborator. The
    /// collaborator is runtime state: a network rebuilt from the serialized
    /// descriptor gets the identity hook instead.
    pub fn add_augmentation_with(&mut self, transform: Rc<dyn Augmentation>) -> &mut Self {
        self.augmentations.push(Some(transform));
        self.push(LayerDescriptor::Augmentation)
    }

    pub fn add_reshape(&mut self, shape: Shape) -> &mut Self {
        self.push(LayerDescriptor::Reshape { shape })
    }

    pub fn add_avg_pool(&mut self, size: usize) -> &mut Self {
        self.push(LayerDescriptor::AveragePool { size })
    }

    pub fn add_upsample(&mut self, factor: usize) -> &mut Self {
        self.push(LayerDescriptor::Upsample { factor })
    }

    pub fn add_fork(&mut self, tap: usize) -> &mut Self {
        self.push(LayerDescriptor::Fork { tap })
    }

    /// Alias for [`Network::add_fork`], the skip-connection exit point.
    pub fn add_skip_out(&mut self, tap: usize) -> &mut Self {
        self.add_fork(tap)
    }

    pub fn add_concatenation(&mut self, tap: usize) -> &mut Self {
        self.push(LayerDescriptor::Concatenate { tap })
    }

    fn push(&mut self, descriptor: LayerDescriptor) -> &mut Self {
        self.descriptor.layers.push(descriptor);
        self
    }

    /// Resolve descriptors into layers, thread shapes and buffer pairs
    /// through every layer startup, collect the weights registry, allocate
    /// both pairs, and hand the final shape and pair to the loss.
    ///
    /// Idempotent: a started network returns immediately.
    ///
    /// # Errors
    ///
    /// `InvalidOperationAtUse` when the descriptor list is empty or does not
    /// begin with an input layer, plus whatever the individual layer startups
    /// raise (`ShapeMismatch`, `ConstraintUnsatisfiable`).
    pub fn startup(&mut self, max_batch: usize) -> Result<(), EngineError> {
        if self.ready {
            return Ok(());
        }

        let mut descriptors = self.descriptor.layers.iter();
        let input_shape = match descriptors.next() {
            Some(LayerDescriptor::Input { shape }) => *shape,
            _ => {
                return Err(EngineError::InvalidOperationAtUse(
                    "pipeline must begin with an input layer".to_string(),
                ))
            }
        };

        let pair_a = BufferPair::new();
        let pair_b = BufferPair::new();
        let mut current = Rc::clone(&pair_a);
        let mut other = Rc::clone(&pair_b);

        let mut input = InputLayer::new(input_shape);
        let mut shape = input.startup(
            input_shape,
            LayerBuffers::new(Rc::clone(&current), Rc::clone(&current)),
            max_batch,
            &mut self.rng,
        )?;

        let mut taps: HashMap<usize, Rc<TapChannel>> = HashMap::new();
        let mut transforms = self.augmentations.iter();
        let mut layers: Vec<Box<dyn Layer>> = Vec::new();
        let mut registry: Vec<Rc<Weights>> = Vec::new();
        for descriptor in descriptors {
            let mut layer = build_layer(descriptor, &mut taps, &mut transforms);
            let buffers = if layer.reflexive() {
                LayerBuffers::new(Rc::clone(&current), Rc::clone(&current))
            } else {
                LayerBuffers::new(Rc::clone(&current), Rc::clone(&other))
            };
            shape = layer.startup(shape, buffers, max_batch, &mut self.rng)?;
            if !layer.reflexive() {
                std::mem::swap(&mut current, &mut other);
            }
            registry.extend(layer.weights());
            layers.push(layer);
        }

        pair_a.allocate(max_batch);
        pair_b.allocate(max_batch);
        self.loss.startup(Rc::clone(&current), shape, max_batch);

        self.input = Some(input);
        self.layers = layers;
        self.registry = registry;
        self.output_shape = Some(shape);
        self.output_pair = Some(current);
        self.max_batch = max_batch;
        self.ready = true;
        Ok(())
    }

    fn check_batch(&self, batch_size: usize) -> Result<(), EngineError> {
        if !self.ready {
            return Err(EngineError::InvalidOperationAtUse(
                "network used before startup".to_string(),
            ));
        }
        if batch_size > self.max_batch {
            return Err(EngineError::InvalidOperationAtUse(format!(
                "batch of {} exceeds startup capacity {}",
                batch_size, self.max_batch
            )));
        }
        Ok(())
    }

    fn run_forward(&self, inputs: &[Tensor]) -> Result<(), EngineError> {
        self.check_batch(inputs.len())?;
        let input = self.input.as_ref().ok_or_else(|| {
            EngineError::InvalidOperationAtUse("network used before startup".to_string())
        })?;
        input.set_input(inputs)?;

        let batch = inputs.len();
        input.forward(batch);
        for layer in &self.layers {
            layer.forward(batch);
        }
        Ok(())
    }

    /// Forward-only pass; reads back one output tensor per batch element.
    pub fn generate(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError> {
        self.run_forward(inputs)?;

        let (shape, pair) = match (self.output_shape, self.output_pair.as_ref()) {
            (Some(shape), Some(pair)) => (shape, pair),
            _ => {
                return Err(EngineError::InvalidOperationAtUse(
                    "network used before startup".to_string(),
                ))
            }
        };
        let volume = shape.volume();
        let activations = pair.activations();
        Ok((0..inputs.len())
            .map(|b| activations[b * volume..(b + 1) * volume].to_vec())
            .collect())
    }

    /// Forward plus loss, no backward. Returns `(loss, aux_metric)`.
    pub fn test(
        &self,
        inputs: &[Tensor],
        expected: &[Tensor],
    ) -> Result<(f32, f32), EngineError> {
        if inputs.len() != expected.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "{} inputs but {} ground-truth tensors",
                inputs.len(),
                expected.len()
            )));
        }
        self.run_forward(inputs)?;
        Ok(self.loss.compute(expected))
    }

    /// One full step: forward, loss, backward in reverse, and, when
    /// `update`, one Adam application across the registry.
    ///
    /// A NaN loss aborts the step after the forward pass: no gradient is
    /// propagated and no weights move.
    pub fn train(
        &self,
        inputs: &[Tensor],
        expected: &[Tensor],
        update: bool,
    ) -> Result<(f32, f32), EngineError> {
        if inputs.len() != expected.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "{} inputs but {} ground-truth tensors",
                inputs.len(),
                expected.len()
            )));
        }
        self.run_forward(inputs)?;
        let (loss, aux) = self.loss.compute(expected);
        if loss.is_nan() {
            return Ok((loss, aux));
        }

        let batch = inputs.len();
        for layer in self.layers.iter().rev() {
            layer.backward(batch, update);
        }

        if update {
            self.hyper.advance();
            for weights in &self.registry {
                weights.update(&self.hyper)?;
            }
        }

        #[cfg(debug_assertions)]
        for weights in &self.registry {
            debug_assert_eq!(weights.live_count(), 0, "weights view leaked during step");
            debug_assert_eq!(
                weights.gradient_live_count(),
                0,
                "gradient view leaked during step"
            );
        }

        Ok((loss, aux))
    }

    /// Reinitialize every layer's weights from the descriptor seed's stream.
    pub fn reset(&mut self) {
        if let Some(input) = &mut self.input {
            input.reset(&mut self.rng);
        }
        for layer in &mut self.layers {
            layer.reset(&mut self.rng);
        }
    }

    /// Every registered weight tensor, in layer order (main weights before
    /// bias within each layer).
    pub fn weights(&self) -> &[Rc<Weights>] {
        &self.registry
    }

    /// Snapshot of every registered weight tensor, in registry order.
    pub fn weight_snapshots(&self) -> Vec<Vec<f32>> {
        self.registry.iter().map(|w| w.snapshot()).collect()
    }
}

fn build_layer<'a>(
    descriptor: &LayerDescriptor,
    taps: &mut HashMap<usize, Rc<TapChannel>>,
    transforms: &mut impl Iterator<Item = &'a Option<Rc<dyn Augmentation>>>,
) -> Box<dyn Layer> {
    match descriptor {
        LayerDescriptor::Input { shape } => Box::new(InputLayer::new(*shape)),
        LayerDescriptor::Convolution {
            filter_size,
            stride,
            output_dimensions,
        } => Box::new(ConvolutionLayer::new(*filter_size, *stride, *output_dimensions)),
        LayerDescriptor::TransConvolution {
            filter_size,
            stride,
            output_dimensions,
        } => Box::new(TransConvLayer::new(*filter_size, *stride, *output_dimensions)),
        LayerDescriptor::Dense { units } => Box::new(DenseLayer::new(*units)),
        LayerDescriptor::BatchNorm => Box::new(BatchNormLayer::new()),
        LayerDescriptor::Activation { kind } => Box::new(ActivationLayer::new(*kind)),
        LayerDescriptor::Augmentation => {
            // Transforms are registered in builder order; a deserialized
            // descriptor has none registered and resolves to the identity.
            let transform = transforms.next().and_then(Option::clone);
            Box::new(AugmentationLayer::new(transform))
        }
        LayerDescriptor::Reshape { shape } => Box::new(ReshapeLayer::new(*shape)),
        LayerDescriptor::AveragePool { size } => Box::new(AveragePoolLayer::new(*size)),
        LayerDescriptor::Upsample { factor } => Box::new(UpsampleLayer::new(*factor)),
        LayerDescriptor::Fork { tap } => {
            let channel = Rc::clone(taps.entry(*tap).or_insert_with(TapChannel::new));
            Box::new(ForkLayer::new(channel))
        }
        LayerDescriptor::Concatenate { tap } => {
            let channel = Rc::clone(taps.entry(*tap).or_insert_with(TapChannel::new));
            Box::new(ConcatenateLayer::new(channel))
        }
    }
}
