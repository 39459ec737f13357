//! Paired activation/gradient buffers with ping-pong reuse.
//!
//! A [`BufferPair`] models the two device memory regions a layer touches:
//! activations flowing forward and gradients flowing backward. The network
//! threads two shared pairs through the layer list; each non-reflexive layer
//! reads one pair and writes its complement, so consecutive layers alternate
//! which physical region is "input" and which is "output" instead of each
//! allocating fresh memory. Reflexive layers (batch norm, activations,
//! reshape) read and write in place and do not trigger a swap.
//!
//! Capacity is negotiated before allocation: every layer declares during
//! startup how much contiguous space one batch element of its output needs,
//! declarations only ever enlarge the requirement, and a single `allocate`
//! call sizes both regions to the maximum once all layers have registered.

use crate::error::EngineError;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

/// One physical buffer pair: an activation region and a gradient region,
/// each sized `sample_volume * max_batch` floats after allocation.
#[derive(Debug, Default)]
pub struct BufferPair {
    activations: RefCell<Vec<f32>>,
    gradients: RefCell<Vec<f32>>,
    sample_volume: Cell<usize>,
    ready: Cell<bool>,
}

impl BufferPair {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Declare that one batch element written into this pair needs at least
    /// `volume` floats. Monotonic: a smaller declaration never shrinks the
    /// requirement. Declaring a larger requirement after allocation is an
    /// error: the memory is already committed.
    pub fn declare_sample_volume(&self, volume: usize) -> Result<(), EngineError> {
        if self.ready.get() {
            if volume > self.sample_volume.get() {
                return Err(EngineError::InvalidOperationAtUse(format!(
                    "buffer already allocated for {} floats per sample, cannot grow to {}",
                    self.sample_volume.get(),
                    volume
                )));
            }
            return Ok(());
        }
        if volume > self.sample_volume.get() {
            self.sample_volume.set(volume);
        }
        Ok(())
    }

    /// Largest per-sample volume declared so far.
    pub fn sample_volume(&self) -> usize {
        self.sample_volume.get()
    }

    /// Perform the one-time allocation for `max_batch` batch elements.
    /// Idempotent: a pair that is already allocated is left untouched, so a
    /// network may be started up repeatedly (architecture search) without
    /// re-allocating.
    pub fn allocate(&self, max_batch: usize) {
        if self.ready.get() {
            return;
        }
        let len = self.sample_volume.get() * max_batch;
        self.activations.borrow_mut().resize(len, 0.0);
        self.gradients.borrow_mut().resize(len, 0.0);
        self.ready.set(true);
    }

    /// Whether `allocate` has run.
    pub fn ready(&self) -> bool {
        self.ready.get()
    }

    /// Read view of the activation region.
    ///
    /// # Panics
    ///
    /// Panics if the gradient of the same region is mutably borrowed, or if
    /// the pair is not yet allocated (both are layer-contract violations).
    pub fn activations(&self) -> Ref<'_, Vec<f32>> {
        debug_assert!(self.ready.get(), "buffer pair used before allocation");
        self.activations.borrow()
    }

    /// Write view of the activation region.
    pub fn activations_mut(&self) -> RefMut<'_, Vec<f32>> {
        debug_assert!(self.ready.get(), "buffer pair used before allocation");
        self.activations.borrow_mut()
    }

    /// Read view of the gradient region.
    pub fn gradients(&self) -> Ref<'_, Vec<f32>> {
        debug_assert!(self.ready.get(), "buffer pair used before allocation");
        self.gradients.borrow()
    }

    /// Write view of the gradient region.
    pub fn gradients_mut(&self) -> RefMut<'_, Vec<f32>> {
        debug_assert!(self.ready.get(), "buffer pair used before allocation");
        self.gradients.borrow_mut()
    }
}

/// The two pairs a layer sees: where it reads and where it writes.
///
/// For reflexive layers `input` and `output` are the same pair; everyone else
/// holds complements of one another.
#[derive(Clone)]
pub struct LayerBuffers {
    pub input: Rc<BufferPair>,
    pub output: Rc<BufferPair>,
}

impl LayerBuffers {
    pub fn new(input: Rc<BufferPair>, output: Rc<BufferPair>) -> Self {
        Self { input, output }
    }

    /// Whether this layer operates in place.
    pub fn reflexive(&self) -> bool {
        Rc::ptr_eq(&self.input, &self.output)
    }
}
