//! Trainable parameter storage with built-in Adam state.
//!
//! A [`Weights`] object is the single source of truth for one layer's
//! trainable tensor: the flat parameter vector, its gradient accumulator, and
//! the Adam first/second moment vectors, all the same length. Access goes
//! through reference-counted views so the backing memory is handed out once,
//! used by however many kernel launches need it, and only considered free for
//! reuse when every borrower has finished; the explicit live counter stands
//! in for device-side borrow checking.

use crate::error::EngineError;
use crate::initializer::Initializer;
use crate::utils::SimpleRng;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Adam hyperparameters plus the shared step counter that drives bias
/// correction. One instance is owned by the network and advanced exactly once
/// per training step, before the per-weights updates run.
#[derive(Debug)]
pub struct AdamParams {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    step: Cell<u32>,
}

impl AdamParams {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: Cell::new(0),
        }
    }

    /// The paper's defaults: lr 0.001, betas 0.9/0.999, epsilon 1e-8.
    pub fn default_params(learning_rate: f32) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }

    /// Advance the time-dependent bias-correction term. Called once per
    /// training step.
    pub fn advance(&self) {
        self.step.set(self.step.get() + 1);
    }

    pub fn step(&self) -> u32 {
        self.step.get()
    }

    /// Bias-corrected step size: `lr * sqrt(1 - beta2^t) / (1 - beta1^t)`.
    ///
    /// Folding the correction into the rate lets the per-element update use
    /// the raw moments directly.
    pub fn corrected_learning_rate(&self) -> f32 {
        let t = self.step.get();
        if t == 0 {
            return self.learning_rate;
        }
        let c1 = 1.0 - self.beta1.powi(t as i32);
        let c2 = 1.0 - self.beta2.powi(t as i32);
        self.learning_rate * c2.sqrt() / c1
    }
}

/// Read view of a parameter vector. Holding one pins the buffer: the live
/// counter stays positive until the view drops.
pub struct WeightsView<'a> {
    data: Ref<'a, Vec<f32>>,
    counter: &'a Cell<i64>,
}

impl Deref for WeightsView<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl Drop for WeightsView<'_> {
    fn drop(&mut self) {
        let count = self.counter.get();
        debug_assert!(count > 0, "weights view released below zero");
        self.counter.set(count - 1);
    }
}

/// Write view of a gradient accumulator, with the same pinning semantics.
pub struct GradientView<'a> {
    data: RefMut<'a, Vec<f32>>,
    counter: &'a Cell<i64>,
}

impl Deref for GradientView<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for GradientView<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for GradientView<'_> {
    fn drop(&mut self) {
        let count = self.counter.get();
        debug_assert!(count > 0, "gradient view released below zero");
        self.counter.set(count - 1);
    }
}

/// One layer's trainable tensor and its optimizer state.
pub struct Weights {
    values: RefCell<Vec<f32>>,
    gradient: RefCell<Vec<f32>>,
    moment1: RefCell<Vec<f32>>,
    moment2: RefCell<Vec<f32>>,
    live: Cell<i64>,
    gradient_live: Cell<i64>,
    initializer: Cell<Initializer>,
}

impl Weights {
    /// Allocate a weight vector of exactly `len` elements and initialize it.
    pub fn new(len: usize, initializer: Initializer, rng: &mut SimpleRng) -> Rc<Self> {
        let mut values = vec![0.0f32; len];
        initializer.fill(&mut values, rng);
        Rc::new(Self {
            values: RefCell::new(values),
            gradient: RefCell::new(vec![0.0; len]),
            moment1: RefCell::new(vec![0.0; len]),
            moment2: RefCell::new(vec![0.0; len]),
            live: Cell::new(0),
            gradient_live: Cell::new(0),
            initializer: Cell::new(initializer),
        })
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the parameter vector for a kernel launch. Increments the live
    /// counter; the matching decrement happens when the view drops.
    pub fn values(&self) -> WeightsView<'_> {
        self.live.set(self.live.get() + 1);
        WeightsView {
            data: self.values.borrow(),
            counter: &self.live,
        }
    }

    /// Borrow the gradient accumulator for a kernel launch.
    pub fn gradient_mut(&self) -> GradientView<'_> {
        self.gradient_live.set(self.gradient_live.get() + 1);
        GradientView {
            data: self.gradient.borrow_mut(),
            counter: &self.gradient_live,
        }
    }

    /// Outstanding borrows of the parameter vector.
    pub fn live_count(&self) -> i64 {
        self.live.get()
    }

    /// Outstanding borrows of the gradient accumulator.
    pub fn gradient_live_count(&self) -> i64 {
        self.gradient_live.get()
    }

    /// Copy of the current parameter values (persistence, tests).
    pub fn snapshot(&self) -> Vec<f32> {
        self.values.borrow().clone()
    }

    /// Overwrite the parameter values, e.g. from a deserialized record.
    pub fn load(&self, data: &[f32]) -> Result<(), EngineError> {
        let mut values = self.values.borrow_mut();
        if data.len() != values.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "weight record has {} elements, layer declares {}",
                data.len(),
                values.len()
            )));
        }
        values.copy_from_slice(data);
        Ok(())
    }

    /// Apply one Adam step with the gradient accumulated since the previous
    /// update, then zero the gradient for the next pass.
    ///
    /// # Errors
    ///
    /// `InvalidOperationAtUse` while any view of the parameters or gradient
    /// is still live: the buffers may not be rewritten under a borrower.
    pub fn update(&self, hyper: &AdamParams) -> Result<(), EngineError> {
        if self.live.get() != 0 || self.gradient_live.get() != 0 {
            return Err(EngineError::InvalidOperationAtUse(format!(
                "weight update with {} weight / {} gradient views outstanding",
                self.live.get(),
                self.gradient_live.get()
            )));
        }

        let mut values = self.values.borrow_mut();
        let mut gradient = self.gradient.borrow_mut();
        let mut m = self.moment1.borrow_mut();
        let mut v = self.moment2.borrow_mut();

        let alpha = hyper.corrected_learning_rate();
        let (beta1, beta2, eps) = (hyper.beta1, hyper.beta2, hyper.epsilon);

        for i in 0..values.len() {
            let g = gradient[i];
            m[i] = beta1 * m[i] + (1.0 - beta1) * g;
            v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
            values[i] -= alpha * m[i] / (v[i].sqrt() + eps);
            gradient[i] = 0.0;
        }
        Ok(())
    }

    /// Reinitialize the parameters from the stored strategy and zero the
    /// gradient and both moments.
    pub fn reset(&self, rng: &mut SimpleRng) {
        self.initializer.get().fill(&mut self.values.borrow_mut(), rng);
        self.gradient.borrow_mut().fill(0.0);
        self.moment1.borrow_mut().fill(0.0);
        self.moment2.borrow_mut().fill(0.0);
    }
}
