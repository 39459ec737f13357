//! Neural Engine
//!
//! A from-scratch neural-network execution engine: trainable layer
//! primitives, a shape/indexing algebra shared by convolution and its
//! transpose, double-buffered activation/gradient memory with ping-pong
//! reuse, parameter storage with built-in Adam state, and a network
//! orchestrator that drives forward/backward/update passes.
//!
//! # Modules
//!
//! - `shape` / `geometry`: tensor shapes and the contraction/expansion
//!   algebra that drives the convolution kernels
//! - `buffers`: paired activation/gradient buffers threaded through layers
//! - `weights`: trainable tensors with live-count borrowing and Adam state
//! - `kernels`: the three shared convolution-family compute kernels
//! - `layers`: the `Layer` contract and every concrete layer
//! - `loss`: loss collaborators seeding the backward pass
//! - `descriptor` / `network`: serializable pipeline descriptions and the
//!   orchestrator built from them
//!
//! # Example
//!
//! ```
//! use neural_engine::loss::MeanSquaredError;
//! use neural_engine::layers::ActivationKind;
//! use neural_engine::network::Network;
//! use neural_engine::shape::Shape;
//!
//! let mut network = Network::new(Box::new(MeanSquaredError::new()), 0.01, 42);
//! network
//!     .add_input(Shape::new(2, 1, 1))
//!     .add_dense(4)
//!     .add_activation(ActivationKind::Tanh)
//!     .add_dense(1);
//! network.startup(4).unwrap();
//!
//! let inputs = vec![vec![0.0, 1.0]];
//! let targets = vec![vec![1.0]];
//! let (loss, _) = network.train(&inputs, &targets, true).unwrap();
//! assert!(loss.is_finite());
//! ```

pub mod buffers;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod initializer;
pub mod kernels;
pub mod layers;
pub mod loss;
pub mod network;
pub mod shape;
pub mod utils;
pub mod weights;

/// One sample's flat activation data.
pub type Tensor = Vec<f32>;

pub use descriptor::{LayerDescriptor, NetworkDescriptor};
pub use error::EngineError;
pub use geometry::LayerInfo;
pub use network::Network;
pub use shape::Shape;
pub use weights::{AdamParams, Weights};
