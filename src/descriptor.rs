//! Serializable pipeline descriptions.
//!
//! A [`NetworkDescriptor`] is the persistent form of a pipeline: an ordered
//! list of layer descriptors plus the seed that makes weight initialization
//! reproducible. Descriptors carry exactly the parameters needed to
//! reconstruct each layer; geometry is re-derived at startup, never stored.

use crate::layers::ActivationKind;
use crate::shape::Shape;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;

/// One layer, as configuration. Tagged by the `layer` field in JSON, e.g.
/// `{"layer": "convolution", "filter_size": 3, "stride": 1,
/// "output_dimensions": 8}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum LayerDescriptor {
    Input {
        shape: Shape,
    },
    Convolution {
        filter_size: usize,
        stride: usize,
        output_dimensions: usize,
    },
    TransConvolution {
        filter_size: usize,
        stride: usize,
        output_dimensions: usize,
    },
    Dense {
        units: usize,
    },
    BatchNorm,
    Activation {
        #[serde(flatten)]
        kind: ActivationKind,
    },
    /// Hook for an externally supplied augmentation transform; the transform
    /// itself is a runtime collaborator and is never serialized.
    Augmentation,
    Reshape {
        shape: Shape,
    },
    AveragePool {
        size: usize,
    },
    Upsample {
        factor: usize,
    },
    Fork {
        tap: usize,
    },
    Concatenate {
        tap: usize,
    },
}

/// A whole pipeline as configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub layers: Vec<LayerDescriptor>,
    pub seed: u64,
}

impl NetworkDescriptor {
    pub fn new(seed: u64) -> Self {
        Self {
            layers: Vec::new(),
            seed,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a descriptor from a JSON file.
    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::from_json(&contents)?)
    }

    /// Write the descriptor to a JSON file.
    pub fn save(&self, path: &str) -> Result<(), Box<dyn Error>> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
