//! Parameter initializer strategies.
//!
//! An explicit tagged union instead of a polymorphic initializer hierarchy:
//! each variant carries exactly the data it needs and serializes with a kind
//! tag, so descriptors round-trip without reflection.

use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};

/// How a weight vector is (re)initialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    /// Every element set to the same value. Used for biases (0.0) and batch
    /// norm scale (1.0).
    Constant { value: f32 },
    /// Uniform sample in [-limit, limit]. The Xavier limit for a layer with
    /// fan_in + fan_out = n is `sqrt(6 / n)`.
    Uniform { limit: f32 },
    /// Zero-mean Gaussian with variance `2 / fan_in` (He initialization,
    /// suited to rectifier activations).
    Gaussian { fan_in: usize },
}

impl Initializer {
    /// Xavier/Glorot uniform initializer for the given fan-in and fan-out.
    pub fn xavier(fan_in: usize, fan_out: usize) -> Self {
        Initializer::Uniform {
            limit: (6.0f32 / (fan_in + fan_out) as f32).sqrt(),
        }
    }

    /// Fill `values` according to the strategy.
    pub fn fill(&self, values: &mut [f32], rng: &mut SimpleRng) {
        match *self {
            Initializer::Constant { value } => values.fill(value),
            Initializer::Uniform { limit } => {
                for v in values.iter_mut() {
                    *v = rng.gen_range_f32(-limit, limit);
                }
            }
            Initializer::Gaussian { fan_in } => {
                let sigma = (2.0f32 / fan_in.max(1) as f32).sqrt();
                for v in values.iter_mut() {
                    *v = sigma * rng.next_gaussian();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_fill() {
        let mut rng = SimpleRng::new(1);
        let mut values = vec![9.0f32; 8];
        Initializer::Constant { value: 0.5 }.fill(&mut values, &mut rng);
        assert!(values.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = SimpleRng::new(42);
        let mut values = vec![0.0f32; 1000];
        let init = Initializer::xavier(100, 50);
        init.fill(&mut values, &mut rng);

        let limit = (6.0f32 / 150.0).sqrt();
        for &v in &values {
            assert!(v >= -limit && v <= limit);
        }
    }

    #[test]
    fn test_gaussian_variance() {
        let mut rng = SimpleRng::new(7);
        let mut values = vec![0.0f32; 20_000];
        Initializer::Gaussian { fan_in: 8 }.fill(&mut values, &mut rng);

        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
            / values.len() as f32;
        assert!(mean.abs() < 0.02);
        assert!((var - 0.25).abs() < 0.03); // 2 / 8
    }

    #[test]
    fn test_tagged_round_trip() {
        let init = Initializer::Uniform { limit: 0.1 };
        let json = serde_json::to_string(&init).unwrap();
        assert!(json.contains("\"kind\":\"uniform\""));
        let back: Initializer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, init);
    }
}
