//! Tensor shape bookkeeping.
//!
//! Every layer describes the data it consumes and produces with a [`Shape`]:
//! spatial width and length plus a channel (dimension) count. Shapes are
//! immutable values; a layer that changes geometry computes a new `Shape`
//! rather than mutating one in place.

use serde::{Deserialize, Serialize};

/// Spatial width, spatial length, and channel count of one tensor.
///
/// The derived quantities are `area = width * length` (one channel of one
/// sample) and `volume = area * dimensions` (one whole sample). Flat buffers
/// store batches as `[batch][dimension][length][width]`, so the element
/// `(b, d, y, x)` lives at `offset(b, d) + y * width + x`.
///
/// # Example
///
/// ```
/// use neural_engine::shape::Shape;
///
/// let shape = Shape::new(28, 28, 3);
/// assert_eq!(shape.area(), 784);
/// assert_eq!(shape.volume(), 2352);
/// assert_eq!(shape.offset(1, 2), (1 * 3 + 2) * 784);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    /// Spatial width (fastest-varying axis).
    pub width: usize,
    /// Spatial length.
    pub length: usize,
    /// Channel count.
    pub dimensions: usize,
}

impl Shape {
    /// Create a shape from its three extents.
    pub fn new(width: usize, length: usize, dimensions: usize) -> Self {
        Self {
            width,
            length,
            dimensions,
        }
    }

    /// Elements in one channel of one sample.
    pub fn area(&self) -> usize {
        self.width * self.length
    }

    /// Elements in one whole sample.
    pub fn volume(&self) -> usize {
        self.area() * self.dimensions
    }

    /// Flat offset of the first element of channel `dimension` in batch
    /// element `batch`.
    pub fn offset(&self, batch: usize, dimension: usize) -> usize {
        (batch * self.dimensions + dimension) * self.area()
    }

    /// The same spatial extents with a different channel count.
    pub fn with_dimensions(&self, dimensions: usize) -> Self {
        Self {
            width: self.width,
            length: self.length,
            dimensions,
        }
    }
}
