//! Contraction/expansion geometry shared by the convolution kernel family.
//!
//! A [`LayerInfo`] relates a "contracted" tensor (the side with fewer spatial
//! positions) to an "expanded" tensor (the side with more) for one filter
//! size and stride. Forward convolution treats the contraction as its output;
//! transposed convolution treats it as its input. Because the two output-size
//! formulas are exact algebraic inverses, the same indexing structure drives
//! both kernel families.
//!
//! The geometry is the "valid" one: an expansion axis of extent `e` contracts
//! to `(e - filter_size) / stride + 1`, and a contraction axis of extent `c`
//! expands to `(c - 1) * stride + filter_size`. The derived
//! `padding = filter_size - stride` is the extra border the expansion carries
//! beyond `c * stride`; no padding values are ever materialized, and kernels
//! walking the reverse mapping simply skip coordinates that fall outside the
//! valid range.

use crate::error::EngineError;
use crate::shape::Shape;
use serde::{Deserialize, Serialize};

/// Geometry descriptor for one convolution or transposed-convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Side length of the square filter window.
    pub filter_size: usize,
    /// Step between successive filter placements on the expansion side.
    pub stride: usize,
    /// Derived border: `filter_size - stride`.
    pub padding: usize,
    /// The small side (fewer spatial positions).
    pub contraction: Shape,
    /// The large side (more spatial positions).
    pub expansion: Shape,
}

impl LayerInfo {
    /// Build the geometry from the contraction side, deriving the expansion.
    ///
    /// This is the transposed-convolution direction: the layer's input is the
    /// contraction and its output gains `(c - 1) * stride + filter_size`
    /// spatial positions per axis.
    ///
    /// # Errors
    ///
    /// `ConstraintUnsatisfiable` when the stride exceeds the filter size
    /// (the placements would leave gaps) or either side is degenerate.
    pub fn expand(
        filter_size: usize,
        stride: usize,
        contraction: Shape,
        expansion_dimensions: usize,
    ) -> Result<Self, EngineError> {
        Self::check_filter(filter_size, stride)?;
        if contraction.width == 0 || contraction.length == 0 {
            return Err(EngineError::ConstraintUnsatisfiable(format!(
                "cannot expand degenerate contraction {}x{}",
                contraction.width, contraction.length
            )));
        }
        let expansion = Shape::new(
            (contraction.width - 1) * stride + filter_size,
            (contraction.length - 1) * stride + filter_size,
            expansion_dimensions,
        );
        Ok(Self {
            filter_size,
            stride,
            padding: filter_size - stride,
            contraction,
            expansion,
        })
    }

    /// Build the geometry from the expansion side, deriving the contraction.
    ///
    /// This is the forward-convolution direction: the layer's input is the
    /// expansion and its output keeps `(e - filter_size) / stride + 1`
    /// spatial positions per axis.
    ///
    /// # Errors
    ///
    /// `ConstraintUnsatisfiable` when the stride does not evenly divide the
    /// spatial extent. Fractional geometry is a construction-time error,
    /// never rounded.
    pub fn contract(
        filter_size: usize,
        stride: usize,
        expansion: Shape,
        contraction_dimensions: usize,
    ) -> Result<Self, EngineError> {
        Self::check_filter(filter_size, stride)?;
        let contraction = Shape::new(
            Self::contract_axis(expansion.width, filter_size, stride)?,
            Self::contract_axis(expansion.length, filter_size, stride)?,
            contraction_dimensions,
        );
        Ok(Self {
            filter_size,
            stride,
            padding: filter_size - stride,
            contraction,
            expansion,
        })
    }

    fn check_filter(filter_size: usize, stride: usize) -> Result<(), EngineError> {
        if filter_size == 0 || stride == 0 {
            return Err(EngineError::ConstraintUnsatisfiable(
                "filter size and stride must be positive".into(),
            ));
        }
        if stride > filter_size {
            return Err(EngineError::ConstraintUnsatisfiable(format!(
                "stride {} exceeds filter size {}; placements would leave gaps",
                stride, filter_size
            )));
        }
        Ok(())
    }

    fn contract_axis(extent: usize, filter_size: usize, stride: usize) -> Result<usize, EngineError> {
        if extent < filter_size {
            return Err(EngineError::ConstraintUnsatisfiable(format!(
                "axis extent {} is smaller than filter size {}",
                extent, filter_size
            )));
        }
        if (extent - filter_size) % stride != 0 {
            return Err(EngineError::ConstraintUnsatisfiable(format!(
                "stride {} does not evenly contract extent {} with filter {}",
                stride, extent, filter_size
            )));
        }
        Ok((extent - filter_size) / stride + 1)
    }

    /// Expansion coordinate touched by contraction coordinate `c` and filter
    /// tap `f` along one axis. Always inside the expansion by construction.
    #[inline]
    pub fn expansion_coord(&self, c: usize, f: usize) -> usize {
        c * self.stride + f
    }

    /// Contraction coordinate whose filter tap `f` touches expansion
    /// coordinate `e` along one axis, or `None` when no placement does:
    /// the boundary-rejection rule of the reverse mapping.
    #[inline]
    pub fn contraction_coord(&self, e: usize, f: usize, extent: usize) -> Option<usize> {
        if e < f {
            return None;
        }
        let span = e - f;
        if span % self.stride != 0 {
            return None;
        }
        let c = span / self.stride;
        (c < extent).then_some(c)
    }

    /// Length of the flat filter weight vector:
    /// `filter_size^2 * contraction_dims * expansion_dims`.
    pub fn filter_volume(&self) -> usize {
        self.filter_size
            * self.filter_size
            * self.contraction.dimensions
            * self.expansion.dimensions
    }

    /// Flat index of filter coefficient `(cdim, edim, fy, fx)`.
    ///
    /// Layout is `[contraction_dim][expansion_dim][fy][fx]`, so one
    /// contraction channel's coefficients are contiguous.
    #[inline]
    pub fn filter_index(&self, cdim: usize, edim: usize, fy: usize, fx: usize) -> usize {
        ((cdim * self.expansion.dimensions + edim) * self.filter_size + fy) * self.filter_size + fx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_formula() {
        let info = LayerInfo::expand(3, 2, Shape::new(4, 4, 8), 3).unwrap();
        // (4 - 1) * 2 + 3 = 9
        assert_eq!(info.expansion.width, 9);
        assert_eq!(info.expansion.length, 9);
        assert_eq!(info.padding, 1);
        assert_eq!(info.expansion.dimensions, 3);
    }

    #[test]
    fn test_contract_formula() {
        let info = LayerInfo::contract(3, 2, Shape::new(9, 9, 3), 8).unwrap();
        assert_eq!(info.contraction.width, 4);
        assert_eq!(info.contraction.length, 4);
    }

    #[test]
    fn test_round_trip() {
        // Contraction and expansion are exact inverses for matching
        // filter/stride.
        for (f, s, c) in [(3, 1, 5), (3, 2, 4), (4, 2, 7), (5, 5, 3), (1, 1, 6)] {
            let expanded = LayerInfo::expand(f, s, Shape::new(c, c, 2), 4).unwrap();
            let contracted =
                LayerInfo::contract(f, s, expanded.expansion, 2).unwrap();
            assert_eq!(contracted.contraction.width, c);
            assert_eq!(contracted.contraction.length, c);
        }
    }

    #[test]
    fn test_fractional_geometry_rejected() {
        // (8 - 3) is not divisible by 2.
        assert!(LayerInfo::contract(3, 2, Shape::new(8, 8, 1), 1).is_err());
    }

    #[test]
    fn test_gapped_stride_rejected() {
        assert!(LayerInfo::expand(2, 3, Shape::new(4, 4, 1), 1).is_err());
    }

    #[test]
    fn test_reverse_mapping_rejection() {
        let info = LayerInfo::contract(3, 2, Shape::new(7, 7, 1), 1).unwrap();
        // contraction extent is 3
        assert_eq!(info.contraction.width, 3);

        // e=0 is only reachable through tap 0 at c=0.
        assert_eq!(info.contraction_coord(0, 0, 3), Some(0));
        assert_eq!(info.contraction_coord(0, 1, 3), None);
        // e=1, tap 0: span 1 not divisible by stride 2.
        assert_eq!(info.contraction_coord(1, 0, 3), None);
        assert_eq!(info.contraction_coord(1, 1, 3), Some(0));
        // Past the last placement.
        assert_eq!(info.contraction_coord(6, 0, 3), None);
    }

    #[test]
    fn test_forward_and_reverse_agree() {
        let info = LayerInfo::contract(3, 2, Shape::new(9, 9, 1), 1).unwrap();
        let cw = info.contraction.width;
        for c in 0..cw {
            for f in 0..info.filter_size {
                let e = info.expansion_coord(c, f);
                assert_eq!(info.contraction_coord(e, f, cw), Some(c));
            }
        }
    }

    #[test]
    fn test_filter_indexing() {
        let info = LayerInfo::contract(3, 1, Shape::new(5, 5, 2), 4).unwrap();
        assert_eq!(info.filter_volume(), 3 * 3 * 4 * 2);
        assert_eq!(info.filter_index(0, 0, 0, 0), 0);
        assert_eq!(info.filter_index(0, 0, 0, 1), 1);
        assert_eq!(info.filter_index(0, 1, 0, 0), 9);
        assert_eq!(info.filter_index(1, 0, 0, 0), 2 * 9);
    }
}
