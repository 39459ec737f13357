//! The three compute kernels shared by the convolution family.
//!
//! All three are driven by a [`LayerInfo`] and are agnostic to which side of
//! the geometry is a layer's input: forward convolution runs
//! [`forward_contract`] on activations and [`scatter_expand`] on gradients,
//! transposed convolution swaps the two, and both accumulate filter gradients
//! with [`filter_gradient`]. The kernels must agree algebraically (the scatter
//! is the exact adjoint of the contraction), which is what makes the whole
//! engine finite-difference checkable.
//!
//! Work is data-parallel across the channel axis of the destination buffer:
//! each rayon task owns a disjoint `[batch element][channel]` slice and
//! gathers every contribution that lands in it, so no two tasks ever write
//! the same element. The implicit join at the end of each kernel is the one
//! synchronization point of a launch.
//!
//! Every kernel accumulates into its destination; callers zero the
//! addressable region first.

use crate::geometry::LayerInfo;
use rayon::prelude::*;

/// Contract the expansion-side values into the contraction side.
///
/// For every contraction position and channel, sums `filter * expansion`
/// over the window. This is the forward pass of convolution and the
/// input-gradient pass of transposed convolution.
pub fn forward_contract(
    info: &LayerInfo,
    filter: &[f32],
    expansion: &[f32],
    contraction: &mut [f32],
    batch_size: usize,
) {
    let con = info.contraction;
    let exp = info.expansion;
    assert!(expansion.len() >= batch_size * exp.volume(), "expansion buffer too small");
    assert_eq!(filter.len(), info.filter_volume(), "filter length mismatch");

    let area = con.area();
    contraction[..batch_size * con.volume()]
        .par_chunks_mut(area)
        .enumerate()
        .for_each(|(chunk, out)| {
            let b = chunk / con.dimensions;
            let cdim = chunk % con.dimensions;
            for cy in 0..con.length {
                for cx in 0..con.width {
                    let mut acc = 0.0f32;
                    for edim in 0..exp.dimensions {
                        let base = exp.offset(b, edim);
                        for fy in 0..info.filter_size {
                            let ey = info.expansion_coord(cy, fy);
                            let row = base + ey * exp.width;
                            for fx in 0..info.filter_size {
                                let ex = info.expansion_coord(cx, fx);
                                acc += filter[info.filter_index(cdim, edim, fy, fx)]
                                    * expansion[row + ex];
                            }
                        }
                    }
                    out[cy * con.width + cx] += acc;
                }
            }
        });
}

/// Distribute contraction-side values back across the filter footprint into
/// the expansion side: the adjoint of [`forward_contract`].
///
/// This is the forward pass of transposed convolution and the input-gradient
/// pass of convolution. Each destination element gathers from every filter
/// placement that touches it; placements whose reverse-mapped contraction
/// coordinate falls outside the valid range are skipped (boundary rejection;
/// no padding values exist to read).
pub fn scatter_expand(
    info: &LayerInfo,
    filter: &[f32],
    contraction: &[f32],
    expansion: &mut [f32],
    batch_size: usize,
) {
    let con = info.contraction;
    let exp = info.expansion;
    assert!(contraction.len() >= batch_size * con.volume(), "contraction buffer too small");
    assert_eq!(filter.len(), info.filter_volume(), "filter length mismatch");

    let area = exp.area();
    expansion[..batch_size * exp.volume()]
        .par_chunks_mut(area)
        .enumerate()
        .for_each(|(chunk, out)| {
            let b = chunk / exp.dimensions;
            let edim = chunk % exp.dimensions;
            for ey in 0..exp.length {
                for ex in 0..exp.width {
                    let mut acc = 0.0f32;
                    for cdim in 0..con.dimensions {
                        let base = con.offset(b, cdim);
                        for fy in 0..info.filter_size {
                            let Some(cy) = info.contraction_coord(ey, fy, con.length) else {
                                continue;
                            };
                            let row = base + cy * con.width;
                            for fx in 0..info.filter_size {
                                let Some(cx) = info.contraction_coord(ex, fx, con.width)
                                else {
                                    continue;
                                };
                                acc += filter[info.filter_index(cdim, edim, fy, fx)]
                                    * contraction[row + cx];
                            }
                        }
                    }
                    out[ey * exp.width + ex] += acc;
                }
            }
        });
}

/// Accumulate the filter gradient: for every coefficient, the sum over batch
/// and spatial extent of contraction-side value times expansion-side value.
///
/// For convolution the contraction side carries the incoming gradient and
/// the expansion side the saved input; transposed convolution passes them the
/// other way around. The bilinear form is symmetric, so one kernel serves
/// both.
pub fn filter_gradient(
    info: &LayerInfo,
    contraction: &[f32],
    expansion: &[f32],
    filter_grad: &mut [f32],
    batch_size: usize,
) {
    let con = info.contraction;
    let exp = info.expansion;
    assert_eq!(filter_grad.len(), info.filter_volume(), "filter gradient length mismatch");

    let f = info.filter_size;
    let per_cdim = exp.dimensions * f * f;
    filter_grad
        .par_chunks_mut(per_cdim)
        .enumerate()
        .for_each(|(cdim, grad)| {
            for edim in 0..exp.dimensions {
                for fy in 0..f {
                    for fx in 0..f {
                        let mut acc = 0.0f32;
                        for b in 0..batch_size {
                            let c_base = con.offset(b, cdim);
                            let e_base = exp.offset(b, edim);
                            for cy in 0..con.length {
                                let ey = info.expansion_coord(cy, fy);
                                let c_row = c_base + cy * con.width;
                                let e_row = e_base + ey * exp.width;
                                for cx in 0..con.width {
                                    let ex = info.expansion_coord(cx, fx);
                                    acc += contraction[c_row + cx] * expansion[e_row + ex];
                                }
                            }
                        }
                        grad[(edim * f + fy) * f + fx] += acc;
                    }
                }
            }
        });
}

/// Add one bias value per channel across the batch.
pub fn add_bias(output: &mut [f32], bias: &[f32], shape: &crate::shape::Shape, batch_size: usize) {
    assert_eq!(bias.len(), shape.dimensions, "bias length mismatch");
    let area = shape.area();
    for b in 0..batch_size {
        for d in 0..shape.dimensions {
            let base = shape.offset(b, d);
            for value in &mut output[base..base + area] {
                *value += bias[d];
            }
        }
    }
}

/// Accumulate the per-channel bias gradient: the sum of the incoming gradient
/// over batch and spatial extent.
pub fn bias_gradient(
    grad_output: &[f32],
    bias_grad: &mut [f32],
    shape: &crate::shape::Shape,
    batch_size: usize,
) {
    assert_eq!(bias_grad.len(), shape.dimensions, "bias gradient length mismatch");
    let area = shape.area();
    for b in 0..batch_size {
        for d in 0..shape.dimensions {
            let base = shape.offset(b, d);
            let sum: f32 = grad_output[base..base + area].iter().sum();
            bias_grad[d] += sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn test_contract_mean_filter() {
        // 3x3 input, 3x3 filter of all 1/9, stride 1: one output value equal
        // to the input mean.
        let info = LayerInfo::contract(3, 1, Shape::new(3, 3, 1), 1).unwrap();
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let filter = vec![1.0 / 9.0; 9];
        let mut output = vec![0.0f32; 1];

        forward_contract(&info, &filter, &input, &mut output, 1);
        assert!((output[0] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_contract_stride_two() {
        // 5 -> (5 - 3) / 2 + 1 = 2 positions per axis.
        let info = LayerInfo::contract(3, 2, Shape::new(5, 5, 1), 1).unwrap();
        let input = vec![1.0f32; 25];
        let filter = vec![1.0f32; 9];
        let mut output = vec![0.0f32; 4];

        forward_contract(&info, &filter, &input, &mut output, 1);
        assert_eq!(output, vec![9.0; 4]);
    }

    #[test]
    fn test_scatter_is_adjoint_of_contract() {
        // <contract(x), y> == <x, scatter(y)> for any filter: the defining
        // property of the transpose pair.
        let info = LayerInfo::contract(3, 2, Shape::new(7, 7, 2), 3).unwrap();
        let mut rng = crate::utils::SimpleRng::new(314);

        let x: Vec<f32> = (0..info.expansion.volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();
        let y: Vec<f32> = (0..info.contraction.volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();
        let filter: Vec<f32> = (0..info.filter_volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();

        let mut cx = vec![0.0f32; info.contraction.volume()];
        forward_contract(&info, &filter, &x, &mut cx, 1);
        let lhs: f32 = cx.iter().zip(&y).map(|(a, b)| a * b).sum();

        let mut sy = vec![0.0f32; info.expansion.volume()];
        scatter_expand(&info, &filter, &y, &mut sy, 1);
        let rhs: f32 = sy.iter().zip(&x).map(|(a, b)| a * b).sum();

        assert!(
            (lhs - rhs).abs() < 1e-3 * lhs.abs().max(1.0),
            "adjoint mismatch: {} vs {}",
            lhs,
            rhs
        );
    }

    #[test]
    fn test_filter_gradient_single_tap() {
        // 1x1 filter, stride 1: filter gradient is the plain dot product of
        // the two sides.
        let info = LayerInfo::contract(1, 1, Shape::new(2, 2, 1), 1).unwrap();
        let grad = vec![1.0f32, 2.0, 3.0, 4.0];
        let vals = vec![0.5f32, 0.5, 0.5, 0.5];
        let mut fg = vec![0.0f32; 1];

        filter_gradient(&info, &grad, &vals, &mut fg, 1);
        assert!((fg[0] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_filter_gradient_matches_directional_derivative() {
        // d/deps [ <contract_{W + eps D}(x), y> ] == <filter_gradient(y, x), D>
        let info = LayerInfo::contract(3, 1, Shape::new(4, 4, 1), 2).unwrap();
        let mut rng = crate::utils::SimpleRng::new(2718);

        let x: Vec<f32> = (0..info.expansion.volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();
        let y: Vec<f32> = (0..info.contraction.volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();
        let w: Vec<f32> = (0..info.filter_volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();
        let d: Vec<f32> = (0..info.filter_volume())
            .map(|_| rng.gen_range_f32(-1.0, 1.0))
            .collect();

        let eval = |filter: &[f32]| {
            let mut out = vec![0.0f32; info.contraction.volume()];
            forward_contract(&info, filter, &x, &mut out, 1);
            out.iter().zip(&y).map(|(a, b)| a * b).sum::<f32>()
        };

        let eps = 1e-3f32;
        let w_plus: Vec<f32> = w.iter().zip(&d).map(|(a, b)| a + eps * b).collect();
        let w_minus: Vec<f32> = w.iter().zip(&d).map(|(a, b)| a - eps * b).collect();
        let numeric = (eval(&w_plus) - eval(&w_minus)) / (2.0 * eps);

        let mut fg = vec![0.0f32; info.filter_volume()];
        filter_gradient(&info, &y, &x, &mut fg, 1);
        let analytic: f32 = fg.iter().zip(&d).map(|(a, b)| a * b).sum();

        assert!(
            (numeric - analytic).abs() < 1e-2 * analytic.abs().max(1.0),
            "numeric {} vs analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn test_bias_kernels() {
        let shape = Shape::new(2, 2, 2);
        let mut out = vec![0.0f32; shape.volume() * 2];
        add_bias(&mut out, &[1.0, -1.0], &shape, 2);
        assert_eq!(&out[0..4], &[1.0; 4]);
        assert_eq!(&out[4..8], &[-1.0; 4]);

        let mut bg = vec![0.0f32; 2];
        bias_gradient(&out, &mut bg, &shape, 2);
        assert_eq!(bg, vec![8.0, -8.0]);
    }
}
