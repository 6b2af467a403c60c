use half::f16;

use crate::accel::{Activation, EltwiseOp, GemmDims};

/// Scalar CPU reference GEMM with fused bias and activation.
///
/// `input` is `(batch, channels, rows, in_width)` row-major, `weight` is
/// `(weight_channels, in_width, out_width)` where `weight_channels` is 1
/// (shared by every channel) or `dims.channels`. Accumulates in f32 and
/// rounds once to f16 per output element.
pub fn gemm(
    dims: &GemmDims,
    weight_channels: usize,
    input: &[f16],
    weight: &[f16],
    bias: &[f16],
    activation: Activation,
) -> Vec<f16> {
    let GemmDims {
        batch,
        channels,
        rows,
        in_width,
        out_width,
    } = *dims;

    let mut out = Vec::with_capacity(dims.output_elements());
    for n in 0..batch {
        for c in 0..channels {
            let w_base = if weight_channels == 1 { 0 } else { c * in_width * out_width };
            for h in 0..rows {
                let row = &input[((n * channels + c) * rows + h) * in_width..][..in_width];
                for o in 0..out_width {
                    let mut acc = bias[o].to_f32();
                    for (i, x) in row.iter().enumerate() {
                        acc += x.to_f32() * weight[w_base + i * out_width + o].to_f32();
                    }
                    out.push(f16::from_f32(activate(acc, activation)));
                }
            }
        }
    }
    out
}

/// Scalar CPU reference for elementwise binary ops.
pub fn eltwise(op: EltwiseOp, lhs: &[f16], rhs: &[f16]) -> Vec<f16> {
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| {
            let (a, b) = (a.to_f32(), b.to_f32());
            let v = match op {
                EltwiseOp::Add => a + b,
                EltwiseOp::Mul => a * b,
            };
            f16::from_f32(v)
        })
        .collect()
}

pub fn activate(x: f32, activation: Activation) -> f32 {
    match activation {
        Activation::None => x,
        Activation::Relu => x.max(0.0),
    }
}

/// Largest absolute element difference, or `None` when lengths differ.
pub fn max_abs_diff(a: &[f16], b: &[f16]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b)
            .map(|(x, y)| (x.to_f32() - y.to_f32()).abs())
            .fold(0.0f32, f32::max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(values: &[f32]) -> Vec<f16> {
        values.iter().map(|v| f16::from_f32(*v)).collect()
    }

    #[test]
    fn test_gemm_single_row() {
        // [1 2] x [[1 0 2], [0 1 3]] + [0.5 0.5 0.5]
        let dims = GemmDims {
            batch: 1,
            channels: 1,
            rows: 1,
            in_width: 2,
            out_width: 3,
        };
        let out = gemm(
            &dims,
            1,
            &h(&[1.0, 2.0]),
            &h(&[1.0, 0.0, 2.0, 0.0, 1.0, 3.0]),
            &h(&[0.5, 0.5, 0.5]),
            Activation::None,
        );
        assert_eq!(out, h(&[1.5, 2.5, 8.5]));
    }

    #[test]
    fn test_gemm_relu_clamps_negatives() {
        let dims = GemmDims {
            batch: 1,
            channels: 1,
            rows: 2,
            in_width: 1,
            out_width: 1,
        };
        let out = gemm(&dims, 1, &h(&[2.0, -3.0]), &h(&[1.0]), &h(&[0.0]), Activation::Relu);
        assert_eq!(out, h(&[2.0, 0.0]));
    }

    #[test]
    fn test_gemm_per_channel_weights() {
        let dims = GemmDims {
            batch: 1,
            channels: 2,
            rows: 1,
            in_width: 1,
            out_width: 1,
        };
        // channel 0 scales by 2, channel 1 by 3
        let out = gemm(&dims, 2, &h(&[1.0, 1.0]), &h(&[2.0, 3.0]), &h(&[0.0]), Activation::None);
        assert_eq!(out, h(&[2.0, 3.0]));

        // broadcast weight scales both channels by 2
        let out = gemm(&dims, 1, &h(&[1.0, 1.0]), &h(&[2.0]), &h(&[0.0]), Activation::None);
        assert_eq!(out, h(&[2.0, 2.0]));
    }

    #[test]
    fn test_eltwise_add_and_mul() {
        let a = h(&[1.0; 32]);
        let b = h(&[2.0; 32]);
        assert_eq!(eltwise(EltwiseOp::Add, &a, &b), h(&[3.0; 32]));
        assert_eq!(eltwise(EltwiseOp::Mul, &a, &b), h(&[2.0; 32]));
    }

    #[test]
    fn test_max_abs_diff() {
        assert_eq!(max_abs_diff(&h(&[1.0, 2.0]), &h(&[1.0, 2.5])), Some(0.5));
        assert_eq!(max_abs_diff(&h(&[1.0]), &h(&[1.0, 2.0])), None);
    }
}
