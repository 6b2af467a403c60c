//! Expected results for the verification checks.
//!
//! Computed in f64 with plain index arithmetic straight from the operand
//! shapes. Nothing here goes through the kernels in `accel::cpu`, so an
//! error in those kernels cannot hide itself.

use anyhow::{bail, ensure, Result};

use crate::accel::Activation;
use crate::tensor::Tensor;

/// Expected output of one operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expected {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Expected {
    /// Largest absolute difference between `got` and these values. Fails
    /// when shapes differ or the difference exceeds `tolerance`.
    pub fn check(&self, got: &Tensor, tolerance: f32) -> Result<f32> {
        ensure!(
            got.shape() == self.shape.as_slice(),
            "output shape {:?}, expected {:?}",
            got.shape(),
            self.shape
        );
        let mut worst = 0.0f64;
        for (i, (g, want)) in got.data().iter().zip(&self.values).enumerate() {
            let diff = (g.to_f64() - want).abs();
            if diff.is_nan() {
                bail!("element {i} is {g}, expected {want}");
            }
            worst = worst.max(diff);
        }
        ensure!(
            worst <= f64::from(tolerance),
            "max abs diff {worst} exceeds tolerance {tolerance}"
        );
        Ok(worst as f32)
    }
}

fn at(t: &Tensor, i: usize) -> f64 {
    t.data()[i].to_f64()
}

fn activate(x: f64, activation: Activation) -> f64 {
    match activation {
        Activation::Relu if x < 0.0 => 0.0,
        _ => x,
    }
}

/// `inputs` is `(C, H, W)` or `(N, C, H, W)`; `weights` is `(W, O)` or
/// `(C, W, O)`. Output replaces `W` with `O`.
pub(crate) fn gemm(
    inputs: &Tensor,
    weights: &Tensor,
    bias: &Tensor,
    activation: Activation,
) -> Result<Expected> {
    let (n, c, h, w) = match *inputs.shape() {
        [c, h, w] => (1, c, h, w),
        [n, c, h, w] => (n, c, h, w),
        _ => bail!("no reference for inputs of shape {:?}", inputs.shape()),
    };
    let (per_channel, kw, o) = match *weights.shape() {
        [kw, o] => (false, kw, o),
        [cw, kw, o] if cw == c => (true, kw, o),
        [1, kw, o] => (false, kw, o),
        _ => bail!("no reference for weights of shape {:?}", weights.shape()),
    };
    ensure!(kw == w, "inner widths differ: {w} vs {kw}");
    ensure!(bias.numel() == o, "bias holds {} values, want {o}", bias.numel());

    let mut values = Vec::with_capacity(n * c * h * o);
    for b in 0..n {
        for ch in 0..c {
            let plane = if per_channel { ch } else { 0 };
            for r in 0..h {
                let row = ((b * c + ch) * h + r) * w;
                for j in 0..o {
                    let mut acc = at(bias, j);
                    for k in 0..w {
                        acc += at(inputs, row + k) * at(weights, (plane * w + k) * o + j);
                    }
                    values.push(activate(acc, activation));
                }
            }
        }
    }

    let mut shape = inputs.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = o;
    }
    Ok(Expected { shape, values })
}

/// `input` is `(in)` or `(rows, in)`; `weight` is `(in, out)`.
pub(crate) fn dense(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    activation: Activation,
) -> Result<Expected> {
    let (rows, width, batched) = match *input.shape() {
        [width] => (1, width, false),
        [rows, width] => (rows, width, true),
        _ => bail!("no reference for dense input of shape {:?}", input.shape()),
    };
    let (kw, out) = match *weight.shape() {
        [kw, out] => (kw, out),
        _ => bail!("no reference for dense weight of shape {:?}", weight.shape()),
    };
    ensure!(kw == width, "inner widths differ: {width} vs {kw}");

    let mut values = Vec::with_capacity(rows * out);
    for r in 0..rows {
        for j in 0..out {
            let mut acc = bias.map_or(0.0, |b| at(b, j));
            for k in 0..width {
                acc += at(input, r * width + k) * at(weight, k * out + j);
            }
            values.push(activate(acc, activation));
        }
    }

    let shape = if batched { vec![rows, out] } else { vec![out] };
    Ok(Expected { shape, values })
}
