use crate::accel::{Activation, GemmDims, PimRuntime};
use crate::ops::gemm::{unsupported, GemmPlan};
use crate::ops::{AcceleratorClient, OpError};
use crate::tensor::Tensor;

const DENSE_INPUT_RANKS: &[usize] = &[1, 2];
const DENSE_WEIGHT_RANKS: &[usize] = &[2];

/// Lower a dense layer onto a single-channel GEMM.
///
/// `input` is `(in_w)` or `(rows, in_w)`, `weight` is `(in_w, out_w)`. The
/// output mirrors the input rank: `(out_w)` or `(rows, out_w)`.
pub fn plan_dense(input: &Tensor, weight: &Tensor) -> Result<GemmPlan, OpError> {
    let (rows, in_width) = match *input.shape() {
        [w] => (1, w),
        [h, w] => (h, w),
        _ => return Err(unsupported("input", input.rank(), DENSE_INPUT_RANKS)),
    };
    let (weight_in, out_width) = match *weight.shape() {
        [i, o] => (i, o),
        _ => return Err(unsupported("weight", weight.rank(), DENSE_WEIGHT_RANKS)),
    };
    if input.numel() == 0 || weight.numel() == 0 {
        return Err(OpError::ShapeMismatch(format!(
            "zero-sized operand: input {:?}, weight {:?}",
            input.shape(),
            weight.shape()
        )));
    }
    if in_width != weight_in {
        return Err(OpError::ShapeMismatch(format!(
            "input width {in_width} does not match weight in-width {weight_in}"
        )));
    }

    let output_shape = if input.rank() == 1 {
        vec![out_width]
    } else {
        vec![rows, out_width]
    };
    Ok(GemmPlan {
        dims: GemmDims {
            batch: 1,
            channels: 1,
            rows,
            in_width,
            out_width,
        },
        weight_channels: 1,
        output_shape,
    })
}

impl<R: PimRuntime> AcceleratorClient<R> {
    /// Fully connected layer: `input x weight (+ bias)`, then `activation`.
    ///
    /// A missing bias is lowered to a zero bias so the runtime always sees
    /// the same four-buffer GEMM.
    pub fn execute_dense(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        activation: Activation,
    ) -> Result<Tensor, OpError> {
        let plan = plan_dense(input, weight)?;
        let out_width = plan.dims.out_width;

        let zero_bias;
        let bias = match bias {
            Some(b) if b.numel() == out_width => b,
            Some(b) => {
                return Err(OpError::ShapeMismatch(format!(
                    "bias holds {} element(s), output width is {out_width}",
                    b.numel()
                )))
            }
            None => {
                zero_bias = Tensor::zeros(&[out_width]).with_memory(weight.memory());
                &zero_bias
            }
        };

        let output = Tensor::empty(&plan.output_shape, input.memory());
        let pending = self.launch_gemm(&plan, input, weight, bias, output, activation, true, None)?;
        pending.wait()
    }
}
