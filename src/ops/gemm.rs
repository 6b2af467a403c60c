use std::marker::PhantomData;

use serde::Serialize;
use tracing::{debug, debug_span, error, warn};
use uuid::Uuid;

use crate::accel::{
    Activation, BufferId, BufferRole, Completion, DescriptorShape, ExecRequest, GemmDims, PimRuntime,
    RuntimeError, StreamHandle,
};
use crate::ops::guard::OperationResources;
use crate::ops::{AcceleratorClient, LifecycleState, OpError};
use crate::tensor::Tensor;

const INPUT_RANKS: &[usize] = &[3, 4];
const WEIGHT_RANKS: &[usize] = &[2, 3];

/// Descriptor parameters and output shape derived from GEMM operands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GemmPlan {
    pub dims: GemmDims,
    /// 1 when a single weight matrix is shared by every channel.
    pub weight_channels: usize,
    pub output_shape: Vec<usize>,
}

/// Validate GEMM operands and derive the descriptor and output shape.
///
/// Inputs are `(C, H, in_w)` or `(N, C, H, in_w)`; weights are
/// `(in_w, out_w)` or `(Cw, in_w, out_w)`. The output keeps the input's
/// leading dimensions with `in_w` replaced by `out_w`.
pub fn plan_gemm(inputs: &Tensor, weights: &Tensor, bias: &Tensor) -> Result<GemmPlan, OpError> {
    let (batch, channels, rows, in_width) = match *inputs.shape() {
        [c, h, w] => (1, c, h, w),
        [n, c, h, w] => (n, c, h, w),
        _ => return Err(unsupported("inputs", inputs.rank(), INPUT_RANKS)),
    };
    let (weight_channels, weight_in, out_width) = match *weights.shape() {
        [i, o] => (1, i, o),
        [c, i, o] => (c, i, o),
        _ => return Err(unsupported("weights", weights.rank(), WEIGHT_RANKS)),
    };

    if inputs.numel() == 0 || weights.numel() == 0 {
        return Err(OpError::ShapeMismatch(format!(
            "zero-sized operand: inputs {:?}, weights {:?}",
            inputs.shape(),
            weights.shape()
        )));
    }
    if in_width != weight_in {
        return Err(OpError::ShapeMismatch(format!(
            "inputs inner width {in_width} does not match weights in-width {weight_in}"
        )));
    }
    if weight_channels != 1 && weight_channels != channels {
        return Err(OpError::ShapeMismatch(format!(
            "weights carry {weight_channels} channel(s), inputs carry {channels}"
        )));
    }
    if bias.numel() != out_width {
        return Err(OpError::ShapeMismatch(format!(
            "bias holds {} element(s), output width is {out_width}",
            bias.numel()
        )));
    }

    let output_shape = if inputs.rank() == 4 {
        vec![batch, channels, rows, out_width]
    } else {
        vec![channels, rows, out_width]
    };

    Ok(GemmPlan {
        dims: GemmDims {
            batch,
            channels,
            rows,
            in_width,
            out_width,
        },
        weight_channels,
        output_shape,
    })
}

pub(crate) fn unsupported(operand: &'static str, rank: usize, supported: &'static [usize]) -> OpError {
    OpError::UnsupportedRank {
        operand,
        rank,
        supported,
    }
}

/// A submitted GEMM whose output is not yet observable.
///
/// The output tensor is only handed out by [`wait`](Self::wait), after the
/// runtime signals completion and every handle has been released. Dropping
/// a pending GEMM also waits for completion before releasing.
pub struct PendingGemm<'a, R: PimRuntime> {
    op_id: Uuid,
    completion: Option<Completion>,
    resources: Option<OperationResources<'a, R>>,
    output: Option<Tensor>,
    // Queued work reads these after `execute` returns. They are owned here
    // so a leaked handle leaks them too instead of freeing them under it.
    _held: Option<Box<[Tensor; 3]>>,
    _operands: PhantomData<&'a Tensor>,
}

impl<'a, R: PimRuntime> PendingGemm<'a, R> {
    fn completed(op_id: Uuid, output: Tensor) -> Self {
        Self {
            op_id,
            completion: None,
            resources: None,
            output: Some(output),
            _held: None,
            _operands: PhantomData,
        }
    }

    pub fn op_id(&self) -> Uuid {
        self.op_id
    }

    pub fn is_complete(&self) -> bool {
        self.completion.as_ref().map_or(true, Completion::is_complete)
    }

    pub fn state(&self) -> LifecycleState {
        self.resources
            .as_ref()
            .map_or(LifecycleState::Released, OperationResources::state)
    }

    /// Shape of the output tensor; available before completion.
    pub fn output_shape(&self) -> &[usize] {
        match &self.output {
            Some(output) => output.shape(),
            None => &[],
        }
    }

    /// Wait for completion, release the invocation's handles and return the
    /// output.
    pub fn wait(mut self) -> Result<Tensor, OpError> {
        let outcome = self.completion.take().map_or(Ok(()), Completion::wait);
        match self.resources.take() {
            Some(resources) => resources.finish(outcome)?,
            None => outcome.map_err(OpError::AcceleratorExecutionFailure)?,
        }
        debug!(op_id = %self.op_id, "gemm completed");
        self.output.take().ok_or_else(|| {
            OpError::ResourceLeakInvariantViolation("gemm output already taken".into())
        })
    }
}

impl<R: PimRuntime> Drop for PendingGemm<'_, R> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            if let Err(e) = completion.wait() {
                warn!(op_id = %self.op_id, error = %e, "dropped gemm finished with an error");
            }
        }
        if let Some(resources) = self.resources.take() {
            if let Err(e) = resources.release() {
                error!(op_id = %self.op_id, error = %e, "dropped gemm could not release its handles");
            }
        }
    }
}

impl<R: PimRuntime> AcceleratorClient<R> {
    /// Run one GEMM with fused bias and activation on the accelerator.
    ///
    /// With `blocking` set the call returns once the runtime reports
    /// completion and all handles are released; otherwise the returned
    /// [`PendingGemm`] keeps the handles alive until it is waited on.
    pub fn execute_gemm<'a>(
        &'a self,
        inputs: &'a Tensor,
        weights: &'a Tensor,
        bias: &'a Tensor,
        activation: Activation,
        blocking: bool,
    ) -> Result<PendingGemm<'a, R>, OpError> {
        let plan = plan_gemm(inputs, weights, bias)?;
        let output = Tensor::empty(&plan.output_shape, inputs.memory());
        self.launch_gemm(&plan, inputs, weights, bias, output, activation, blocking, None)
    }

    /// Like [`execute_gemm`](Self::execute_gemm) but writes into
    /// caller-allocated output storage, which must match the derived shape
    /// and live in the same kind of memory as `inputs`.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_gemm_into<'a>(
        &'a self,
        inputs: &'a Tensor,
        weights: &'a Tensor,
        bias: &'a Tensor,
        output: Tensor,
        activation: Activation,
        blocking: bool,
        stream: Option<StreamHandle>,
    ) -> Result<PendingGemm<'a, R>, OpError> {
        let plan = plan_gemm(inputs, weights, bias)?;
        if output.shape() != plan.output_shape.as_slice() {
            return Err(OpError::ShapeMismatch(format!(
                "output storage {:?} does not match derived shape {:?}",
                output.shape(),
                plan.output_shape
            )));
        }
        if output.memory() != inputs.memory() {
            return Err(OpError::ShapeMismatch(format!(
                "output storage is {} memory but inputs are {}",
                output.memory(),
                inputs.memory()
            )));
        }
        self.launch_gemm(&plan, inputs, weights, bias, output, activation, blocking, stream)
    }

    /// Blocking GEMM returning the output directly.
    pub fn gemm(
        &self,
        inputs: &Tensor,
        weights: &Tensor,
        bias: &Tensor,
        activation: Activation,
    ) -> Result<Tensor, OpError> {
        let pending = self.execute_gemm(inputs, weights, bias, activation, true)?;
        pending.wait()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn launch_gemm<'a>(
        &'a self,
        plan: &GemmPlan,
        inputs: &'a Tensor,
        weights: &'a Tensor,
        bias: &'a Tensor,
        mut output: Tensor,
        activation: Activation,
        blocking: bool,
        stream: Option<StreamHandle>,
    ) -> Result<PendingGemm<'a, R>, OpError> {
        let op_id = Uuid::new_v4();
        let d = plan.dims;
        let span = debug_span!(
            "pim_gemm",
            %op_id,
            batch = d.batch,
            channels = d.channels,
            rows = d.rows,
            in_width = d.in_width,
            out_width = d.out_width,
            blocking
        );
        let _enter = span.enter();

        let runtime = self.runtime();
        let mut resources = OperationResources::acquire(
            runtime,
            op_id,
            DescriptorShape::Gemm(d),
            self.precision(),
        )
        .map_err(OpError::AcceleratorExecutionFailure)?;

        let operands = (!blocking)
            .then(|| Box::new([inputs.clone(), weights.clone(), bias.clone()]));
        let [inputs, weights, bias] = match &operands {
            Some(held) => [&held[0], &held[1], &held[2]],
            None => [inputs, weights, bias],
        };

        // SAFETY: a blocking call waits for completion and releases every
        // buffer before returning. A queued call moves the output and the
        // operand copies into the returned `PendingGemm`, whose `wait` and
        // drop observe completion before releasing; if it is leaked the
        // storage is leaked with it and never freed.
        let bound = unsafe { bind_gemm(&mut resources, inputs, weights, bias, &mut output) };
        let request = match bound {
            Ok((input, weight, bias, out)) => ExecRequest::Gemm {
                output: out,
                input,
                weight,
                bias,
                activation,
                extra: stream,
            },
            Err(e) => return Err(resources.fail(e)),
        };

        resources.advance(LifecycleState::Executing);
        let completion = match runtime.execute(request, blocking) {
            Ok(completion) => completion,
            Err(e) => return Err(resources.fail(e)),
        };

        if blocking {
            resources.finish(completion.wait())?;
            debug!("gemm completed");
            return Ok(PendingGemm::completed(op_id, output));
        }

        debug!("gemm queued");
        Ok(PendingGemm {
            op_id,
            completion: Some(completion),
            resources: Some(resources),
            output: Some(output),
            _held: operands,
            _operands: PhantomData,
        })
    }
}

/// # Safety
/// Every tensor must stay allocated, and `output` untouched, until the
/// resources are released after completion.
unsafe fn bind_gemm<R: PimRuntime>(
    resources: &mut OperationResources<'_, R>,
    inputs: &Tensor,
    weights: &Tensor,
    bias: &Tensor,
    output: &mut Tensor,
) -> Result<(BufferId, BufferId, BufferId, BufferId), RuntimeError> {
    // SAFETY: forwarded from this function's own contract.
    unsafe {
        let input = resources.bind(inputs.memory(), BufferRole::Input, inputs.region())?;
        let weight = resources.bind(weights.memory(), BufferRole::Weight, weights.region())?;
        let bias = resources.bind(bias.memory(), BufferRole::Bias, bias.region())?;
        let out = resources.bind(output.memory(), BufferRole::Output, output.region_mut())?;
        Ok((input, weight, bias, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(input: &[usize], weight: &[usize], out_w: usize) -> Result<GemmPlan, OpError> {
        plan_gemm(&Tensor::zeros(input), &Tensor::zeros(weight), &Tensor::zeros(&[out_w]))
    }

    #[test]
    fn test_plan_rank3_inputs_rank2_weights() {
        let p = plan(&[2, 5, 8], &[8, 16], 16).unwrap();
        assert_eq!(p.output_shape, vec![2, 5, 16]);
        assert_eq!(p.dims.batch, 1);
        assert_eq!(p.weight_channels, 1);
    }

    #[test]
    fn test_plan_rank3_inputs_rank3_weights() {
        let p = plan(&[2, 5, 8], &[2, 8, 16], 16).unwrap();
        assert_eq!(p.output_shape, vec![2, 5, 16]);
        assert_eq!(p.weight_channels, 2);
    }

    #[test]
    fn test_plan_rank4_inputs_rank2_weights() {
        let p = plan(&[3, 2, 5, 8], &[8, 4], 4).unwrap();
        assert_eq!(p.output_shape, vec![3, 2, 5, 4]);
        assert_eq!(
            p.dims,
            GemmDims {
                batch: 3,
                channels: 2,
                rows: 5,
                in_width: 8,
                out_width: 4
            }
        );
    }

    #[test]
    fn test_plan_rank4_inputs_rank3_weights() {
        let p = plan(&[3, 2, 5, 8], &[1, 8, 4], 4).unwrap();
        assert_eq!(p.output_shape, vec![3, 2, 5, 4]);
        assert_eq!(p.weight_channels, 1);
    }

    #[test]
    fn test_plan_rejects_unsupported_ranks() {
        for rank in [0usize, 1, 2, 5] {
            let shape = vec![2; rank];
            let err = plan(&shape, &[2, 2], 2).unwrap_err();
            assert!(matches!(
                err,
                OpError::UnsupportedRank { operand: "inputs", rank: r, .. } if r == rank
            ));
        }
        for rank in [1usize, 4] {
            let shape = vec![2; rank];
            let err = plan(&[2, 2, 2], &shape, 2).unwrap_err();
            assert!(matches!(err, OpError::UnsupportedRank { operand: "weights", .. }));
        }
    }

    #[test]
    fn test_plan_shape_mismatches() {
        // inner width
        assert!(matches!(
            plan(&[1, 2, 8], &[7, 4], 4),
            Err(OpError::ShapeMismatch(_))
        ));
        // weight channels neither 1 nor C
        assert!(matches!(
            plan(&[3, 2, 8], &[2, 8, 4], 4),
            Err(OpError::ShapeMismatch(_))
        ));
        // bias length
        assert!(matches!(
            plan(&[1, 2, 8], &[8, 4], 3),
            Err(OpError::ShapeMismatch(_))
        ));
        // zero-sized
        assert!(matches!(
            plan(&[1, 0, 8], &[8, 4], 4),
            Err(OpError::ShapeMismatch(_))
        ));
    }
}
