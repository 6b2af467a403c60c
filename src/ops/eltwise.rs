use tracing::{debug, debug_span};
use uuid::Uuid;

use crate::accel::{BufferRole, Completion, DescriptorShape, EltwiseOp, ExecRequest, PimRuntime};
use crate::ops::guard::OperationResources;
use crate::ops::{AcceleratorClient, LifecycleState, OpError};
use crate::tensor::Tensor;

impl<R: PimRuntime> AcceleratorClient<R> {
    /// Elementwise binary op over two tensors of identical shape. Blocking.
    pub fn execute_elementwise(
        &self,
        lhs: &Tensor,
        rhs: &Tensor,
        op: EltwiseOp,
    ) -> Result<Tensor, OpError> {
        if lhs.shape() != rhs.shape() {
            return Err(OpError::ShapeMismatch(format!(
                "elementwise operands differ: {:?} vs {:?}",
                lhs.shape(),
                rhs.shape()
            )));
        }
        if lhs.numel() == 0 {
            return Err(OpError::ShapeMismatch(
                "elementwise operands are empty".into(),
            ));
        }

        let op_id = Uuid::new_v4();
        let span = debug_span!("pim_eltwise", %op_id, ?op, elements = lhs.numel());
        let _enter = span.enter();

        let mut output = Tensor::empty(lhs.shape(), lhs.memory());
        let runtime = self.runtime();
        let mut resources = OperationResources::acquire(
            runtime,
            op_id,
            DescriptorShape::Eltwise {
                elements: lhs.numel(),
            },
            self.precision(),
        )
        .map_err(OpError::AcceleratorExecutionFailure)?;

        // SAFETY: the call blocks, and `resources` is finished or failed
        // below before `lhs`, `rhs` or `output` can be touched again.
        let bound = unsafe {
            resources
                .bind(lhs.memory(), BufferRole::Lhs, lhs.region())
                .and_then(|a| {
                    let b = resources.bind(rhs.memory(), BufferRole::Rhs, rhs.region())?;
                    let o =
                        resources.bind(output.memory(), BufferRole::Output, output.region_mut())?;
                    Ok((a, b, o))
                })
        };
        let request = match bound {
            Ok((a, b, o)) => ExecRequest::Eltwise {
                op,
                output: o,
                lhs: a,
                rhs: b,
            },
            Err(e) => return Err(resources.fail(e)),
        };

        resources.advance(LifecycleState::Executing);
        let outcome = runtime.execute(request, true).and_then(Completion::wait);
        resources.finish(outcome)?;
        debug!("eltwise completed");
        Ok(output)
    }

    pub fn add(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, OpError> {
        self.execute_elementwise(lhs, rhs, EltwiseOp::Add)
    }

    pub fn mul(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, OpError> {
        self.execute_elementwise(lhs, rhs, EltwiseOp::Mul)
    }
}
