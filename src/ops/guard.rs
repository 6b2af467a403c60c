use tracing::{error, trace};
use uuid::Uuid;

use crate::accel::{
    BufferId, BufferRole, DescriptorId, DescriptorShape, PimRuntime, Precision, RuntimeError,
};
use crate::ops::{LifecycleState, OpError};
use crate::tensor::{MemoryKind, MemoryRegion};

/// The descriptor and buffer objects owned by one invocation.
///
/// Buffers can only be created through [`bind`](Self::bind), so they are
/// always nested inside the descriptor. Release destroys buffers in reverse
/// acquisition order and the descriptor last; it runs at most once, either
/// explicitly through [`finish`](Self::finish) / [`release`](Self::release)
/// or on drop.
pub(crate) struct OperationResources<'s, R: PimRuntime> {
    runtime: &'s R,
    op_id: Uuid,
    descriptor: Option<DescriptorId>,
    buffers: Vec<(BufferRole, BufferId)>,
    state: LifecycleState,
}

impl<'s, R: PimRuntime> OperationResources<'s, R> {
    pub(crate) fn acquire(
        runtime: &'s R,
        op_id: Uuid,
        shape: DescriptorShape,
        precision: Precision,
    ) -> Result<Self, RuntimeError> {
        let desc = runtime.create_descriptor(shape, precision)?;
        trace!(%op_id, %desc, "descriptor created");
        Ok(Self {
            runtime,
            op_id,
            descriptor: Some(desc),
            buffers: Vec::with_capacity(4),
            state: LifecycleState::DescriptorCreated,
        })
    }

    /// Wrap `region` as a buffer object on this invocation's descriptor.
    ///
    /// # Safety
    /// Same contract as [`PimRuntime::create_buffer`]: `region` must stay
    /// valid until these resources are released and any execution using
    /// it has completed.
    pub(crate) unsafe fn bind(
        &mut self,
        memory: MemoryKind,
        role: BufferRole,
        region: MemoryRegion,
    ) -> Result<BufferId, RuntimeError> {
        let desc = self
            .descriptor
            .ok_or_else(|| RuntimeError::Backend("binding a buffer after release".into()))?;
        // SAFETY: forwarded from this function's own contract.
        let id = unsafe { self.runtime.create_buffer(desc, memory, role, region)? };
        self.buffers.push((role, id));
        self.advance(LifecycleState::BuffersBound);
        Ok(id)
    }

    pub(crate) fn advance(&mut self, next: LifecycleState) {
        trace!(op_id = %self.op_id, from = %self.state, to = %next, "lifecycle");
        self.state = next;
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    /// Record the execution outcome, release everything and fold both into
    /// one result.
    pub(crate) fn finish(mut self, outcome: Result<(), RuntimeError>) -> Result<(), OpError> {
        if let Err(exec) = outcome {
            return Err(self.fail(exec));
        }
        self.advance(LifecycleState::Completed);
        self.release_all()
            .map_err(OpError::ResourceLeakInvariantViolation)
    }

    /// Mark the invocation failed, release everything and hand back the
    /// runtime error. A release failure on this path is logged; the
    /// execution error is what the caller sees.
    pub(crate) fn fail(mut self, exec: RuntimeError) -> OpError {
        self.advance(LifecycleState::Failed);
        if let Err(leak) = self.release_all() {
            error!(op_id = %self.op_id, error = %leak, "release failed after execution failure");
        }
        OpError::AcceleratorExecutionFailure(exec)
    }

    /// Release without recording an execution outcome.
    pub(crate) fn release(mut self) -> Result<(), OpError> {
        self.release_all()
            .map_err(OpError::ResourceLeakInvariantViolation)
    }

    fn release_all(&mut self) -> Result<(), String> {
        let mut failures = Vec::new();
        while let Some((role, id)) = self.buffers.pop() {
            if let Err(e) = self.runtime.destroy_buffer(id) {
                failures.push(format!("{role} buffer {id}: {e}"));
            }
        }
        if let Some(desc) = self.descriptor.take() {
            if let Err(e) = self.runtime.destroy_descriptor(desc) {
                failures.push(format!("descriptor {desc}: {e}"));
            }
        }
        if self.state != LifecycleState::Released {
            self.advance(LifecycleState::Released);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

impl<R: PimRuntime> Drop for OperationResources<'_, R> {
    fn drop(&mut self) {
        if self.descriptor.is_none() && self.buffers.is_empty() {
            return;
        }
        if let Err(e) = self.release_all() {
            error!(op_id = %self.op_id, error = %e, "release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::recording::{RecordingRuntime, RuntimeCall};
    use crate::accel::sim::SimRuntime;
    use crate::accel::RuntimeKind;
    use crate::tensor::Tensor;

    fn ready() -> RecordingRuntime<SimRuntime> {
        let rt = RecordingRuntime::new(SimRuntime::new());
        rt.initialize(RuntimeKind::Emulator, Precision::Fp16).unwrap();
        rt
    }

    #[test]
    fn test_drop_releases_in_reverse_order() {
        let rt = ready();
        let a = Tensor::zeros(&[8]);
        let b = Tensor::zeros(&[8]);
        let desc;
        let lhs;
        let rhs;
        {
            let mut res = OperationResources::acquire(
                &rt,
                Uuid::new_v4(),
                DescriptorShape::Eltwise { elements: 8 },
                Precision::Fp16,
            )
            .unwrap();
            // `a` and `b` outlive the guard and nothing executes.
            unsafe {
                lhs = res.bind(MemoryKind::Device, BufferRole::Lhs, a.region()).unwrap();
                rhs = res.bind(MemoryKind::Device, BufferRole::Rhs, b.region()).unwrap();
            }
            assert_eq!(res.state(), LifecycleState::BuffersBound);
            desc = res.descriptor.unwrap();
        }
        let calls = rt.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &[
                RuntimeCall::DestroyBuffer(rhs),
                RuntimeCall::DestroyBuffer(lhs),
                RuntimeCall::DestroyDescriptor(desc),
            ]
        );
        assert!(rt.counts().is_balanced());
    }

    #[test]
    fn test_finish_prefers_execution_error() {
        let rt = ready();
        let res = OperationResources::acquire(
            &rt,
            Uuid::new_v4(),
            DescriptorShape::Eltwise { elements: 8 },
            Precision::Fp16,
        )
        .unwrap();
        let err = res
            .finish(Err(RuntimeError::ExecutionFailed("boom".into())))
            .unwrap_err();
        assert!(matches!(err, OpError::AcceleratorExecutionFailure(_)));
        assert_eq!(rt.live(), (0, 0));
    }

    #[test]
    fn test_release_surfaces_destroy_failure() {
        let rt = ready();
        let res = OperationResources::acquire(
            &rt,
            Uuid::new_v4(),
            DescriptorShape::Eltwise { elements: 8 },
            Precision::Fp16,
        )
        .unwrap();
        let desc = res.descriptor.unwrap();
        // Destroy behind the guard's back so its own release fails.
        rt.destroy_descriptor(desc).unwrap();
        let err = res.release().unwrap_err();
        assert!(matches!(err, OpError::ResourceLeakInvariantViolation(_)));
    }
}
