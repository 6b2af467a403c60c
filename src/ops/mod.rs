//! Accelerator operation client.
//!
//! Each operation follows the same lifecycle: create a descriptor, wrap the
//! caller's tensors as buffer objects, execute, destroy the buffers, destroy
//! the descriptor. Acquisition goes through [`guard::OperationResources`],
//! which releases whatever it holds on every exit path.

pub mod dense;
pub mod eltwise;
pub mod gemm;
pub mod guard;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::accel::{PimRuntime, Precision, RuntimeError, RuntimeSession};

pub use gemm::{plan_gemm, GemmPlan, PendingGemm};

#[derive(Debug, Error)]
pub enum OpError {
    /// An operand's rank is outside the supported set. Reported before any
    /// runtime call.
    #[error("{operand} rank {rank} not supported (expected one of {supported:?})")]
    UnsupportedRank {
        operand: &'static str,
        rank: usize,
        supported: &'static [usize],
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The runtime refused or failed the work. All handles were released
    /// before this was returned.
    #[error("accelerator execution failed: {0}")]
    AcceleratorExecutionFailure(#[source] RuntimeError),

    /// A descriptor or buffer could not be destroyed.
    #[error("resource release failed: {0}")]
    ResourceLeakInvariantViolation(String),

    #[error("{op} has no backward pass")]
    GradientUnsupported { op: &'static str },
}

/// Per-invocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LifecycleState {
    Unallocated,
    DescriptorCreated,
    BuffersBound,
    Executing,
    Completed,
    Failed,
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unallocated => "unallocated",
            LifecycleState::DescriptorCreated => "descriptor_created",
            LifecycleState::BuffersBound => "buffers_bound",
            LifecycleState::Executing => "executing",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Issues GEMM, elementwise and dense operations against one runtime session.
///
/// Holds no per-invocation state, so a single client can be shared across
/// threads.
pub struct AcceleratorClient<R: PimRuntime> {
    session: Arc<RuntimeSession<R>>,
}

impl<R: PimRuntime> Clone for AcceleratorClient<R> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<R: PimRuntime> AcceleratorClient<R> {
    pub fn new(session: Arc<RuntimeSession<R>>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<RuntimeSession<R>> {
        &self.session
    }

    pub fn runtime(&self) -> &R {
        self.session.runtime()
    }

    pub fn precision(&self) -> Precision {
        self.session.precision()
    }
}
