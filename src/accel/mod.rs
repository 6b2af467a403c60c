//! PIM runtime boundary -- the handle-based accelerator API and its backends.
//!
//! Everything the client knows about the accelerator goes through
//! [`PimRuntime`]: bracketing initialize/deinitialize calls, descriptor and
//! buffer-object creation, execution, and teardown. Backends:
//!
//! - [`sim::SimRuntime`]: host emulation in binary16, blocking or queued.
//! - [`recording::RecordingRuntime`]: wraps another runtime, counts calls
//!   and injects faults.
//! - [`cpu`]: scalar reference kernels shared by the emulator and the
//!   functional verifier.

pub mod cpu;
pub mod recording;
pub mod session;
pub mod sim;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{MemoryKind, MemoryRegion};

pub use session::RuntimeSession;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a runtime backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error("unknown descriptor {0}")]
    UnknownDescriptor(DescriptorId),

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("descriptor {desc} still has {live} live buffer(s)")]
    DescriptorInUse { desc: DescriptorId, live: usize },

    #[error("{live_descriptors} descriptor(s) and {live_buffers} buffer(s) still alive")]
    LiveHandles {
        live_descriptors: usize,
        live_buffers: usize,
    },

    #[error("{role} buffer expects {expected} element(s), region holds {actual}")]
    RegionSize {
        role: BufferRole,
        expected: usize,
        actual: usize,
    },

    #[error("buffer role {role} is not valid for a {op} descriptor")]
    RoleMismatch { role: BufferRole, op: &'static str },

    #[error("unsupported precision {0:?}")]
    UnsupportedPrecision(Precision),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Handles and enums
// ---------------------------------------------------------------------------

/// Opaque descriptor handle issued by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DescriptorId(pub u64);

/// Opaque buffer-object handle issued by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u64);

/// Queue / stream hint forwarded untouched to `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamHandle(pub u64);

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "desc#{}", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Which runtime flavour to bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// ROCm / HIP device runtime.
    Hip,
    /// OpenCL device runtime.
    OpenCl,
    /// Host emulation, no device required.
    Emulator,
}

/// Numeric format of an operation. Only binary16 is wired through today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp16,
    Int8,
}

/// Role a buffer object plays inside its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferRole {
    Input,
    Weight,
    Bias,
    Output,
    Lhs,
    Rhs,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferRole::Input => "input",
            BufferRole::Weight => "weight",
            BufferRole::Bias => "bias",
            BufferRole::Output => "output",
            BufferRole::Lhs => "lhs",
            BufferRole::Rhs => "rhs",
        };
        f.write_str(s)
    }
}

/// Post-op fused into a GEMM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Activation::None),
            "relu" => Ok(Activation::Relu),
            other => Err(format!("unknown activation '{other}' (expected none|relu)")),
        }
    }
}

/// Elementwise binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseOp {
    Add,
    Mul,
}

impl std::str::FromStr for EltwiseOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(EltwiseOp::Add),
            "mul" => Ok(EltwiseOp::Mul),
            other => Err(format!("unknown elementwise op '{other}' (expected add|mul)")),
        }
    }
}

/// GEMM problem size: `(batch, channels, rows, in_width) x (in_width, out_width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GemmDims {
    pub batch: usize,
    pub channels: usize,
    pub rows: usize,
    pub in_width: usize,
    pub out_width: usize,
}

impl GemmDims {
    pub fn input_elements(&self) -> usize {
        self.batch * self.channels * self.rows * self.in_width
    }

    pub fn output_elements(&self) -> usize {
        self.batch * self.channels * self.rows * self.out_width
    }

    /// Weight element count for a single (broadcast) weight channel.
    pub fn weight_plane(&self) -> usize {
        self.in_width * self.out_width
    }
}

/// Shape parameters a descriptor is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DescriptorShape {
    Gemm(GemmDims),
    Eltwise { elements: usize },
}

impl DescriptorShape {
    pub fn op_name(&self) -> &'static str {
        match self {
            DescriptorShape::Gemm(_) => "gemm",
            DescriptorShape::Eltwise { .. } => "eltwise",
        }
    }
}

/// Buffers and parameters of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecRequest {
    Gemm {
        output: BufferId,
        input: BufferId,
        weight: BufferId,
        bias: BufferId,
        activation: Activation,
        extra: Option<StreamHandle>,
    },
    Eltwise {
        op: EltwiseOp,
        output: BufferId,
        lhs: BufferId,
        rhs: BufferId,
    },
}

// ---------------------------------------------------------------------------
// Runtime trait
// ---------------------------------------------------------------------------

/// The accelerator runtime API.
///
/// Implementations must be callable from several threads at once; each
/// invocation works on its own descriptor and buffer set.
pub trait PimRuntime: Send + Sync {
    /// Bring the runtime up. Called once per session.
    fn initialize(&self, kind: RuntimeKind, precision: Precision) -> Result<(), RuntimeError>;

    /// Tear the runtime down. Called once per session.
    fn deinitialize(&self) -> Result<(), RuntimeError>;

    fn create_descriptor(
        &self,
        shape: DescriptorShape,
        precision: Precision,
    ) -> Result<DescriptorId, RuntimeError>;

    /// Wrap caller-owned memory as a buffer object bound to `desc`.
    ///
    /// # Safety
    ///
    /// The runtime reads and writes `region` without holding a borrow of
    /// its owner. The caller must keep the memory allocated and
    /// unreallocated from this call until the buffer is destroyed and
    /// every execution submitted against it has reported completion. A
    /// region bound as [`BufferRole::Output`] must not be read or written
    /// by anything else over that span.
    unsafe fn create_buffer(
        &self,
        desc: DescriptorId,
        memory: MemoryKind,
        role: BufferRole,
        region: MemoryRegion,
    ) -> Result<BufferId, RuntimeError>;

    /// Submit work. With `blocking` set the returned token is already
    /// complete; otherwise the caller must wait on it before touching the
    /// output memory or destroying any buffer involved.
    fn execute(&self, request: ExecRequest, blocking: bool) -> Result<Completion, RuntimeError>;

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), RuntimeError>;

    fn destroy_descriptor(&self, desc: DescriptorId) -> Result<(), RuntimeError>;
}

// ---------------------------------------------------------------------------
// Completion tokens
// ---------------------------------------------------------------------------

type Outcome = Result<(), RuntimeError>;

#[derive(Debug, Default)]
struct Signal {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

/// Completion signal for one submitted execution.
#[derive(Debug)]
pub struct Completion {
    signal: Arc<Signal>,
}

/// Producer side of a [`Completion`]. Dropping it without completing marks
/// the execution as failed so waiters never hang.
#[derive(Debug)]
pub struct Completer {
    signal: Option<Arc<Signal>>,
}

impl Completion {
    /// A token that is already complete with `outcome`.
    pub fn ready(outcome: Outcome) -> Self {
        let signal = Arc::new(Signal::default());
        if let Ok(mut slot) = signal.outcome.lock() {
            *slot = Some(outcome);
        }
        Self { signal }
    }

    /// A pending token and the handle used to complete it.
    pub fn pending() -> (Self, Completer) {
        let signal = Arc::new(Signal::default());
        (
            Self {
                signal: Arc::clone(&signal),
            },
            Completer {
                signal: Some(signal),
            },
        )
    }

    /// Whether the execution has finished (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.signal
            .outcome
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }

    /// Block until the execution finishes and return its outcome.
    pub fn wait(self) -> Outcome {
        let mut slot = self
            .signal
            .outcome
            .lock()
            .map_err(|_| RuntimeError::Backend("completion lock poisoned".into()))?;
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self
                .signal
                .done
                .wait(slot)
                .map_err(|_| RuntimeError::Backend("completion lock poisoned".into()))?;
        }
    }
}

impl Completer {
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(signal) = self.signal.take() {
            signal.finish(outcome);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.finish(Err(RuntimeError::ExecutionFailed(
                "worker dropped before signalling completion".into(),
            )));
        }
    }
}

impl Signal {
    fn finish(&self, outcome: Outcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }
}
