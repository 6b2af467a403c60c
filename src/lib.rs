//! pimbridge -- tensor operations dispatched to a processing-in-memory
//! accelerator runtime.
//!
//! The crate wraps a PIM runtime (device or host emulation) behind the
//! [`PimRuntime`] trait and exposes GEMM, dense and elementwise operations
//! through [`AcceleratorClient`]. Every invocation creates its own operation
//! descriptor and buffer objects and releases them on every exit path.

pub mod accel;
pub mod config;
pub mod layers;
pub mod ops;
pub mod tensor;
pub mod verify;

pub use accel::recording::RecordingRuntime;
pub use accel::sim::SimRuntime;
pub use accel::{Activation, EltwiseOp, PimRuntime, Precision, RuntimeKind, RuntimeSession};
pub use ops::{AcceleratorClient, LifecycleState, OpError, PendingGemm};
pub use tensor::{MemoryKind, Tensor};
