use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info};

use crate::accel::{PimRuntime, Precision, RuntimeError, RuntimeKind};

/// A runtime brought up for the lifetime of this value.
///
/// `new` calls `initialize` exactly once; `shutdown` (or drop) tears the
/// runtime down, and a successful teardown happens exactly once. Clients share a session through `Arc`, so
/// independent sessions never see each other's state.
pub struct RuntimeSession<R: PimRuntime> {
    runtime: R,
    kind: RuntimeKind,
    precision: Precision,
    active: AtomicBool,
}

impl<R: PimRuntime> RuntimeSession<R> {
    pub fn new(runtime: R, kind: RuntimeKind, precision: Precision) -> Result<Self, RuntimeError> {
        runtime.initialize(kind, precision)?;
        info!(?kind, ?precision, "PIM runtime session initialized");
        Ok(Self {
            runtime,
            kind,
            precision,
            active: AtomicBool::new(true),
        })
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deinitialize now and report the runtime's verdict.
    ///
    /// Idempotent: once the runtime accepts teardown, later calls (and the
    /// drop) do nothing. A refused teardown leaves the session active so
    /// the caller can release what is still live and try again. The runtime
    /// stays reachable through [`runtime`](Self::runtime) afterwards.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(kind = ?self.kind, "deinitializing PIM runtime session");
        let outcome = self.runtime.deinitialize();
        if outcome.is_err() {
            self.active.store(true, Ordering::Release);
        }
        outcome
    }
}

impl<R: PimRuntime> Drop for RuntimeSession<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "PIM runtime deinitialize failed");
        }
    }
}
