//! Call-recording wrapper around another runtime.
//!
//! Counts every create/destroy/execute call, keeps an ordered call log and
//! can inject failures into buffer creation and execution. Lifecycle audits
//! (tests and `pimbridge verify`) run the client against this wrapper.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::accel::{
    BufferId, BufferRole, Completion, DescriptorId, DescriptorShape, ExecRequest, PimRuntime,
    Precision, RuntimeError, RuntimeKind,
};
use crate::tensor::{MemoryKind, MemoryRegion};

/// Calls kept in the log by default; older ones are evicted first.
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 4096;

/// One recorded runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RuntimeCall {
    Initialize,
    Deinitialize,
    CreateDescriptor(DescriptorId),
    CreateBuffer(BufferId, BufferRole),
    Execute { blocking: bool },
    DestroyBuffer(BufferId),
    DestroyDescriptor(DescriptorId),
}

/// Snapshot of call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleCounts {
    pub initializations: usize,
    pub deinitializations: usize,
    pub descriptors_created: usize,
    pub descriptors_destroyed: usize,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub executions: usize,
}

impl LifecycleCounts {
    /// Every descriptor and buffer created has been destroyed.
    pub fn is_balanced(&self) -> bool {
        self.descriptors_created == self.descriptors_destroyed
            && self.buffers_created == self.buffers_destroyed
    }

    /// No runtime handle was ever created.
    pub fn is_untouched(&self) -> bool {
        self.descriptors_created == 0 && self.buffers_created == 0 && self.executions == 0
    }

    /// Counter growth between `earlier` and `self`.
    pub fn since(&self, earlier: &LifecycleCounts) -> LifecycleCounts {
        LifecycleCounts {
            initializations: self.initializations - earlier.initializations,
            deinitializations: self.deinitializations - earlier.deinitializations,
            descriptors_created: self.descriptors_created - earlier.descriptors_created,
            descriptors_destroyed: self.descriptors_destroyed - earlier.descriptors_destroyed,
            buffers_created: self.buffers_created - earlier.buffers_created,
            buffers_destroyed: self.buffers_destroyed - earlier.buffers_destroyed,
            executions: self.executions - earlier.executions,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    initializations: AtomicUsize,
    deinitializations: AtomicUsize,
    descriptors_created: AtomicUsize,
    descriptors_destroyed: AtomicUsize,
    buffers_created: AtomicUsize,
    buffers_destroyed: AtomicUsize,
    executions: AtomicUsize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_execute: AtomicBool,
    fail_next_completion: AtomicBool,
    /// Fail the n-th upcoming `create_buffer` (1-based); 0 means disarmed.
    fail_buffer_in: AtomicUsize,
}

/// Recording / fault-injecting runtime wrapper.
#[derive(Debug)]
pub struct RecordingRuntime<R: PimRuntime> {
    inner: R,
    counters: Counters,
    faults: Faults,
    calls: Mutex<VecDeque<RuntimeCall>>,
    call_capacity: usize,
    evicted_calls: AtomicUsize,
    live_descriptors: Mutex<HashSet<DescriptorId>>,
    live_buffers: Mutex<HashSet<BufferId>>,
}

impl<R: PimRuntime> RecordingRuntime<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            counters: Counters::default(),
            faults: Faults::default(),
            calls: Mutex::new(VecDeque::new()),
            call_capacity: DEFAULT_CALL_LOG_CAPACITY,
            evicted_calls: AtomicUsize::new(0),
            live_descriptors: Mutex::new(HashSet::new()),
            live_buffers: Mutex::new(HashSet::new()),
        }
    }

    /// Keep at most `capacity` calls in the log. Counters are unaffected.
    pub fn with_call_log_capacity(mut self, capacity: usize) -> Self {
        self.call_capacity = capacity;
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn counts(&self) -> LifecycleCounts {
        let c = &self.counters;
        LifecycleCounts {
            initializations: c.initializations.load(Ordering::SeqCst),
            deinitializations: c.deinitializations.load(Ordering::SeqCst),
            descriptors_created: c.descriptors_created.load(Ordering::SeqCst),
            descriptors_destroyed: c.descriptors_destroyed.load(Ordering::SeqCst),
            buffers_created: c.buffers_created.load(Ordering::SeqCst),
            buffers_destroyed: c.buffers_destroyed.load(Ordering::SeqCst),
            executions: c.executions.load(Ordering::SeqCst),
        }
    }

    /// Ordered log of the most recent calls, oldest first.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls
            .lock()
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Calls dropped from the front of the log to respect its capacity.
    pub fn evicted_calls(&self) -> usize {
        self.evicted_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// `(descriptors, buffers)` created through this wrapper and not yet destroyed.
    pub fn live(&self) -> (usize, usize) {
        let d = self.live_descriptors.lock().map(|s| s.len()).unwrap_or(0);
        let b = self.live_buffers.lock().map(|s| s.len()).unwrap_or(0);
        (d, b)
    }

    /// Make the next `execute` call fail synchronously.
    pub fn fail_next_execute(&self) {
        self.faults.fail_next_execute.store(true, Ordering::SeqCst);
    }

    /// Let the next `execute` be submitted but report failure on completion.
    pub fn fail_next_completion(&self) {
        self.faults.fail_next_completion.store(true, Ordering::SeqCst);
    }

    /// Make the `nth` upcoming `create_buffer` call fail (1-based).
    pub fn fail_buffer_creation(&self, nth: usize) {
        self.faults.fail_buffer_in.store(nth, Ordering::SeqCst);
    }

    fn record(&self, call: RuntimeCall) {
        if self.call_capacity == 0 {
            self.evicted_calls.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if let Ok(mut calls) = self.calls.lock() {
            if calls.len() >= self.call_capacity {
                calls.pop_front();
                self.evicted_calls.fetch_add(1, Ordering::SeqCst);
            }
            calls.push_back(call);
        }
    }

    fn buffer_fault_fires(&self) -> bool {
        let armed = &self.faults.fail_buffer_in;
        let mut current = armed.load(Ordering::SeqCst);
        while current > 0 {
            match armed.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return current == 1,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

impl<R: PimRuntime> PimRuntime for RecordingRuntime<R> {
    fn initialize(&self, kind: RuntimeKind, precision: Precision) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Initialize);
        self.counters.initializations.fetch_add(1, Ordering::SeqCst);
        self.inner.initialize(kind, precision)
    }

    fn deinitialize(&self) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Deinitialize);
        self.counters.deinitializations.fetch_add(1, Ordering::SeqCst);
        self.inner.deinitialize()
    }

    fn create_descriptor(
        &self,
        shape: DescriptorShape,
        precision: Precision,
    ) -> Result<DescriptorId, RuntimeError> {
        let id = self.inner.create_descriptor(shape, precision)?;
        self.counters.descriptors_created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live_descriptors.lock() {
            live.insert(id);
        }
        self.record(RuntimeCall::CreateDescriptor(id));
        Ok(id)
    }

    unsafe fn create_buffer(
        &self,
        desc: DescriptorId,
        memory: MemoryKind,
        role: BufferRole,
        region: MemoryRegion,
    ) -> Result<BufferId, RuntimeError> {
        if self.buffer_fault_fires() {
            debug!(%desc, %role, "injected buffer creation failure");
            return Err(RuntimeError::Backend("injected buffer creation failure".into()));
        }
        // SAFETY: forwarded unchanged, so our caller's guarantee covers it.
        let id = unsafe { self.inner.create_buffer(desc, memory, role, region)? };
        self.counters.buffers_created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live_buffers.lock() {
            live.insert(id);
        }
        self.record(RuntimeCall::CreateBuffer(id, role));
        Ok(id)
    }

    fn execute(&self, request: ExecRequest, blocking: bool) -> Result<Completion, RuntimeError> {
        self.record(RuntimeCall::Execute { blocking });
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_next_execute.swap(false, Ordering::SeqCst) {
            debug!("injected execute failure");
            return Err(RuntimeError::ExecutionFailed("injected execute failure".into()));
        }
        let completion = self.inner.execute(request, blocking)?;
        if self.faults.fail_next_completion.swap(false, Ordering::SeqCst) {
            debug!("injected completion failure");
            // The real work must still drain before the failure is reported.
            let _ = completion.wait();
            return Ok(Completion::ready(Err(RuntimeError::ExecutionFailed(
                "injected completion failure".into(),
            ))));
        }
        Ok(completion)
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::DestroyBuffer(buffer));
        self.inner.destroy_buffer(buffer)?;
        self.counters.buffers_destroyed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live_buffers.lock() {
            live.remove(&buffer);
        }
        Ok(())
    }

    fn destroy_descriptor(&self, desc: DescriptorId) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::DestroyDescriptor(desc));
        self.inner.destroy_descriptor(desc)?;
        self.counters.descriptors_destroyed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live_descriptors.lock() {
            live.remove(&desc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::sim::SimRuntime;
    use crate::tensor::Tensor;

    fn ready() -> RecordingRuntime<SimRuntime> {
        let rt = RecordingRuntime::new(SimRuntime::new());
        rt.initialize(RuntimeKind::Emulator, Precision::Fp16).unwrap();
        rt
    }

    #[test]
    fn test_counts_and_live_tracking() {
        let rt = ready();
        let t = Tensor::zeros(&[4]);
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap();
        let bo = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Lhs, t.region())
        }
        .unwrap();
        assert_eq!(rt.live(), (1, 1));
        rt.destroy_buffer(bo).unwrap();
        rt.destroy_descriptor(desc).unwrap();

        let counts = rt.counts();
        assert_eq!(counts.descriptors_created, 1);
        assert_eq!(counts.buffers_destroyed, 1);
        assert!(counts.is_balanced());
        assert_eq!(rt.live(), (0, 0));
        assert_eq!(
            rt.calls(),
            vec![
                RuntimeCall::Initialize,
                RuntimeCall::CreateDescriptor(desc),
                RuntimeCall::CreateBuffer(bo, BufferRole::Lhs),
                RuntimeCall::DestroyBuffer(bo),
                RuntimeCall::DestroyDescriptor(desc),
            ]
        );
    }

    #[test]
    fn test_buffer_fault_fires_once_on_nth_call() {
        let rt = ready();
        let t = Tensor::zeros(&[4]);
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap();
        rt.fail_buffer_creation(2);
        let first = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Lhs, t.region())
        };
        let second = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Rhs, t.region())
        };
        let third = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Rhs, t.region())
        };
        assert!(first.is_ok());
        assert!(second.is_err());
        assert!(third.is_ok());
        assert_eq!(rt.counts().buffers_created, 2);
    }

    #[test]
    fn test_call_log_is_bounded() {
        let rt = RecordingRuntime::new(SimRuntime::new()).with_call_log_capacity(3);
        rt.initialize(RuntimeKind::Emulator, Precision::Fp16).unwrap();
        let shape = DescriptorShape::Eltwise { elements: 4 };
        let descs: Vec<_> = (0..50)
            .map(|_| rt.create_descriptor(shape, Precision::Fp16).unwrap())
            .collect();
        for desc in &descs {
            rt.destroy_descriptor(*desc).unwrap();
        }

        assert_eq!(
            rt.calls(),
            vec![
                RuntimeCall::DestroyDescriptor(descs[47]),
                RuntimeCall::DestroyDescriptor(descs[48]),
                RuntimeCall::DestroyDescriptor(descs[49]),
            ]
        );
        assert_eq!(rt.evicted_calls(), 101 - 3);
        // counters still see everything
        assert_eq!(rt.counts().descriptors_created, 50);
        assert!(rt.counts().is_balanced());
    }

    #[test]
    fn test_since_diffs_counters() {
        let before = LifecycleCounts {
            buffers_created: 4,
            ..Default::default()
        };
        let after = LifecycleCounts {
            buffers_created: 8,
            buffers_destroyed: 4,
            ..Default::default()
        };
        let delta = after.since(&before);
        assert_eq!(delta.buffers_created, 4);
        assert_eq!(delta.buffers_destroyed, 4);
        assert!(delta.is_balanced());
    }
}
