//! Host emulation of the PIM runtime.
//!
//! Descriptors and buffer objects live in handle tables behind a mutex.
//! `execute` stages every operand into emulator-owned storage while the
//! caller's borrows are still live, then computes either inline (blocking)
//! or on a worker thread (queued) and writes the result back into the
//! output region.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use half::f16;
use tracing::{debug, trace, warn};

use crate::accel::{
    cpu, Activation, BufferId, BufferRole, Completion, DescriptorId, DescriptorShape, EltwiseOp,
    ExecRequest, GemmDims, PimRuntime, Precision, RuntimeError, RuntimeKind,
};
use crate::tensor::{MemoryKind, MemoryRegion};

#[derive(Debug)]
struct SimBuffer {
    desc: DescriptorId,
    role: BufferRole,
    region: MemoryRegion,
}

#[derive(Debug, Default)]
struct SimState {
    initialized: Option<(RuntimeKind, Precision)>,
    next_id: u64,
    descriptors: HashMap<DescriptorId, DescriptorShape>,
    buffers: HashMap<BufferId, SimBuffer>,
}

impl SimState {
    fn issue(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_buffers_of(&self, desc: DescriptorId) -> usize {
        self.buffers.values().filter(|b| b.desc == desc).count()
    }

    fn buffer(&self, id: BufferId) -> Result<&SimBuffer, RuntimeError> {
        self.buffers.get(&id).ok_or(RuntimeError::UnknownBuffer(id))
    }
}

/// Work staged out of caller memory, ready to run without touching it again.
enum Staged {
    Gemm {
        dims: GemmDims,
        weight_channels: usize,
        input: Vec<f16>,
        weight: Vec<f16>,
        bias: Vec<f16>,
        activation: Activation,
    },
    Eltwise {
        op: EltwiseOp,
        lhs: Vec<f16>,
        rhs: Vec<f16>,
    },
}

impl Staged {
    fn run(self) -> Vec<f16> {
        match self {
            Staged::Gemm {
                dims,
                weight_channels,
                input,
                weight,
                bias,
                activation,
            } => cpu::gemm(&dims, weight_channels, &input, &weight, &bias, activation),
            Staged::Eltwise { op, lhs, rhs } => cpu::eltwise(op, &lhs, &rhs),
        }
    }
}

/// Software PIM runtime.
#[derive(Debug, Default)]
pub struct SimRuntime {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed delay to every execution, to make queued work observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().map(|s| s.initialized.is_some()).unwrap_or(false)
    }

    /// `(descriptors, buffers)` currently alive.
    pub fn live_handles(&self) -> (usize, usize) {
        self.lock()
            .map(|s| (s.descriptors.len(), s.buffers.len()))
            .unwrap_or((0, 0))
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::Backend("emulator state lock poisoned".into()))
    }

    fn lock_initialized(&self) -> Result<MutexGuard<'_, SimState>, RuntimeError> {
        let state = self.lock()?;
        if state.initialized.is_none() {
            return Err(RuntimeError::NotInitialized);
        }
        Ok(state)
    }

    fn stage(&self, request: &ExecRequest) -> Result<(Staged, MemoryRegion), RuntimeError> {
        let state = self.lock_initialized()?;
        match *request {
            ExecRequest::Gemm {
                output,
                input,
                weight,
                bias,
                activation,
                extra: _,
            } => {
                let out = state.buffer(output)?;
                let DescriptorShape::Gemm(dims) = descriptor_of(&state, out.desc)? else {
                    return Err(RuntimeError::RoleMismatch {
                        role: out.role,
                        op: "gemm",
                    });
                };
                let parts = [
                    (input, BufferRole::Input),
                    (weight, BufferRole::Weight),
                    (bias, BufferRole::Bias),
                    (output, BufferRole::Output),
                ];
                let mut regions = Vec::with_capacity(parts.len());
                for (id, role) in parts {
                    let buf = state.buffer(id)?;
                    check_binding(buf, out.desc, role, "gemm")?;
                    regions.push(buf.region);
                }
                let weight_channels = regions[1].elements() / dims.weight_plane().max(1);
                Ok((
                    Staged::Gemm {
                        dims,
                        weight_channels,
                        // SAFETY: regions were size-checked at creation and
                        // `create_buffer`'s caller keeps them valid until
                        // the buffer is destroyed and completion observed.
                        input: unsafe { read_region(regions[0]) },
                        weight: unsafe { read_region(regions[1]) },
                        bias: unsafe { read_region(regions[2]) },
                        activation,
                    },
                    regions[3],
                ))
            }
            ExecRequest::Eltwise {
                op,
                output,
                lhs,
                rhs,
            } => {
                let out = state.buffer(output)?;
                let DescriptorShape::Eltwise { .. } = descriptor_of(&state, out.desc)? else {
                    return Err(RuntimeError::RoleMismatch {
                        role: out.role,
                        op: "eltwise",
                    });
                };
                let parts = [
                    (lhs, BufferRole::Lhs),
                    (rhs, BufferRole::Rhs),
                    (output, BufferRole::Output),
                ];
                let mut regions = Vec::with_capacity(parts.len());
                for (id, role) in parts {
                    let buf = state.buffer(id)?;
                    check_binding(buf, out.desc, role, "eltwise")?;
                    regions.push(buf.region);
                }
                Ok((
                    Staged::Eltwise {
                        op,
                        // SAFETY: see the GEMM arm.
                        lhs: unsafe { read_region(regions[0]) },
                        rhs: unsafe { read_region(regions[1]) },
                    },
                    regions[2],
                ))
            }
        }
    }
}

fn descriptor_of(state: &SimState, desc: DescriptorId) -> Result<DescriptorShape, RuntimeError> {
    state
        .descriptors
        .get(&desc)
        .copied()
        .ok_or(RuntimeError::UnknownDescriptor(desc))
}

fn check_binding(
    buf: &SimBuffer,
    desc: DescriptorId,
    role: BufferRole,
    op: &'static str,
) -> Result<(), RuntimeError> {
    if buf.desc != desc || buf.role != role {
        return Err(RuntimeError::RoleMismatch {
            role: buf.role,
            op,
        });
    }
    Ok(())
}

/// Element counts a region must hold for `role` under `shape`.
fn expected_elements(shape: &DescriptorShape, role: BufferRole) -> Option<Vec<usize>> {
    match (shape, role) {
        (DescriptorShape::Gemm(d), BufferRole::Input) => Some(vec![d.input_elements()]),
        (DescriptorShape::Gemm(d), BufferRole::Weight) => {
            let plane = d.weight_plane();
            Some(vec![plane, plane * d.channels])
        }
        (DescriptorShape::Gemm(d), BufferRole::Bias) => Some(vec![d.out_width]),
        (DescriptorShape::Gemm(d), BufferRole::Output) => Some(vec![d.output_elements()]),
        (DescriptorShape::Eltwise { elements }, BufferRole::Lhs)
        | (DescriptorShape::Eltwise { elements }, BufferRole::Rhs)
        | (DescriptorShape::Eltwise { elements }, BufferRole::Output) => Some(vec![*elements]),
        _ => None,
    }
}

/// Copy a region out of caller memory.
///
/// # Safety
/// `region` must describe `elements` initialised f16 values that stay
/// valid and unaliased by writers for the duration of the call.
unsafe fn read_region(region: MemoryRegion) -> Vec<f16> {
    std::slice::from_raw_parts(region.addr() as *const f16, region.elements()).to_vec()
}

/// Copy `values` into caller memory.
///
/// # Safety
/// `region` must describe writable storage for `elements` f16 values that
/// nobody else reads or writes until the completion signal fires.
unsafe fn write_region(region: MemoryRegion, values: &[f16]) {
    let dst = std::slice::from_raw_parts_mut(region.addr() as *mut f16, region.elements());
    dst.copy_from_slice(&values[..region.elements()]);
}

impl PimRuntime for SimRuntime {
    fn initialize(&self, kind: RuntimeKind, precision: Precision) -> Result<(), RuntimeError> {
        if precision != Precision::Fp16 {
            return Err(RuntimeError::UnsupportedPrecision(precision));
        }
        let mut state = self.lock()?;
        if state.initialized.is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }
        if kind != RuntimeKind::Emulator {
            debug!(?kind, "emulating device runtime on the host");
        }
        state.initialized = Some((kind, precision));
        Ok(())
    }

    fn deinitialize(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if state.initialized.is_none() {
            return Err(RuntimeError::NotInitialized);
        }
        if !state.descriptors.is_empty() || !state.buffers.is_empty() {
            warn!(
                descriptors = state.descriptors.len(),
                buffers = state.buffers.len(),
                "deinitializing emulator with live handles"
            );
            return Err(RuntimeError::LiveHandles {
                live_descriptors: state.descriptors.len(),
                live_buffers: state.buffers.len(),
            });
        }
        state.initialized = None;
        Ok(())
    }

    fn create_descriptor(
        &self,
        shape: DescriptorShape,
        precision: Precision,
    ) -> Result<DescriptorId, RuntimeError> {
        if precision != Precision::Fp16 {
            return Err(RuntimeError::UnsupportedPrecision(precision));
        }
        let mut state = self.lock_initialized()?;
        let id = DescriptorId(state.issue());
        state.descriptors.insert(id, shape);
        trace!(%id, op = shape.op_name(), "descriptor created");
        Ok(id)
    }

    unsafe fn create_buffer(
        &self,
        desc: DescriptorId,
        _memory: MemoryKind,
        role: BufferRole,
        region: MemoryRegion,
    ) -> Result<BufferId, RuntimeError> {
        let mut state = self.lock_initialized()?;
        let shape = descriptor_of(&state, desc)?;
        let allowed = expected_elements(&shape, role).ok_or(RuntimeError::RoleMismatch {
            role,
            op: shape.op_name(),
        })?;
        if !allowed.contains(&region.elements()) {
            return Err(RuntimeError::RegionSize {
                role,
                expected: allowed[0],
                actual: region.elements(),
            });
        }
        let id = BufferId(state.issue());
        state.buffers.insert(id, SimBuffer { desc, role, region });
        trace!(%id, %desc, %role, "buffer created");
        Ok(id)
    }

    fn execute(&self, request: ExecRequest, blocking: bool) -> Result<Completion, RuntimeError> {
        let (staged, out_region) = self.stage(&request)?;
        let latency = self.latency;

        if blocking {
            if !latency.is_zero() {
                std::thread::sleep(latency);
            }
            let result = staged.run();
            // SAFETY: the output region belongs to a live buffer, and its
            // creator keeps the storage exclusive until completion.
            unsafe { write_region(out_region, &result) };
            return Ok(Completion::ready(Ok(())));
        }

        let (completion, completer) = Completion::pending();
        std::thread::Builder::new()
            .name("pim-sim-exec".into())
            .spawn(move || {
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                let result = staged.run();
                // SAFETY: `create_buffer`'s contract keeps the output
                // storage alive and untouched until this completion fires.
                unsafe { write_region(out_region, &result) };
                completer.complete(Ok(()));
            })
            .map_err(|e| RuntimeError::Backend(format!("failed to spawn worker: {e}")))?;
        Ok(completion)
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), RuntimeError> {
        let mut state = self.lock_initialized()?;
        state
            .buffers
            .remove(&buffer)
            .map(|_| trace!(%buffer, "buffer destroyed"))
            .ok_or(RuntimeError::UnknownBuffer(buffer))
    }

    fn destroy_descriptor(&self, desc: DescriptorId) -> Result<(), RuntimeError> {
        let mut state = self.lock_initialized()?;
        let live = state.live_buffers_of(desc);
        if live > 0 {
            return Err(RuntimeError::DescriptorInUse { desc, live });
        }
        state
            .descriptors
            .remove(&desc)
            .map(|_| trace!(%desc, "descriptor destroyed"))
            .ok_or(RuntimeError::UnknownDescriptor(desc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn ready() -> SimRuntime {
        let rt = SimRuntime::new();
        rt.initialize(RuntimeKind::Emulator, Precision::Fp16).unwrap();
        rt
    }

    #[test]
    fn test_requires_initialize() {
        let rt = SimRuntime::new();
        let err = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap_err();
        assert_eq!(err, RuntimeError::NotInitialized);
    }

    #[test]
    fn test_rejects_int8() {
        let rt = SimRuntime::new();
        assert_eq!(
            rt.initialize(RuntimeKind::Hip, Precision::Int8),
            Err(RuntimeError::UnsupportedPrecision(Precision::Int8))
        );
    }

    #[test]
    fn test_region_size_checked() {
        let rt = ready();
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 8 }, Precision::Fp16)
            .unwrap();
        let t = Tensor::zeros(&[4]);
        let err = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Lhs, t.region())
        }
        .unwrap_err();
        assert!(matches!(err, RuntimeError::RegionSize { expected: 8, actual: 4, .. }));
        let err = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Weight, t.region())
        }
        .unwrap_err();
        assert!(matches!(err, RuntimeError::RoleMismatch { .. }));
        rt.destroy_descriptor(desc).unwrap();
    }

    #[test]
    fn test_descriptor_outlived_by_buffer_is_refused() {
        let rt = ready();
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap();
        let t = Tensor::zeros(&[4]);
        let bo = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Lhs, t.region())
        }
        .unwrap();
        assert_eq!(
            rt.destroy_descriptor(desc),
            Err(RuntimeError::DescriptorInUse { desc, live: 1 })
        );
        rt.destroy_buffer(bo).unwrap();
        rt.destroy_descriptor(desc).unwrap();
        assert_eq!(rt.live_handles(), (0, 0));
        rt.deinitialize().unwrap();
    }

    #[test]
    fn test_deinitialize_reports_leaks() {
        let rt = ready();
        rt.create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap();
        assert_eq!(
            rt.deinitialize(),
            Err(RuntimeError::LiveHandles {
                live_descriptors: 1,
                live_buffers: 0
            })
        );
    }

    #[test]
    fn test_refused_deinitialize_stays_initialized() {
        let rt = ready();
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 4 }, Precision::Fp16)
            .unwrap();
        assert!(rt.deinitialize().is_err());
        // still up, so the leak can be cleaned and teardown retried
        rt.destroy_descriptor(desc).unwrap();
        rt.deinitialize().unwrap();
        assert_eq!(rt.deinitialize(), Err(RuntimeError::NotInitialized));
    }

    #[test]
    fn test_raw_eltwise_roundtrip() {
        let rt = ready();
        let lhs = Tensor::full(&[32], 1.0);
        let rhs = Tensor::full(&[32], 2.0);
        let mut out = Tensor::zeros(&[32]);
        let desc = rt
            .create_descriptor(DescriptorShape::Eltwise { elements: 32 }, Precision::Fp16)
            .unwrap();
        let a = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Lhs, lhs.region())
        }
        .unwrap();
        let b = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Rhs, rhs.region())
        }
        .unwrap();
        let o = unsafe {
            rt.create_buffer(desc, MemoryKind::Device, BufferRole::Output, out.region_mut())
        }
        .unwrap();
        let done = rt
            .execute(
                ExecRequest::Eltwise {
                    op: EltwiseOp::Add,
                    output: o,
                    lhs: a,
                    rhs: b,
                },
                false,
            )
            .unwrap();
        done.wait().unwrap();
        for id in [o, b, a] {
            rt.destroy_buffer(id).unwrap();
        }
        rt.destroy_descriptor(desc).unwrap();
        assert!(out.to_f32_vec().iter().all(|v| *v == 3.0));
    }
}
