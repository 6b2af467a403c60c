//! Host-side f16 tensors and the raw memory regions wrapped by buffer objects.
//!
//! A [`Tensor`] always owns its storage. Buffer objects on the accelerator
//! side only ever see a [`MemoryRegion`] (address + length), never the
//! tensor itself.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Where a tensor's storage notionally lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Plain host memory.
    Host,
    /// GPU device memory (the usual placement for framework tensors).
    Device,
    /// Memory already laid out for processing-in-memory banks.
    Pim,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Host => f.write_str("host"),
            MemoryKind::Device => f.write_str("device"),
            MemoryKind::Pim => f.write_str("pim"),
        }
    }
}

/// A non-owning view of tensor storage handed to the runtime.
///
/// Holding a region does not keep the memory alive; the client ties its
/// validity to a borrow of the owning tensor. Only [`Tensor::region`] and
/// [`Tensor::region_mut`] hand one out, so a region always starts life
/// describing real tensor storage:
///
/// ```compile_fail
/// let forged = pimbridge::tensor::MemoryRegion { addr: 0x10, elements: 4 };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    addr: usize,
    elements: usize,
}

impl MemoryRegion {
    /// Start address of the storage.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Number of f16 elements covered.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Size of the region in bytes (elements are always f16).
    pub fn byte_len(&self) -> usize {
        self.elements * std::mem::size_of::<f16>()
    }
}

/// Dense row-major tensor of 16-bit floats.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f16>,
    memory: MemoryKind,
}

impl Tensor {
    /// Build a tensor from raw f16 values. Returns `None` if `data` does not
    /// hold exactly `shape.iter().product()` elements.
    pub fn from_vec(shape: &[usize], data: Vec<f16>) -> Option<Self> {
        if numel(shape) != data.len() {
            return None;
        }
        Some(Self {
            shape: shape.to_vec(),
            data,
            memory: MemoryKind::Device,
        })
    }

    /// Build a tensor from f32 values, rounding each to f16.
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Option<Self> {
        Self::from_vec(shape, values.iter().map(|v| f16::from_f32(*v)).collect())
    }

    /// Tensor filled with a single value.
    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![f16::from_f32(value); numel(shape)],
            memory: MemoryKind::Device,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Uninitialised-output stand-in: storage sized for `shape`, zero filled.
    pub fn empty(shape: &[usize], memory: MemoryKind) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![f16::ZERO; numel(shape)],
            memory,
        }
    }

    /// Seeded pseudo-random tensor with values in `[-1, 1)`.
    pub fn random(shape: &[usize], seed: u64) -> Self {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..numel(shape))
            .map(|_| f16::from_f32(rng.gen_range(-1.0f32..1.0)))
            .collect();
        Self {
            shape: shape.to_vec(),
            data,
            memory: MemoryKind::Device,
        }
    }

    pub fn with_memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// Size of dimension `axis`, counting from the end when negative.
    pub fn dim(&self, axis: isize) -> Option<usize> {
        let idx = if axis < 0 {
            self.shape.len().checked_sub(axis.unsigned_abs())?
        } else {
            axis as usize
        };
        self.shape.get(idx).copied()
    }

    pub fn data(&self) -> &[f16] {
        &self.data
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f32()).collect()
    }

    /// Insert a size-1 axis at `axis` without touching the data.
    pub fn unsqueeze(mut self, axis: usize) -> Self {
        let axis = axis.min(self.shape.len());
        self.shape.insert(axis, 1);
        self
    }

    /// Order-independent-enough checksum for quick comparisons in reports.
    pub fn checksum(&self) -> f64 {
        self.data.iter().map(|v| v.to_f64()).sum()
    }

    /// Region describing this tensor's storage for read-only use.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion {
            addr: self.data.as_ptr() as usize,
            elements: self.data.len(),
        }
    }

    /// Region describing this tensor's storage as a write target.
    pub fn region_mut(&mut self) -> MemoryRegion {
        MemoryRegion {
            addr: self.data.as_mut_ptr() as usize,
            elements: self.data.len(),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("memory", &self.memory)
            .field("numel", &self.data.len())
            .finish()
    }
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
