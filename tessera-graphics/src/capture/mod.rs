//! Headless backend that keeps every resource in host memory
//! and executes submitted commands on the CPU.
//!
//! It validates the usage rules that a real driver would enforce
//! (bound memory, update flags, buffer bounds) by panicking, and
//! exposes the resulting state for inspection.

mod command;
mod resource;

use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

/// Bytes of object storage per primitive or instance.
const OBJECT_BYTES_PER_PRIMITIVE: u64 = 64;
const BUILD_SCRATCH_BYTES_PER_PRIMITIVE: u64 = 128;
const UPDATE_SCRATCH_BYTES_PER_PRIMITIVE: u64 = 32;
const STRUCTURE_ALIGNMENT: u64 = 256;

struct BufferRecord {
    name: String,
    usage: crate::BufferUsage,
    memory: crate::Memory,
    storage: Box<[u8]>,
}

struct AllocationRecord {
    name: String,
    size: u64,
}

/// Observable state of an acceleration structure.
#[derive(Clone, Debug, PartialEq)]
pub struct StructureInfo {
    pub name: String,
    pub ty: crate::AccelerationStructureType,
    pub flags: crate::AccelerationStructureFlags,
    pub max_instance_count: u32,
    pub primitive_count: u32,
    pub memory: Option<crate::Allocation>,
    pub reference: crate::AccelerationStructureReference,
    pub build_count: u32,
    pub update_count: u32,
    pub copy_count: u32,
    /// Instances consumed by the last top-level build.
    pub instances: Vec<crate::AccelerationStructureInstance>,
}

impl StructureInfo {
    pub fn is_built(&self) -> bool {
        self.build_count != 0 || self.copy_count != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorEntry {
    AccelerationStructure(crate::AccelerationStructure),
    StorageBuffer(crate::BufferBinding),
    UniformBuffer(crate::BufferBinding),
    CombinedImageSampler(crate::TextureBinding),
}

#[derive(Default)]
struct DescriptorSetRecord {
    name: String,
    entries: BTreeMap<(u32, u32), DescriptorEntry>,
}

#[derive(Clone, Debug)]
pub struct CapturedSubmission {
    pub name: String,
    pub commands: Vec<crate::Command>,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<u64, BufferRecord>,
    allocations: HashMap<u64, AllocationRecord>,
    structures: HashMap<u64, StructureInfo>,
    descriptor_sets: HashMap<u64, DescriptorSetRecord>,
    submissions: Vec<CapturedSubmission>,
    descriptor_write_count: usize,
    allocated_bytes: u64,
}

pub struct Context {
    inner: Mutex<Inner>,
    next_raw: AtomicU64,
    memory_budget: Option<u64>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_raw: AtomicU64::new(1),
            memory_budget: None,
        }
    }

    /// Create a context that fails allocations once `bytes` are in use.
    pub fn with_memory_budget(bytes: u64) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::new()
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_raw.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve(
        &self,
        inner: &mut Inner,
        name: &str,
        size: u64,
        memory: crate::Memory,
    ) -> Result<(), crate::DeviceError> {
        if let Some(budget) = self.memory_budget {
            if inner.allocated_bytes + size > budget {
                log::warn!(
                    "Allocation of {} bytes for '{}' exceeds the budget of {}",
                    size,
                    name,
                    budget
                );
                return Err(crate::DeviceError::OutOfMemory {
                    name: name.to_string(),
                    memory,
                    size,
                });
            }
        }
        inner.allocated_bytes += size;
        Ok(())
    }

    /// Total bytes currently held by buffers and memory allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.inner.lock().allocated_bytes
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn buffer_name(&self, buffer: crate::Buffer) -> Option<String> {
        let inner = self.inner.lock();
        inner.buffers.get(&buffer.raw()).map(|rb| rb.name.clone())
    }

    pub fn buffer_usage(&self, buffer: crate::Buffer) -> Option<crate::BufferUsage> {
        let inner = self.inner.lock();
        inner.buffers.get(&buffer.raw()).map(|rb| rb.usage)
    }

    pub fn buffer_memory(&self, buffer: crate::Buffer) -> Option<crate::Memory> {
        let inner = self.inner.lock();
        inner.buffers.get(&buffer.raw()).map(|rb| rb.memory)
    }

    /// Copy of the buffer contents, including device-local ones.
    pub fn read_buffer(&self, buffer: crate::Buffer) -> Vec<u8> {
        let inner = self.inner.lock();
        match inner.buffers.get(&buffer.raw()) {
            Some(rb) => rb.storage.to_vec(),
            None => panic!("Buffer {:?} is not alive", buffer),
        }
    }

    pub fn memory_allocation_count(&self) -> usize {
        self.inner.lock().allocations.len()
    }

    pub fn allocation_name(&self, allocation: crate::Allocation) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .allocations
            .get(&allocation.raw)
            .map(|ar| format!("{} ({} bytes)", ar.name, ar.size))
    }

    pub fn structure_count(&self) -> usize {
        self.inner.lock().structures.len()
    }

    pub fn structure(
        &self,
        acceleration_structure: crate::AccelerationStructure,
    ) -> Option<StructureInfo> {
        let inner = self.inner.lock();
        inner.structures.get(&acceleration_structure.raw()).cloned()
    }

    pub fn descriptor(
        &self,
        set: crate::DescriptorSet,
        binding: u32,
        array_element: u32,
    ) -> Option<DescriptorEntry> {
        let inner = self.inner.lock();
        inner
            .descriptor_sets
            .get(&set.raw())
            .and_then(|record| record.entries.get(&(binding, array_element)).copied())
    }

    /// Number of populated array elements in a binding of the set.
    pub fn descriptor_count(&self, set: crate::DescriptorSet, binding: u32) -> usize {
        let inner = self.inner.lock();
        match inner.descriptor_sets.get(&set.raw()) {
            Some(record) => record
                .entries
                .range((binding, 0)..=(binding, u32::MAX))
                .count(),
            None => 0,
        }
    }

    pub fn descriptor_set_name(&self, set: crate::DescriptorSet) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .descriptor_sets
            .get(&set.raw())
            .map(|record| record.name.clone())
    }

    /// Number of individual `DescriptorWrite` entries applied so far.
    pub fn descriptor_write_count(&self) -> usize {
        self.inner.lock().descriptor_write_count
    }

    pub fn submissions(&self) -> Vec<CapturedSubmission> {
        self.inner.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.inner.lock().submissions.len()
    }
}
