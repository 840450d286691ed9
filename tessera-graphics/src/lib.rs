#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Push commands are more regular than macros.
    clippy::vec_init_then_push,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod capture;
mod command;
mod traits;

pub use command::*;
pub use traits::*;

use std::ptr;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of {memory:?} memory: `{name}` needs {size} bytes")]
    OutOfMemory {
        name: String,
        memory: Memory,
        size: u64,
    },
    #[error("unable to create {kind} `{name}`")]
    ResourceCreation { kind: &'static str, name: String },
    #[error("device is lost")]
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Memory {
    /// Device-local, not visible to the host.
    Device,
    /// Host-visible and coherent, persistently mapped.
    Shared,
    /// Host-visible, write-only from the host, used for staging.
    Upload,
}

impl Memory {
    pub fn is_host_visible(self) -> bool {
        match self {
            Self::Device => false,
            Self::Shared | Self::Upload => true,
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const STORAGE = 1 << 4;
        const UNIFORM = 1 << 5;
        const RAY_TRACING = 1 << 6;
    }
}

#[derive(Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Buffer {
    raw: u64,
    data: *mut u8,
}

// The mapped pointer is owned by the backend and stays valid until destruction.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            raw: 0,
            data: ptr::null_mut(),
        }
    }
}

impl Buffer {
    /// Wrap a backend buffer. `data` is null for memory that isn't mapped.
    pub fn from_raw(raw: u64, data: *mut u8) -> Self {
        Self { raw, data }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Persistently mapped pointer, or null for device-local memory.
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub fn at(self, offset: u64) -> BufferPiece {
        BufferPiece {
            buffer: self,
            offset,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BufferPiece {
    pub buffer: Buffer,
    pub offset: u64,
}

impl From<Buffer> for BufferPiece {
    fn from(buffer: Buffer) -> Self {
        Self { buffer, offset: 0 }
    }
}

impl BufferPiece {
    pub fn data(&self) -> *mut u8 {
        self.buffer.data().wrapping_add(self.offset as usize)
    }
}

/// A block of device memory handed out by the memory manager.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Allocation {
    pub raw: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum MemoryRequirementsKind {
    BuildScratch,
    UpdateScratch,
    Object,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct AccelerationStructure {
    raw: u64,
}

impl AccelerationStructure {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

/// Opaque 8-byte value that shaders use to refer to a bottom-level structure.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct AccelerationStructureReference(pub u64);

impl AccelerationStructureReference {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    TopLevel,
    BottomLevel,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
    pub struct AccelerationStructureFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    F32Vec3,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::F32Vec3 => 12,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Triangle geometry that a bottom-level structure is built over.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelerationStructureMesh {
    pub vertex_data: BufferPiece,
    pub vertex_format: VertexFormat,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub index_data: BufferPiece,
    pub index_type: IndexType,
    pub index_count: u32,
    pub is_opaque: bool,
}

impl AccelerationStructureMesh {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureDesc<'a> {
    pub name: &'a str,
    pub ty: AccelerationStructureType,
    pub flags: AccelerationStructureFlags,
    /// Maximum number of instances, only for top-level structures.
    pub instance_count: u32,
    /// Geometry, only for bottom-level structures.
    pub meshes: &'a [AccelerationStructureMesh],
}

/// Row-major 3x4 affine transform.
pub type Transform = mint::RowMatrix3x4<f32>;

pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
];

/// GPU layout of a single top-level instance.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct AccelerationStructureInstance {
    pub transform: [f32; 12],
    /// Lower 24 bits are the custom index, upper 8 bits are the mask.
    pub custom_index_and_mask: u32,
    /// Lower 24 bits are the binding table offset, upper 8 bits are flags.
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelerationStructureInstance {
    pub fn new(
        transform: Transform,
        custom_index: u32,
        mask: u8,
        reference: AccelerationStructureReference,
    ) -> Self {
        debug_assert!(custom_index < 1 << 24, "Custom index {custom_index} overflows");
        Self {
            transform: transform.into(),
            custom_index_and_mask: (custom_index & 0xFF_FFFF) | ((mask as u32) << 24),
            sbt_offset_and_flags: 0,
            acceleration_structure_reference: reference.0,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn transform(&self) -> Transform {
        self.transform.into()
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform.into();
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Sampler {
    raw: u64,
}

impl Sampler {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct TextureView {
    raw: u64,
}

impl TextureView {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct DescriptorSet {
    raw: u64,
}

impl DescriptorSet {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub piece: BufferPiece,
    /// `None` binds the whole buffer past the offset.
    pub size: Option<u64>,
}

impl From<Buffer> for BufferBinding {
    fn from(buffer: Buffer) -> Self {
        Self {
            piece: buffer.into(),
            size: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub sampler: Sampler,
    pub view: TextureView,
}

#[derive(Clone, Copy, Debug)]
pub enum DescriptorResources<'a> {
    AccelerationStructure(AccelerationStructure),
    StorageBuffers(&'a [BufferBinding]),
    UniformBuffer(BufferBinding),
    CombinedImageSamplers(&'a [TextureBinding]),
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite<'a> {
    pub set: DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub resources: DescriptorResources<'a>,
}

impl DescriptorWrite<'_> {
    pub fn count(&self) -> u32 {
        match self.resources {
            DescriptorResources::AccelerationStructure(_) | DescriptorResources::UniformBuffer(_) => 1,
            DescriptorResources::StorageBuffers(list) => list.len() as u32,
            DescriptorResources::CombinedImageSamplers(list) => list.len() as u32,
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
    pub struct Access: u32 {
        const HOST_WRITE = 1 << 0;
        const TRANSFER_READ = 1 << 1;
        const TRANSFER_WRITE = 1 << 2;
        const ACCELERATION_STRUCTURE_READ = 1 << 3;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 4;
        const SHADER_READ = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
    pub struct PipelineStages: u32 {
        const HOST = 1 << 0;
        const TRANSFER = 1 << 1;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 2;
        const RAY_TRACING_SHADER = 1 << 3;
    }
}

/// Execution and memory dependency between two groups of commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: Access,
    pub dst_access: Access,
    /// Restricts the dependency to a single buffer.
    pub buffer: Option<Buffer>,
}

impl Barrier {
    /// Acceleration structure reads and writes in the build stage
    /// must complete before the next build.
    pub fn acceleration_structure_build(buffer: Option<Buffer>) -> Self {
        let access = Access::ACCELERATION_STRUCTURE_READ | Access::ACCELERATION_STRUCTURE_WRITE;
        Self {
            src_stages: PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            dst_stages: PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            src_access: access,
            dst_access: access,
            buffer,
        }
    }

    /// Transfer writes must land before an acceleration structure build reads them.
    pub fn transfer_to_acceleration_structure_build() -> Self {
        Self {
            src_stages: PipelineStages::TRANSFER,
            dst_stages: PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            src_access: Access::TRANSFER_WRITE,
            dst_access: Access::ACCELERATION_STRUCTURE_READ | Access::ACCELERATION_STRUCTURE_WRITE,
            buffer: None,
        }
    }
}

#[derive(Debug)]
pub struct CommandEncoderDesc<'a> {
    pub name: &'a str,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPoint {
    pub index: u64,
}
