use std::sync::OnceLock;
use tessera_graphics::{self as gpu, MemoryManager as _};

use crate::{arena::Handle, BottomLevelAccelerationStructure, MeshMaterial, MeshRegistration};

/// How long a model is expected to stay in the scene.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Transient content, like effects and debris.
    #[default]
    Short,
    /// Level geometry and everything else that lives through the session.
    Long,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Texture {
    pub sampler: gpu::Sampler,
    pub view: gpu::TextureView,
}

impl From<Texture> for gpu::TextureBinding {
    fn from(texture: Texture) -> Self {
        Self {
            sampler: texture.sampler,
            view: texture.view,
        }
    }
}

pub struct MeshDesc<'a> {
    pub name: &'a str,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub texture: Texture,
    pub transparent: bool,
}

/// Triangle list with sequential indices, drawn with a single texture.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertex_buffer: gpu::Buffer,
    pub index_buffer: gpu::Buffer,
    pub index_type: gpu::IndexType,
    pub vertex_count: u32,
    pub texture: Texture,
    pub specular_exponent: f32,
    pub specular_intensity: f32,
    pub transparent: bool,
}

impl Mesh {
    /// Allocate device-local storage that a build task fills in later.
    pub fn allocate(
        device: &dyn gpu::Device,
        desc: MeshDesc,
        ray_tracing: bool,
    ) -> Result<Self, crate::Error> {
        let index_type = if desc.vertex_count <= u16::MAX as u32 + 1 {
            gpu::IndexType::U16
        } else {
            gpu::IndexType::U32
        };
        let mut usage = gpu::BufferUsage::TRANSFER_DST;
        if ray_tracing {
            usage |= gpu::BufferUsage::STORAGE | gpu::BufferUsage::RAY_TRACING;
        }
        let vertex_buffer = device.get_buffer(gpu::BufferDesc {
            name: &format!("{} vertices", desc.name),
            size: desc.vertex_count as u64 * desc.vertex_stride as u64,
            usage: usage | gpu::BufferUsage::VERTEX,
            memory: gpu::Memory::Device,
        })?;
        let index_buffer = match device.get_buffer(gpu::BufferDesc {
            name: &format!("{} indices", desc.name),
            size: desc.vertex_count as u64 * index_type.size(),
            usage: usage | gpu::BufferUsage::INDEX,
            memory: gpu::Memory::Device,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.release_buffer(vertex_buffer);
                return Err(e.into());
            }
        };
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_type,
            vertex_count: desc.vertex_count,
            texture: desc.texture,
            specular_exponent: 0.0,
            specular_intensity: 0.0,
            transparent: desc.transparent,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_data_size(&self) -> u64 {
        self.index_count() as u64 * self.index_type.size()
    }

    /// Geometry description over the given vertex storage.
    pub fn geometry(
        &self,
        vertex_buffer: gpu::Buffer,
        vertex_stride: u32,
    ) -> gpu::AccelerationStructureMesh {
        gpu::AccelerationStructureMesh {
            vertex_data: vertex_buffer.into(),
            vertex_format: gpu::VertexFormat::F32Vec3,
            vertex_stride,
            vertex_count: self.vertex_count,
            index_data: self.index_buffer.into(),
            index_type: self.index_type,
            index_count: self.index_count(),
            is_opaque: !self.transparent,
        }
    }

    pub fn registration(
        &self,
        vertex_buffer: gpu::Buffer,
        color_tint: [f32; 4],
        light_offset: u32,
    ) -> MeshRegistration {
        MeshRegistration {
            binding: crate::SlotBinding {
                vertex: vertex_buffer.into(),
                index: self.index_buffer.into(),
                texture: self.texture.into(),
            },
            material: MeshMaterial {
                specular_exponent: self.specular_exponent,
                specular_intensity: self.specular_intensity,
                color_tint,
                light_offset,
            },
        }
    }

    pub fn free(&self, device: &dyn gpu::Device) {
        device.release_buffer(self.vertex_buffer);
        device.release_buffer(self.index_buffer);
    }
}

pub struct Model {
    pub name: String,
    pub meshes: Vec<Mesh>,
    pub lifetime: Lifetime,
    /// Whether the model is drawn by itself, as opposed to only being a
    /// source for deformation or particles.
    pub rendered: bool,
    pub light_offset: u32,
    bottom_level: OnceLock<Handle<BottomLevelAccelerationStructure>>,
}

impl Model {
    pub fn new(name: &str, meshes: Vec<Mesh>, lifetime: Lifetime, rendered: bool) -> Self {
        Self {
            name: name.to_string(),
            meshes,
            lifetime,
            rendered,
            light_offset: 0,
            bottom_level: OnceLock::new(),
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.meshes.iter().map(|mesh| mesh.vertex_count).sum()
    }

    /// The structure built for this model, once its build task is done.
    pub fn bottom_level(&self) -> Option<Handle<BottomLevelAccelerationStructure>> {
        self.bottom_level.get().copied()
    }

    /// Attach the structure. Fails if one is attached already.
    pub(crate) fn set_bottom_level(
        &self,
        handle: Handle<BottomLevelAccelerationStructure>,
    ) -> Result<(), Handle<BottomLevelAccelerationStructure>> {
        self.bottom_level.set(handle)
    }

    pub fn registrations(&self, color_tint: [f32; 4]) -> Vec<MeshRegistration> {
        self.meshes
            .iter()
            .map(|mesh| mesh.registration(mesh.vertex_buffer, color_tint, self.light_offset))
            .collect()
    }
}
