//! Lifecycle shared by bottom- and top-level acceleration structures.
//!
//! A structure is first configured, which creates the device object
//! without memory. Allocating the backing binds object memory, creates a
//! scratch buffer big enough for both builds and updates, and resolves the
//! device reference. Only then can it be built, copied, or referenced.

use std::fmt;
use strum::IntoEnumIterator as _;
use tessera_graphics::{self as gpu, AccelerationStructureDevice as _, MemoryManager as _};

pub enum StructureKind {
    BottomLevel {
        meshes: Vec<gpu::AccelerationStructureMesh>,
    },
    TopLevel {
        /// Maximum number of instances that a build can consume.
        instance_count: u32,
    },
}

impl StructureKind {
    pub fn ty(&self) -> gpu::AccelerationStructureType {
        match *self {
            Self::BottomLevel { .. } => gpu::AccelerationStructureType::BottomLevel,
            Self::TopLevel { .. } => gpu::AccelerationStructureType::TopLevel,
        }
    }
}

/// Instance array consumed by a top-level build.
#[derive(Clone, Copy, Debug)]
pub struct InstanceData {
    pub piece: gpu::BufferPiece,
    pub count: u32,
}

/// A configured structure that has no memory yet.
pub struct UnboundStructure {
    name: String,
    kind: StructureKind,
    flags: gpu::AccelerationStructureFlags,
    raw: gpu::AccelerationStructure,
}

impl UnboundStructure {
    pub fn flags(&self) -> gpu::AccelerationStructureFlags {
        self.flags
    }

    #[profiling::function]
    pub fn allocate_backing(self, device: &dyn gpu::Device) -> Result<Structure, crate::Error> {
        let mut object = gpu::MemoryRequirements::default();
        let mut build_scratch = 0;
        let mut update_scratch = 0;
        for kind in gpu::MemoryRequirementsKind::iter() {
            let requirements = device.get_acceleration_structure_memory_requirements(self.raw, kind);
            match kind {
                gpu::MemoryRequirementsKind::Object => object = requirements,
                gpu::MemoryRequirementsKind::BuildScratch => build_scratch = requirements.size,
                gpu::MemoryRequirementsKind::UpdateScratch => update_scratch = requirements.size,
            }
        }
        let scratch_size = build_scratch.max(update_scratch);

        let memory = match device.get_memory(&self.name, object, gpu::Memory::Device) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_acceleration_structure(self.raw);
                return Err(e.into());
            }
        };
        if let Err(e) = device.bind_acceleration_structure_memory(self.raw, &memory) {
            device.release_memory(memory);
            device.destroy_acceleration_structure(self.raw);
            return Err(e.into());
        }
        let scratch = match device.get_buffer(gpu::BufferDesc {
            name: &format!("{} scratch", self.name),
            size: scratch_size,
            usage: gpu::BufferUsage::RAY_TRACING | gpu::BufferUsage::STORAGE,
            memory: gpu::Memory::Device,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.destroy_acceleration_structure(self.raw);
                device.release_memory(memory);
                return Err(e.into());
            }
        };
        let reference = device.get_acceleration_structure_reference(self.raw);
        log::debug!(
            "Structure '{}' backed by {} bytes, scratch {} bytes",
            self.name,
            object.size,
            scratch_size
        );

        Ok(Structure {
            name: self.name,
            kind: self.kind,
            flags: self.flags,
            raw: self.raw,
            memory,
            scratch,
            scratch_size,
            reference,
        })
    }

    /// Drop the device object of a structure that never got memory.
    pub fn destroy(self, device: &dyn gpu::Device) {
        device.destroy_acceleration_structure(self.raw);
    }
}

/// A structure with bound memory and scratch space.
pub struct Structure {
    name: String,
    kind: StructureKind,
    flags: gpu::AccelerationStructureFlags,
    raw: gpu::AccelerationStructure,
    memory: gpu::Allocation,
    scratch: gpu::Buffer,
    scratch_size: u64,
    reference: gpu::AccelerationStructureReference,
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Structure")
            .field("name", &self.name)
            .field("ty", &self.kind.ty())
            .field("flags", &self.flags)
            .field("reference", &self.reference)
            .finish()
    }
}

impl Structure {
    /// Create the device object. Asking for `updateable` adds the update flag.
    pub fn configure(
        device: &dyn gpu::Device,
        name: &str,
        kind: StructureKind,
        mut flags: gpu::AccelerationStructureFlags,
        updateable: bool,
    ) -> Result<UnboundStructure, crate::Error> {
        match kind {
            StructureKind::BottomLevel { ref meshes } if meshes.is_empty() => {
                return Err(crate::Error::InvalidConfiguration(
                    "bottom-level structure without geometry",
                ));
            }
            StructureKind::TopLevel { instance_count: 0 } => {
                return Err(crate::Error::InvalidConfiguration(
                    "top-level structure without instance capacity",
                ));
            }
            _ => {}
        }
        if updateable {
            flags |= gpu::AccelerationStructureFlags::ALLOW_UPDATE;
        }
        let raw = device.create_acceleration_structure(&gpu::AccelerationStructureDesc {
            name,
            ty: kind.ty(),
            flags,
            instance_count: match kind {
                StructureKind::BottomLevel { .. } => 0,
                StructureKind::TopLevel { instance_count } => instance_count,
            },
            meshes: match kind {
                StructureKind::BottomLevel { ref meshes } => meshes.as_slice(),
                StructureKind::TopLevel { .. } => &[],
            },
        })?;
        Ok(UnboundStructure {
            name: name.to_string(),
            kind,
            flags,
            raw,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> gpu::AccelerationStructure {
        self.raw
    }

    pub fn ty(&self) -> gpu::AccelerationStructureType {
        self.kind.ty()
    }

    pub fn flags(&self) -> gpu::AccelerationStructureFlags {
        self.flags
    }

    pub fn is_updateable(&self) -> bool {
        self.flags
            .contains(gpu::AccelerationStructureFlags::ALLOW_UPDATE)
    }

    pub fn scratch_size(&self) -> u64 {
        self.scratch_size
    }

    /// Value to put into instances that point at this structure.
    pub fn reference(&self) -> gpu::AccelerationStructureReference {
        self.reference
    }

    /// Record a build, or an in-place update when `update` is set.
    ///
    /// The preceding barrier makes sure the previous use of the shared
    /// scratch buffer has finished.
    pub fn build(
        &self,
        encoder: &mut gpu::CommandEncoder,
        instances: Option<InstanceData>,
        update: bool,
    ) -> Result<(), crate::Error> {
        if update && !self.is_updateable() {
            return Err(crate::Error::InvalidConfiguration(
                "update of a structure created without the update flag",
            ));
        }
        let mode = if update {
            gpu::BuildMode::Update
        } else {
            gpu::BuildMode::Build
        };
        match (&self.kind, instances) {
            (&StructureKind::BottomLevel { ref meshes }, _) => {
                encoder.barrier(gpu::Barrier::acceleration_structure_build(Some(
                    self.scratch,
                )));
                encoder.acceleration_structure().build_bottom_level(
                    self.raw,
                    self.flags,
                    meshes,
                    mode,
                    self.scratch.into(),
                );
            }
            (&StructureKind::TopLevel { instance_count }, Some(data)) => {
                if data.count > instance_count {
                    return Err(crate::Error::InstanceCapacity {
                        capacity: instance_count,
                    });
                }
                encoder.barrier(gpu::Barrier::acceleration_structure_build(Some(
                    self.scratch,
                )));
                encoder.acceleration_structure().build_top_level(
                    self.raw,
                    self.flags,
                    data.count,
                    data.piece,
                    mode,
                    self.scratch.into(),
                );
            }
            (&StructureKind::TopLevel { .. }, None) => {
                return Err(crate::Error::InvalidConfiguration(
                    "top-level build without instance data",
                ));
            }
        }
        Ok(())
    }

    /// Record a plain copy of this structure into `target`.
    pub fn copy(&self, encoder: &mut gpu::CommandEncoder, target: &Structure) {
        encoder.acceleration_structure().copy(
            self.raw,
            target.raw,
            gpu::AccelerationStructureCopyMode::Clone,
        );
    }

    pub fn destroy(self, device: &dyn gpu::Device) {
        log::debug!("Destroying structure '{}'", self.name);
        device.destroy_acceleration_structure(self.raw);
        device.release_memory(self.memory);
        device.release_buffer(self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::{Structure, StructureKind};
    use tessera_graphics as gpu;

    fn triangle(context: &gpu::capture::Context) -> gpu::AccelerationStructureMesh {
        use gpu::MemoryManager as _;
        let vertices = context
            .get_buffer(gpu::BufferDesc {
                name: "vertices",
                size: 36,
                usage: gpu::BufferUsage::RAY_TRACING,
                memory: gpu::Memory::Device,
            })
            .unwrap();
        let indices = context
            .get_buffer(gpu::BufferDesc {
                name: "indices",
                size: 6,
                usage: gpu::BufferUsage::RAY_TRACING,
                memory: gpu::Memory::Device,
            })
            .unwrap();
        gpu::AccelerationStructureMesh {
            vertex_data: vertices.into(),
            vertex_format: gpu::VertexFormat::F32Vec3,
            vertex_stride: 12,
            vertex_count: 3,
            index_data: indices.into(),
            index_type: gpu::IndexType::U16,
            index_count: 3,
            is_opaque: true,
        }
    }

    #[test]
    fn scratch_covers_build_and_update() {
        use gpu::AccelerationStructureDevice as _;
        let context = gpu::capture::Context::new();
        let mesh = triangle(&context);
        let structure = Structure::configure(
            &context,
            "test",
            StructureKind::BottomLevel { meshes: vec![mesh] },
            gpu::AccelerationStructureFlags::PREFER_FAST_BUILD,
            true,
        )
        .unwrap()
        .allocate_backing(&context)
        .unwrap();
        let build = context.get_acceleration_structure_memory_requirements(
            structure.raw(),
            gpu::MemoryRequirementsKind::BuildScratch,
        );
        let update = context.get_acceleration_structure_memory_requirements(
            structure.raw(),
            gpu::MemoryRequirementsKind::UpdateScratch,
        );
        assert_eq!(structure.scratch_size(), build.size.max(update.size));
        assert!(structure.is_updateable());
        assert_eq!(
            context.structure(structure.raw()).unwrap().reference,
            structure.reference()
        );
        structure.destroy(&context);
        // only the geometry buffers are left
        assert_eq!(context.allocated_bytes(), 36 + 6);
    }

    #[test]
    fn empty_configurations_are_rejected() {
        let context = gpu::capture::Context::new();
        let bottom = Structure::configure(
            &context,
            "empty",
            StructureKind::BottomLevel { meshes: Vec::new() },
            gpu::AccelerationStructureFlags::empty(),
            false,
        );
        assert!(matches!(bottom, Err(crate::Error::InvalidConfiguration(_))));
        let top = Structure::configure(
            &context,
            "empty",
            StructureKind::TopLevel { instance_count: 0 },
            gpu::AccelerationStructureFlags::empty(),
            false,
        );
        assert!(matches!(top, Err(crate::Error::InvalidConfiguration(_))));
        assert_eq!(context.structure_count(), 0);
    }

    #[test]
    fn update_needs_the_flag() {
        let context = gpu::capture::Context::new();
        let mesh = triangle(&context);
        let structure = Structure::configure(
            &context,
            "static",
            StructureKind::BottomLevel { meshes: vec![mesh] },
            gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
            false,
        )
        .unwrap()
        .allocate_backing(&context)
        .unwrap();
        let mut encoder = gpu::CommandEncoder::new(gpu::CommandEncoderDesc { name: "test" });
        encoder.start();
        assert!(structure.build(&mut encoder, None, true).is_err());
        assert!(encoder.is_empty());
        structure.build(&mut encoder, None, false).unwrap();
        assert_eq!(encoder.commands().len(), 2);
    }
}
