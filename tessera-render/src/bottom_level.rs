use std::sync::atomic::{AtomicU32, Ordering};
use tessera_graphics as gpu;

use crate::acceleration_structure::{Structure, StructureKind};

const NO_RESOURCE: u32 = u32::MAX;

/// What a bottom-level structure is tuned for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Performance {
    /// Rebuilt or updated often, like skinned geometry.
    FastBuild,
    /// Built once and traced many times.
    #[default]
    FastTrace,
}

/// Geometry structure of a single model or deformed copy of it.
///
/// The device reference is fixed at creation and survives updates,
/// so instances that point at it never need patching.
pub struct BottomLevelAccelerationStructure {
    structure: Structure,
    resource_index: AtomicU32,
}

impl BottomLevelAccelerationStructure {
    /// Configure, back, and record the initial build into `encoder`.
    #[profiling::function]
    pub fn new(
        device: &dyn gpu::Device,
        encoder: &mut gpu::CommandEncoder,
        name: &str,
        meshes: Vec<gpu::AccelerationStructureMesh>,
        updateable: bool,
        compact: bool,
        performance: Performance,
    ) -> Result<Self, crate::Error> {
        let mut flags = match performance {
            Performance::FastBuild => gpu::AccelerationStructureFlags::PREFER_FAST_BUILD,
            Performance::FastTrace => gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
        };
        if compact {
            flags |= gpu::AccelerationStructureFlags::ALLOW_COMPACTION;
        }
        let primitive_count = meshes.iter().map(|m| m.triangle_count()).sum::<u32>();
        let structure = Structure::configure(
            device,
            name,
            StructureKind::BottomLevel { meshes },
            flags,
            updateable,
        )?
        .allocate_backing(device)?;
        structure.build(encoder, None, false)?;
        log::info!(
            "Bottom-level '{}' with {} triangles, {:?}",
            name,
            primitive_count,
            structure.flags()
        );
        Ok(Self {
            structure,
            resource_index: AtomicU32::new(NO_RESOURCE),
        })
    }

    /// Refit in place over the current contents of the vertex buffers.
    pub fn update(&self, encoder: &mut gpu::CommandEncoder) -> Result<(), crate::Error> {
        self.structure.build(encoder, None, true)
    }

    pub fn reference(&self) -> gpu::AccelerationStructureReference {
        self.structure.reference()
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    /// First binding slot of the geometry, once it's registered.
    pub fn resource_index(&self) -> Option<u32> {
        match self.resource_index.load(Ordering::Acquire) {
            NO_RESOURCE => None,
            index => Some(index),
        }
    }

    pub fn set_resource_index(&self, index: u32) {
        debug_assert_ne!(index, NO_RESOURCE);
        self.resource_index.store(index, Ordering::Release);
    }

    pub fn destroy(self, device: &dyn gpu::Device) {
        self.structure.destroy(device);
    }
}
