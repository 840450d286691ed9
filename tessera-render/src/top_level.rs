use std::{mem, ops::Range, ptr, sync::Arc};
use tessera_graphics::{self as gpu, DescriptorDevice as _, MemoryManager as _};

use crate::{
    acceleration_structure::{InstanceData, Structure, StructureKind},
    entity::{DeformableEntity, Particle},
    Model, StructureHub,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopLevelState {
    /// Nothing is allocated yet.
    Empty,
    /// Backing exists, but nothing was built into it.
    Allocated,
    /// Instances changed since the last build.
    Dirty,
    Clean,
}

struct Backing {
    structure: Structure,
    instance_buffer: gpu::Buffer,
}

/// Scene structure of one frame image.
///
/// Instances are appended and never removed. The instance array and the
/// structure are both sized for the registry capacity on the first build,
/// so later growth never reallocates.
pub struct TopLevelAccelerationStructure {
    hub: Arc<StructureHub>,
    name: String,
    image_index: usize,
    capacity: u32,
    updateable: bool,
    instances: Vec<gpu::AccelerationStructureInstance>,
    dirty: bool,
    backing: Option<Backing>,
    built_instance_count: Option<u32>,
    slot_ranges: Vec<Range<u32>>,
}

impl TopLevelAccelerationStructure {
    pub fn new(hub: &Arc<StructureHub>, image_index: usize, updateable: bool) -> Self {
        let capacity = hub.registry().max_bindings();
        Self {
            hub: Arc::clone(hub),
            name: format!("scene{}", image_index),
            image_index,
            capacity,
            updateable,
            instances: Vec::with_capacity(capacity as usize),
            dirty: false,
            backing: None,
            built_instance_count: None,
            slot_ranges: Vec::new(),
        }
    }

    pub fn image_index(&self) -> usize {
        self.image_index
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn state(&self) -> TopLevelState {
        match self.backing {
            None => TopLevelState::Empty,
            Some(_) if self.dirty => TopLevelState::Dirty,
            Some(_) if self.built_instance_count.is_none() => TopLevelState::Allocated,
            Some(_) => TopLevelState::Clean,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn instance(&self, id: u32) -> Option<&gpu::AccelerationStructureInstance> {
        self.instances.get(id as usize)
    }

    /// Slot ranges registered through this structure, in order.
    pub fn slot_ranges(&self) -> &[Range<u32>] {
        &self.slot_ranges
    }

    pub fn structure(&self) -> Option<&Structure> {
        self.backing.as_ref().map(|b| &b.structure)
    }

    pub fn instance_buffer(&self) -> Option<gpu::Buffer> {
        self.backing.as_ref().map(|b| b.instance_buffer)
    }

    /// Append an instance, returning its stable id.
    pub fn add_instance(
        &mut self,
        instance: gpu::AccelerationStructureInstance,
    ) -> Result<u32, crate::Error> {
        if self.instances.len() as u32 >= self.capacity {
            return Err(crate::Error::InstanceCapacity {
                capacity: self.capacity,
            });
        }
        let id = self.instances.len() as u32;
        self.instances.push(instance);
        self.dirty = true;
        Ok(id)
    }

    /// Change the transform of an instance.
    ///
    /// Does nothing until the structure has been built for the first time.
    pub fn update_instance(&mut self, id: u32, transform: gpu::Transform) {
        if self.backing.is_none() {
            return;
        }
        match self.instances.get_mut(id as usize) {
            Some(instance) => {
                instance.set_transform(transform);
                self.dirty = true;
            }
            None => log::warn!("Instance {} is not in '{}'", id, self.name),
        }
    }

    /// Overwrite the transform of an instance in a structure that has
    /// never been built, so its first build starts from the latest state.
    pub(crate) fn set_initial_transform(&mut self, id: u32, transform: gpu::Transform) {
        if self.backing.is_some() {
            return;
        }
        if let Some(instance) = self.instances.get_mut(id as usize) {
            instance.set_transform(transform);
        }
    }

    fn allocate(&self) -> Result<Backing, crate::Error> {
        let device = self.hub.device().as_ref();
        let instance_buffer = device.get_buffer(gpu::BufferDesc {
            name: &format!("{} instances", self.name),
            size: (mem::size_of::<gpu::AccelerationStructureInstance>() * self.capacity as usize)
                as u64,
            usage: gpu::BufferUsage::RAY_TRACING,
            memory: gpu::Memory::Shared,
        })?;
        let configured = Structure::configure(
            device,
            &self.name,
            StructureKind::TopLevel {
                instance_count: self.capacity,
            },
            gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
            self.updateable,
        )
        .and_then(|unbound| unbound.allocate_backing(device));
        match configured {
            Ok(structure) => Ok(Backing {
                structure,
                instance_buffer,
            }),
            Err(e) => {
                device.release_buffer(instance_buffer);
                Err(e)
            }
        }
    }

    /// Point the descriptor set of this image at the new structure.
    fn wire_bindings(&self, backing: &Backing) {
        let registry = self.hub.registry();
        {
            let mut lock = registry.lock();
            for range in crate::binding::coalesce(&self.slot_ranges) {
                lock.write_descriptors(self.image_index, range);
            }
        }
        let set = registry.descriptor_set(self.image_index);
        self.hub.device().update_descriptor_sets(&[
            gpu::DescriptorWrite {
                set,
                binding: crate::bindings::ACCELERATION_STRUCTURE,
                array_element: 0,
                resources: gpu::DescriptorResources::AccelerationStructure(
                    backing.structure.raw(),
                ),
            },
            gpu::DescriptorWrite {
                set,
                binding: crate::bindings::MESH_INFO,
                array_element: 0,
                resources: gpu::DescriptorResources::UniformBuffer(
                    registry.mesh_info_binding(self.image_index),
                ),
            },
        ]);
    }

    /// Record a build if anything changed since the last one.
    ///
    /// The first build allocates everything and builds from scratch, and so
    /// does any build after the instance count changed. Otherwise the
    /// structure is refit in place when it's updateable.
    /// Returns `false` if there was nothing to do.
    #[profiling::function]
    pub fn build(&mut self, encoder: &mut gpu::CommandEncoder) -> Result<bool, crate::Error> {
        if !self.dirty {
            return Ok(false);
        }
        let count = self.instances.len() as u32;
        let (backing, update) = match self.backing.take() {
            Some(backing) => {
                let update = self.updateable && self.built_instance_count == Some(count);
                (backing, update)
            }
            None => {
                let backing = self.allocate()?;
                self.wire_bindings(&backing);
                (backing, false)
            }
        };

        let bytes = bytemuck::cast_slice::<_, u8>(&self.instances);
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                backing.instance_buffer.data(),
                bytes.len(),
            );
        }
        self.hub.registry().flush_mesh_info(self.image_index);
        encoder.barrier(gpu::Barrier::acceleration_structure_build(None));
        let result = backing.structure.build(
            encoder,
            Some(InstanceData {
                piece: backing.instance_buffer.into(),
                count,
            }),
            update,
        );
        self.backing = Some(backing);
        result?;

        log::trace!(
            "{} '{}' with {} instances",
            if update { "Updated" } else { "Built" },
            self.name,
            count
        );
        self.built_instance_count = Some(count);
        self.dirty = false;
        Ok(true)
    }

    fn register(&mut self, meshes: &[crate::MeshRegistration]) -> Result<u32, crate::Error> {
        let range = self.hub.registry().lock().register_meshes(meshes)?;
        let base = range.start;
        self.slot_ranges.push(range);
        Ok(base)
    }

    /// Give the meshes of a static model binding slots. Returns the base slot,
    /// which is also stored on the model's bottom-level structure.
    pub fn add_model_resource(&mut self, model: &Model) -> Result<u32, crate::Error> {
        let blas = self.hub.model_bottom_level(model)?;
        let base = self.register(&model.registrations(crate::WHITE))?;
        blas.set_resource_index(base);
        Ok(base)
    }

    /// Register the transformed geometry of an entity, one slot range per
    /// model and frame image.
    pub fn add_deformable_resource(
        &mut self,
        entity: &DeformableEntity,
    ) -> Result<(), crate::Error> {
        for deformed in entity.models.iter() {
            for image_index in 0..self.hub.image_count() {
                let meshes = deformed.registrations(image_index);
                let base = self.register(&meshes)?;
                match deformed
                    .bottom_levels
                    .get(image_index)
                    .and_then(|&handle| self.hub.bottom_level(handle))
                {
                    Some(blas) => blas.set_resource_index(base),
                    None => {
                        return Err(crate::Error::MissingBottomLevel {
                            model: deformed.model.name.clone(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Register a particle model with the particle color as tint.
    pub fn add_particle_resource(&mut self, particle: &Particle) -> Result<u32, crate::Error> {
        let base = self.register(&particle.model.registrations(particle.color))?;
        particle.set_resource_index(base);
        Ok(base)
    }

    pub fn destroy(&mut self) {
        if let Some(backing) = self.backing.take() {
            let device = self.hub.device().as_ref();
            device.release_buffer(backing.instance_buffer);
            backing.structure.destroy(device);
        }
        self.built_instance_count = None;
    }
}
