use parking_lot::{Mutex, MutexGuard};
use std::{mem, ops::Range, ptr, slice, sync::Arc};
use tessera_graphics::{self as gpu, DescriptorDevice as _, MemoryManager as _};

/// Resources that occupy one slot of the bindless arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotBinding {
    pub vertex: gpu::BufferBinding,
    pub index: gpu::BufferBinding,
    pub texture: gpu::TextureBinding,
}

/// Shading parameters that end up in `MeshInfo` next to the slot indices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshMaterial {
    pub specular_exponent: f32,
    pub specular_intensity: f32,
    pub color_tint: [f32; 4],
    pub light_offset: u32,
}

impl MeshMaterial {
    pub fn to_mesh_info(&self, slot: u32) -> crate::MeshInfo {
        crate::MeshInfo {
            vertex_slot: slot,
            index_slot: slot,
            specular_exponent: self.specular_exponent,
            specular_intensity: self.specular_intensity,
            color_tint: self.color_tint,
            light_offset: self.light_offset,
            pad: [0; 3],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MeshRegistration {
    pub binding: SlotBinding,
    pub material: MeshMaterial,
}

pub struct BindingRegistryDesc {
    /// Slot capacity, shared by every array and by the top-level instance count.
    pub max_bindings: u32,
    /// One ray-tracing set per frame image.
    pub descriptor_sets: Vec<gpu::DescriptorSet>,
    /// Host-visible buffer holding `max_bindings` mesh records per image.
    pub mesh_info_buffer: gpu::Buffer,
}

#[derive(Default)]
struct SlotTable {
    next_slot: u32,
    vertex: Vec<gpu::BufferBinding>,
    index: Vec<gpu::BufferBinding>,
    textures: Vec<gpu::TextureBinding>,
}

/// Process-wide allocator of bindless slots.
///
/// Slots are handed out from a single monotonically increasing counter
/// and never reused. Metadata and descriptor writes for a slot range are
/// done together with the allocation, under the same lock, so worker
/// threads and the main thread can register meshes concurrently.
pub struct BindingRegistry {
    device: Arc<dyn gpu::Device>,
    max_bindings: u32,
    descriptor_sets: Vec<gpu::DescriptorSet>,
    mesh_info_buffer: gpu::Buffer,
    table: Mutex<SlotTable>,
}

impl BindingRegistry {
    pub fn new(device: &Arc<dyn gpu::Device>, desc: BindingRegistryDesc) -> Self {
        assert!(
            !desc.mesh_info_buffer.data().is_null(),
            "Mesh info buffer has to be mapped"
        );
        assert!(!desc.descriptor_sets.is_empty());
        Self {
            device: Arc::clone(device),
            max_bindings: desc.max_bindings,
            descriptor_sets: desc.descriptor_sets,
            mesh_info_buffer: desc.mesh_info_buffer,
            table: Mutex::new(SlotTable::default()),
        }
    }

    /// Size of the mesh info buffer needed for the given configuration.
    pub fn mesh_info_buffer_size(max_bindings: u32, image_count: usize) -> u64 {
        (mem::size_of::<crate::MeshInfo>() * max_bindings as usize * image_count) as u64
    }

    pub fn image_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn max_bindings(&self) -> u32 {
        self.max_bindings
    }

    pub fn descriptor_set(&self, image_index: usize) -> gpu::DescriptorSet {
        self.descriptor_sets[image_index]
    }

    /// Part of the mesh info buffer that belongs to one frame image.
    pub fn mesh_info_binding(&self, image_index: usize) -> gpu::BufferBinding {
        let size = (mem::size_of::<crate::MeshInfo>() * self.max_bindings as usize) as u64;
        gpu::BufferBinding {
            piece: self.mesh_info_buffer.at(size * image_index as u64),
            size: Some(size),
        }
    }

    /// Make the host-written mesh records of an image visible to the device.
    pub fn flush_mesh_info(&self, image_index: usize) {
        let binding = self.mesh_info_binding(image_index);
        self.device
            .flush_buffer(binding.piece, binding.size.unwrap_or_default());
    }

    /// Number of slots handed out so far.
    pub fn slot_count(&self) -> u32 {
        self.table.lock().next_slot
    }

    pub fn slot(&self, slot: u32) -> Option<SlotBinding> {
        let table = self.table.lock();
        let i = slot as usize;
        Some(SlotBinding {
            vertex: *table.vertex.get(i)?,
            index: *table.index.get(i)?,
            texture: *table.textures.get(i)?,
        })
    }

    pub fn read_mesh_info(&self, image_index: usize, slot: u32) -> crate::MeshInfo {
        let _table = self.table.lock();
        let offset = self.mesh_info_offset(image_index, slot);
        let bytes = unsafe {
            slice::from_raw_parts(
                self.mesh_info_buffer.data().add(offset),
                mem::size_of::<crate::MeshInfo>(),
            )
        };
        bytemuck::pod_read_unaligned(bytes)
    }

    fn mesh_info_offset(&self, image_index: usize, slot: u32) -> usize {
        assert!(image_index < self.image_count());
        assert!(slot < self.max_bindings, "Slot {slot} is out of range");
        (image_index * self.max_bindings as usize + slot as usize) * mem::size_of::<crate::MeshInfo>()
    }

    pub fn lock(&self) -> BindingLock<'_> {
        BindingLock {
            registry: self,
            table: self.table.lock(),
        }
    }
}

/// Exclusive access to the slot counter, the metadata arrays, and the
/// descriptor arrays of every frame image.
pub struct BindingLock<'a> {
    registry: &'a BindingRegistry,
    table: MutexGuard<'a, SlotTable>,
}

impl BindingLock<'_> {
    pub fn next_slot(&self) -> u32 {
        self.table.next_slot
    }

    /// Reserve consecutive slots for the given bindings.
    pub fn allocate(&mut self, bindings: &[SlotBinding]) -> Result<Range<u32>, crate::Error> {
        let available = self.registry.max_bindings - self.table.next_slot;
        if bindings.len() > available as usize {
            log::error!(
                "Unable to register {} slots, only {} left",
                bindings.len(),
                available
            );
            return Err(crate::Error::BindingsExhausted {
                requested: bindings.len() as u32,
                available,
            });
        }
        let start = self.table.next_slot;
        for binding in bindings {
            self.table.vertex.push(binding.vertex);
            self.table.index.push(binding.index);
            self.table.textures.push(binding.texture);
        }
        self.table.next_slot += bindings.len() as u32;
        Ok(start..self.table.next_slot)
    }

    pub fn write_mesh_info(&mut self, image_index: usize, slot: u32, info: &crate::MeshInfo) {
        let offset = self.registry.mesh_info_offset(image_index, slot);
        let bytes = bytemuck::bytes_of(info);
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.registry.mesh_info_buffer.data().add(offset),
                bytes.len(),
            );
        }
    }

    /// Write the vertex, index, and texture arrays of a slot range into
    /// the set of one image.
    pub fn write_descriptors(&mut self, image_index: usize, slots: Range<u32>) {
        if slots.is_empty() {
            return;
        }
        let set = self.registry.descriptor_set(image_index);
        let range = slots.start as usize..slots.end as usize;
        let writes = [
            gpu::DescriptorWrite {
                set,
                binding: crate::bindings::VERTEX_BUFFERS,
                array_element: slots.start,
                resources: gpu::DescriptorResources::StorageBuffers(&self.table.vertex[range.clone()]),
            },
            gpu::DescriptorWrite {
                set,
                binding: crate::bindings::INDEX_BUFFERS,
                array_element: slots.start,
                resources: gpu::DescriptorResources::StorageBuffers(&self.table.index[range.clone()]),
            },
            gpu::DescriptorWrite {
                set,
                binding: crate::bindings::TEXTURES,
                array_element: slots.start,
                resources: gpu::DescriptorResources::CombinedImageSamplers(
                    &self.table.textures[range],
                ),
            },
        ];
        self.registry.device.update_descriptor_sets(&writes);
    }

    /// Allocate slots for the meshes, then fill their metadata and
    /// descriptor arrays in every frame image.
    pub fn register_meshes(
        &mut self,
        meshes: &[MeshRegistration],
    ) -> Result<Range<u32>, crate::Error> {
        let bindings = meshes.iter().map(|m| m.binding).collect::<Vec<_>>();
        let range = self.allocate(&bindings)?;
        for image_index in 0..self.registry.image_count() {
            for (slot, mesh) in range.clone().zip(meshes) {
                self.write_mesh_info(image_index, slot, &mesh.material.to_mesh_info(slot));
            }
            self.write_descriptors(image_index, range.clone());
        }
        log::debug!("Registered slots {:?}", range);
        Ok(range)
    }
}

/// Merge adjacent ranges, keeping the order.
pub(crate) fn coalesce(ranges: &[Range<u32>]) -> Vec<Range<u32>> {
    let mut result: Vec<Range<u32>> = Vec::with_capacity(ranges.len());
    for range in ranges.iter().filter(|r| !r.is_empty()) {
        if let Some(last) = result.last_mut() {
            if last.end == range.start {
                last.end = range.end;
                continue;
            }
        }
        result.push(range.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tessera_graphics as gpu;

    fn registry(
        context: &Arc<gpu::capture::Context>,
        max_bindings: u32,
        image_count: usize,
    ) -> super::BindingRegistry {
        use gpu::{DescriptorDevice as _, MemoryManager as _};
        let mesh_info_buffer = context
            .get_buffer(gpu::BufferDesc {
                name: "mesh info",
                size: super::BindingRegistry::mesh_info_buffer_size(max_bindings, image_count),
                usage: gpu::BufferUsage::UNIFORM,
                memory: gpu::Memory::Shared,
            })
            .unwrap();
        let descriptor_sets = (0..image_count)
            .map(|i| context.create_descriptor_set(&format!("set{i}")).unwrap())
            .collect();
        let device: Arc<dyn gpu::Device> = context.clone();
        super::BindingRegistry::new(
            &device,
            super::BindingRegistryDesc {
                max_bindings,
                descriptor_sets,
                mesh_info_buffer,
            },
        )
    }

    fn registration(raw: u64) -> super::MeshRegistration {
        let buffer = gpu::Buffer::from_raw(raw, std::ptr::null_mut());
        super::MeshRegistration {
            binding: super::SlotBinding {
                vertex: buffer.into(),
                index: buffer.into(),
                texture: gpu::TextureBinding {
                    sampler: gpu::Sampler::from_raw(raw),
                    view: gpu::TextureView::from_raw(raw),
                },
            },
            material: super::MeshMaterial {
                specular_exponent: 8.0,
                specular_intensity: 0.5,
                color_tint: crate::WHITE,
                light_offset: 0,
            },
        }
    }

    #[test]
    fn consecutive_ranges() {
        let context = Arc::new(gpu::capture::Context::new());
        let registry = registry(&context, 16, 2);
        let a = registry
            .lock()
            .register_meshes(&[registration(100), registration(101)])
            .unwrap();
        let b = registry
            .lock()
            .register_meshes(&[registration(102), registration(103), registration(104)])
            .unwrap();
        assert_eq!(a, 0..2);
        assert_eq!(b, 2..5);
        assert_eq!(registry.slot_count(), 5);
        for image_index in 0..2 {
            let set = registry.descriptor_set(image_index);
            assert_eq!(context.descriptor_count(set, crate::bindings::VERTEX_BUFFERS), 5);
            let info = registry.read_mesh_info(image_index, 3);
            assert_eq!(info.vertex_slot, 3);
            assert_eq!(info.index_slot, 3);
            assert_eq!(info.specular_exponent, 8.0);
        }
    }

    #[test]
    fn exhausted() {
        let context = Arc::new(gpu::capture::Context::new());
        let registry = registry(&context, 2, 1);
        let result = registry
            .lock()
            .register_meshes(&[registration(1), registration(2), registration(3)]);
        assert!(matches!(
            result,
            Err(crate::Error::BindingsExhausted {
                requested: 3,
                available: 2
            })
        ));
        assert_eq!(registry.slot_count(), 0);
    }

    #[test]
    fn concurrent_registrations_never_overlap() {
        let context = Arc::new(gpu::capture::Context::new());
        let registry = registry(&context, 1000, 2);
        let mut ranges = std::thread::scope(|scope| {
            let workers = (0..8)
                .map(|t| {
                    let registry = &registry;
                    scope.spawn(move || {
                        (0..10)
                            .map(|i| {
                                let count = 1 + (t + i) % 3;
                                let meshes = (0..count)
                                    .map(|m| registration((t * 100 + i * 10 + m) as u64))
                                    .collect::<Vec<_>>();
                                registry.lock().register_meshes(&meshes).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        });
        ranges.sort_by_key(|r| r.start);
        let mut expected_start = 0;
        for range in ranges {
            assert_eq!(range.start, expected_start);
            expected_start = range.end;
        }
        assert_eq!(registry.slot_count(), expected_start);
    }

    #[test]
    fn coalesce_adjacent() {
        let merged = super::coalesce(&[0..2, 2..5, 5..5, 7..8, 8..9]);
        assert_eq!(merged, vec![0..5, 7..9]);
    }
}
