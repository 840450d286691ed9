use std::ptr;

impl crate::traits::MemoryManager for super::Context {
    fn get_buffer(&self, desc: crate::BufferDesc) -> Result<crate::Buffer, crate::DeviceError> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, desc.name, desc.size, desc.memory)?;
        let raw = self.next_raw();
        let mut storage = vec![0u8; desc.size as usize].into_boxed_slice();
        // Moving the box into the map keeps the heap block in place.
        let data = if desc.memory.is_host_visible() {
            storage.as_mut_ptr()
        } else {
            ptr::null_mut()
        };
        log::trace!("Buffer '{}' of {} bytes -> {}", desc.name, desc.size, raw);
        inner.buffers.insert(
            raw,
            super::BufferRecord {
                name: desc.name.to_string(),
                usage: desc.usage,
                memory: desc.memory,
                storage,
            },
        );
        Ok(crate::Buffer::from_raw(raw, data))
    }

    fn release_buffer(&self, buffer: crate::Buffer) {
        let mut inner = self.inner.lock();
        match inner.buffers.remove(&buffer.raw()) {
            Some(rb) => inner.allocated_bytes -= rb.storage.len() as u64,
            None => panic!("Releasing unknown buffer {:?}", buffer),
        }
    }

    fn get_memory(
        &self,
        name: &str,
        requirements: crate::MemoryRequirements,
        memory: crate::Memory,
    ) -> Result<crate::Allocation, crate::DeviceError> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, name, requirements.size, memory)?;
        let raw = self.next_raw();
        inner.allocations.insert(
            raw,
            super::AllocationRecord {
                name: name.to_string(),
                size: requirements.size,
            },
        );
        Ok(crate::Allocation {
            raw,
            offset: 0,
            size: requirements.size,
        })
    }

    fn release_memory(&self, allocation: crate::Allocation) {
        let mut inner = self.inner.lock();
        match inner.allocations.remove(&allocation.raw) {
            Some(ar) => inner.allocated_bytes -= ar.size,
            None => panic!("Releasing unknown allocation {:?}", allocation),
        }
    }

    fn flush_buffer(&self, piece: crate::BufferPiece, size: u64) {
        let inner = self.inner.lock();
        let rb = match inner.buffers.get(&piece.buffer.raw()) {
            Some(rb) => rb,
            None => panic!("Flushing unknown buffer {:?}", piece.buffer),
        };
        assert!(
            rb.memory.is_host_visible(),
            "Flushing non-mapped buffer '{}'",
            rb.name
        );
        assert!(
            piece.offset + size <= rb.storage.len() as u64,
            "Flush range {}..{} is out of bounds of '{}'",
            piece.offset,
            piece.offset + size,
            rb.name
        );
    }
}

impl crate::traits::AccelerationStructureDevice for super::Context {
    fn create_acceleration_structure(
        &self,
        desc: &crate::AccelerationStructureDesc,
    ) -> Result<crate::AccelerationStructure, crate::DeviceError> {
        let primitive_count = match desc.ty {
            crate::AccelerationStructureType::TopLevel => desc.instance_count,
            crate::AccelerationStructureType::BottomLevel => desc
                .meshes
                .iter()
                .map(|mesh| mesh.triangle_count())
                .sum::<u32>(),
        };
        let is_valid = match desc.ty {
            crate::AccelerationStructureType::TopLevel => {
                desc.instance_count != 0 && desc.meshes.is_empty()
            }
            crate::AccelerationStructureType::BottomLevel => {
                desc.instance_count == 0 && !desc.meshes.is_empty()
            }
        };
        if !is_valid {
            return Err(crate::DeviceError::ResourceCreation {
                kind: "acceleration structure",
                name: desc.name.to_string(),
            });
        }

        let raw = self.next_raw();
        let mut inner = self.inner.lock();
        inner.structures.insert(
            raw,
            super::StructureInfo {
                name: desc.name.to_string(),
                ty: desc.ty,
                flags: desc.flags,
                max_instance_count: desc.instance_count,
                primitive_count,
                memory: None,
                reference: crate::AccelerationStructureReference::default(),
                build_count: 0,
                update_count: 0,
                copy_count: 0,
                instances: Vec::new(),
            },
        );
        Ok(crate::AccelerationStructure::from_raw(raw))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: crate::AccelerationStructure) {
        let mut inner = self.inner.lock();
        if inner
            .structures
            .remove(&acceleration_structure.raw())
            .is_none()
        {
            panic!("Destroying unknown {:?}", acceleration_structure);
        }
    }

    fn get_acceleration_structure_memory_requirements(
        &self,
        acceleration_structure: crate::AccelerationStructure,
        kind: crate::MemoryRequirementsKind,
    ) -> crate::MemoryRequirements {
        let inner = self.inner.lock();
        let info = match inner.structures.get(&acceleration_structure.raw()) {
            Some(info) => info,
            None => panic!("Querying unknown {:?}", acceleration_structure),
        };
        let per_primitive = match kind {
            crate::MemoryRequirementsKind::BuildScratch => super::BUILD_SCRATCH_BYTES_PER_PRIMITIVE,
            crate::MemoryRequirementsKind::UpdateScratch => {
                super::UPDATE_SCRATCH_BYTES_PER_PRIMITIVE
            }
            crate::MemoryRequirementsKind::Object => super::OBJECT_BYTES_PER_PRIMITIVE,
        };
        let size = (info.primitive_count.max(1) as u64 * per_primitive)
            .next_multiple_of(super::STRUCTURE_ALIGNMENT);
        crate::MemoryRequirements {
            size,
            alignment: super::STRUCTURE_ALIGNMENT,
        }
    }

    fn bind_acceleration_structure_memory(
        &self,
        acceleration_structure: crate::AccelerationStructure,
        allocation: &crate::Allocation,
    ) -> Result<(), crate::DeviceError> {
        let mut inner = self.inner.lock();
        if !inner.allocations.contains_key(&allocation.raw) {
            return Err(crate::DeviceError::ResourceCreation {
                kind: "memory binding",
                name: format!("{:?}", allocation),
            });
        }
        let info = match inner.structures.get_mut(&acceleration_structure.raw()) {
            Some(info) => info,
            None => panic!("Binding memory to unknown {:?}", acceleration_structure),
        };
        assert!(
            info.memory.is_none(),
            "Structure '{}' already has memory bound",
            info.name
        );
        info.memory = Some(*allocation);
        // The address is only known once memory is bound.
        info.reference = crate::AccelerationStructureReference(
            0x1_0000_0000 | (allocation.raw << 8) | acceleration_structure.raw(),
        );
        Ok(())
    }

    fn get_acceleration_structure_reference(
        &self,
        acceleration_structure: crate::AccelerationStructure,
    ) -> crate::AccelerationStructureReference {
        let inner = self.inner.lock();
        match inner.structures.get(&acceleration_structure.raw()) {
            Some(info) => {
                assert!(info.memory.is_some(), "Structure '{}' has no memory", info.name);
                info.reference
            }
            None => panic!("Querying unknown {:?}", acceleration_structure),
        }
    }
}

impl crate::traits::DescriptorDevice for super::Context {
    fn create_descriptor_set(&self, name: &str) -> Result<crate::DescriptorSet, crate::DeviceError> {
        let raw = self.next_raw();
        let mut inner = self.inner.lock();
        inner.descriptor_sets.insert(
            raw,
            super::DescriptorSetRecord {
                name: name.to_string(),
                ..Default::default()
            },
        );
        Ok(crate::DescriptorSet::from_raw(raw))
    }

    fn destroy_descriptor_set(&self, set: crate::DescriptorSet) {
        let mut inner = self.inner.lock();
        inner.descriptor_sets.remove(&set.raw());
    }

    fn update_descriptor_sets(&self, writes: &[crate::DescriptorWrite]) {
        let mut inner = self.inner.lock();
        for write in writes {
            let record = match inner.descriptor_sets.get_mut(&write.set.raw()) {
                Some(record) => record,
                None => panic!("Writing into unknown {:?}", write.set),
            };
            let base = write.array_element;
            match write.resources {
                crate::DescriptorResources::AccelerationStructure(acceleration_structure) => {
                    record.entries.insert(
                        (write.binding, base),
                        super::DescriptorEntry::AccelerationStructure(acceleration_structure),
                    );
                }
                crate::DescriptorResources::UniformBuffer(binding) => {
                    record.entries.insert(
                        (write.binding, base),
                        super::DescriptorEntry::UniformBuffer(binding),
                    );
                }
                crate::DescriptorResources::StorageBuffers(list) => {
                    for (i, binding) in list.iter().enumerate() {
                        record.entries.insert(
                            (write.binding, base + i as u32),
                            super::DescriptorEntry::StorageBuffer(*binding),
                        );
                    }
                }
                crate::DescriptorResources::CombinedImageSamplers(list) => {
                    for (i, binding) in list.iter().enumerate() {
                        record.entries.insert(
                            (write.binding, base + i as u32),
                            super::DescriptorEntry::CombinedImageSampler(*binding),
                        );
                    }
                }
            }
        }
        inner.descriptor_write_count += writes.len();
    }
}
