use std::mem;

impl super::Inner {
    fn copy_buffer(&mut self, src: crate::BufferPiece, dst: crate::BufferPiece, size: u64) {
        let src_bytes = match self.buffers.get(&src.buffer.raw()) {
            Some(rb) => {
                let end = src.offset + size;
                assert!(
                    end <= rb.storage.len() as u64,
                    "Copy source range ..{} is out of bounds of '{}'",
                    end,
                    rb.name
                );
                rb.storage[src.offset as usize..end as usize].to_vec()
            }
            None => panic!("Copy from unknown {:?}", src.buffer),
        };
        match self.buffers.get_mut(&dst.buffer.raw()) {
            Some(rb) => {
                let end = dst.offset + size;
                assert!(
                    end <= rb.storage.len() as u64,
                    "Copy destination range ..{} is out of bounds of '{}'",
                    end,
                    rb.name
                );
                rb.storage[dst.offset as usize..end as usize].copy_from_slice(&src_bytes);
            }
            None => panic!("Copy into unknown {:?}", dst.buffer),
        }
    }

    fn read_instances(
        &self,
        piece: crate::BufferPiece,
        count: u32,
    ) -> Vec<crate::AccelerationStructureInstance> {
        let stride = mem::size_of::<crate::AccelerationStructureInstance>();
        let rb = match self.buffers.get(&piece.buffer.raw()) {
            Some(rb) => rb,
            None => panic!("Instance data in unknown {:?}", piece.buffer),
        };
        let start = piece.offset as usize;
        let end = start + count as usize * stride;
        assert!(
            end <= rb.storage.len(),
            "Instance data ..{} is out of bounds of '{}'",
            end,
            rb.name
        );
        rb.storage[start..end]
            .chunks_exact(stride)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    fn execute(&mut self, command: &crate::Command) {
        match *command {
            crate::Command::CopyBufferToBuffer { src, dst, size } => {
                self.copy_buffer(src, dst, size);
            }
            crate::Command::Barrier(_) => {}
            crate::Command::BuildAccelerationStructure {
                ty,
                flags,
                dst,
                src,
                ref meshes,
                instance_data,
                instance_count,
                scratch,
            } => {
                assert!(
                    self.buffers.contains_key(&scratch.buffer.raw()),
                    "Scratch {:?} is not alive",
                    scratch.buffer
                );
                let instances = match instance_data {
                    Some(piece) => self.read_instances(piece, instance_count),
                    None => Vec::new(),
                };
                for mesh in meshes.iter() {
                    for buffer in [mesh.vertex_data.buffer, mesh.index_data.buffer] {
                        assert!(
                            self.buffers.contains_key(&buffer.raw()),
                            "Geometry {:?} is not alive",
                            buffer
                        );
                    }
                }
                let info = match self.structures.get_mut(&dst.raw()) {
                    Some(info) => info,
                    None => panic!("Building unknown {:?}", dst),
                };
                assert_eq!(info.ty, ty, "Structure '{}' type mismatch", info.name);
                assert!(info.memory.is_some(), "Structure '{}' has no memory", info.name);
                assert!(
                    instance_count <= info.max_instance_count || ty == crate::AccelerationStructureType::BottomLevel,
                    "Structure '{}' was created for {} instances, building {}",
                    info.name,
                    info.max_instance_count,
                    instance_count
                );
                match src {
                    Some(source) => {
                        assert_eq!(source, dst, "Updates are only supported in place");
                        assert!(
                            info.flags
                                .contains(crate::AccelerationStructureFlags::ALLOW_UPDATE),
                            "Structure '{}' is not updateable",
                            info.name
                        );
                        assert!(info.is_built(), "Structure '{}' is updated before being built", info.name);
                        info.update_count += 1;
                    }
                    None => info.build_count += 1,
                }
                debug_assert_eq!(
                    info.flags & !crate::AccelerationStructureFlags::ALLOW_COMPACTION,
                    flags & !crate::AccelerationStructureFlags::ALLOW_COMPACTION,
                    "Structure '{}' is built with different flags",
                    info.name
                );
                if ty == crate::AccelerationStructureType::TopLevel {
                    info.instances = instances;
                }
            }
            crate::Command::CopyAccelerationStructure { src, dst, mode } => {
                let source = match self.structures.get(&src.raw()) {
                    Some(info) => info.clone(),
                    None => panic!("Copying from unknown {:?}", src),
                };
                assert!(source.is_built(), "Copying from unbuilt '{}'", source.name);
                let target = match self.structures.get_mut(&dst.raw()) {
                    Some(info) => info,
                    None => panic!("Copying into unknown {:?}", dst),
                };
                assert!(target.memory.is_some(), "Structure '{}' has no memory", target.name);
                log::trace!("Copy '{}' -> '{}' ({:?})", source.name, target.name, mode);
                target.instances = source.instances;
                target.copy_count += 1;
            }
        }
    }
}

impl crate::traits::CommandDevice for super::Context {
    fn submit(
        &self,
        encoder: &mut crate::CommandEncoder,
    ) -> Result<crate::SyncPoint, crate::DeviceError> {
        let commands = encoder.take_commands();
        let mut inner = self.inner.lock();
        for command in commands.iter() {
            inner.execute(command);
        }
        inner.submissions.push(super::CapturedSubmission {
            name: encoder.name().to_string(),
            commands,
        });
        Ok(crate::SyncPoint {
            index: inner.submissions.len() as u64,
        })
    }

    fn wait_for(&self, sp: &crate::SyncPoint, _timeout_ms: u32) -> bool {
        // Execution is immediate, so every issued point is already reached.
        sp.index <= self.inner.lock().submissions.len() as u64
    }
}
