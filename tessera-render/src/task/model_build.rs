use std::{ptr, sync::Arc};
use tessera_graphics::{self as gpu, MemoryManager as _};

use crate::{
    BottomLevelAccelerationStructure, BottomLevelHandle, Lifetime, Model, Performance, StructureHub,
};

/// Uploads the vertices of a model, generates its index buffers, and
/// builds its bottom-level structure. The structure is attached to the
/// model by [`super::Submission::publish`].
///
/// Long-lived rendered models also get their binding slots registered
/// here, in every frame image, so that they never have to be registered
/// again by the frame loop.
pub struct ModelBuildTask {
    hub: Arc<StructureHub>,
    image_index: usize,
    model: Arc<Model>,
    vertex_data: Vec<u8>,
    vertex_stride: u32,
}

impl ModelBuildTask {
    pub fn new(
        hub: &Arc<StructureHub>,
        image_index: usize,
        model: &Arc<Model>,
        vertex_data: Vec<u8>,
        vertex_stride: u32,
    ) -> Self {
        Self {
            hub: Arc::clone(hub),
            image_index,
            model: Arc::clone(model),
            vertex_data,
            vertex_stride,
        }
    }

    fn generate_indices(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for mesh in self.model.meshes.iter() {
            match mesh.index_type {
                gpu::IndexType::U16 => {
                    let indices = (0..mesh.index_count()).map(|i| i as u16).collect::<Vec<_>>();
                    data.extend_from_slice(bytemuck::cast_slice(&indices));
                }
                gpu::IndexType::U32 => {
                    let indices = (0..mesh.index_count()).collect::<Vec<u32>>();
                    data.extend_from_slice(bytemuck::cast_slice(&indices));
                }
            }
        }
        data
    }

    #[profiling::function]
    pub fn run(self, context: &super::WorkerContext) -> Result<Option<super::Submission>, crate::Error> {
        let model = &self.model;
        if self.vertex_data.is_empty() {
            log::debug!("Model '{}' has no vertex data, skipping", model.name);
            return Ok(None);
        }
        let expected = model.vertex_count() as usize * self.vertex_stride as usize;
        if expected != self.vertex_data.len() {
            return Err(crate::Error::PayloadMismatch {
                model: model.name.clone(),
                expected,
                actual: self.vertex_data.len(),
            });
        }

        let device = context.device();
        let index_data = self.generate_indices();
        let staging = device.get_buffer(gpu::BufferDesc {
            name: &format!("{} staging", model.name),
            size: (self.vertex_data.len() + index_data.len()) as u64,
            usage: gpu::BufferUsage::TRANSFER_SRC,
            memory: gpu::Memory::Upload,
        })?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.vertex_data.as_ptr(),
                staging.data(),
                self.vertex_data.len(),
            );
            ptr::copy_nonoverlapping(
                index_data.as_ptr(),
                staging.data().add(self.vertex_data.len()),
                index_data.len(),
            );
        }

        let mut encoder = context.create_command_encoder(&format!("build {}", model.name));
        encoder.start();
        {
            let mut transfer = encoder.transfer();
            let mut vertex_offset = 0;
            let mut index_offset = self.vertex_data.len() as u64;
            for mesh in model.meshes.iter() {
                let vertex_size = mesh.vertex_count as u64 * self.vertex_stride as u64;
                transfer.copy_buffer_to_buffer(
                    staging.at(vertex_offset),
                    mesh.vertex_buffer.into(),
                    vertex_size,
                );
                transfer.copy_buffer_to_buffer(
                    staging.at(index_offset),
                    mesh.index_buffer.into(),
                    mesh.index_data_size(),
                );
                vertex_offset += vertex_size;
                index_offset += mesh.index_data_size();
            }
        }

        let mut bottom_level = None;
        if self.hub.is_ray_tracing_enabled() {
            match self.build_bottom_level(device, &mut encoder) {
                Ok(handle) => bottom_level = Some((Arc::clone(model), handle)),
                Err(e) => {
                    device.release_buffer(staging);
                    return Err(e);
                }
            }
        }
        encoder.finish();

        Ok(Some(super::Submission {
            name: model.name.clone(),
            encoder,
            temp_buffers: vec![staging],
            image_index: self.image_index,
            bottom_level,
        }))
    }

    fn build_bottom_level(
        &self,
        device: &dyn gpu::Device,
        encoder: &mut gpu::CommandEncoder,
    ) -> Result<BottomLevelHandle, crate::Error> {
        let model = &self.model;
        let meshes = model
            .meshes
            .iter()
            .map(|mesh| mesh.geometry(mesh.vertex_buffer, self.vertex_stride))
            .collect();
        encoder.barrier(gpu::Barrier::transfer_to_acceleration_structure_build());
        let blas = BottomLevelAccelerationStructure::new(
            device,
            encoder,
            &model.name,
            meshes,
            false,
            model.lifetime == Lifetime::Long,
            Performance::FastTrace,
        )?;

        if model.lifetime == Lifetime::Long && model.rendered {
            let registered = self
                .hub
                .registry()
                .lock()
                .register_meshes(&model.registrations(crate::WHITE));
            match registered {
                Ok(range) => blas.set_resource_index(range.start),
                Err(e) => {
                    blas.destroy(device);
                    return Err(e);
                }
            }
        }

        // The model only learns about the structure once the submission
        // recording its build is handed to the device.
        Ok(self.hub.insert_bottom_level(blas))
    }
}

impl super::Work for ModelBuildTask {
    fn name(&self) -> &str {
        &self.model.name
    }
    fn priority(&self) -> super::Priority {
        super::Priority::BACKGROUND
    }
    fn process(
        self: Box<Self>,
        context: &super::WorkerContext,
    ) -> Result<Option<super::Submission>, crate::Error> {
        self.run(context)
    }
}
