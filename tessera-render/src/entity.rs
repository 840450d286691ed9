//! Scene records whose geometry is bound differently from plain models.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tessera_graphics as gpu;

use crate::{BottomLevelAccelerationStructure, BottomLevelHandle, Model, Performance, StructureHub};

const NO_RESOURCE: u32 = u32::MAX;

/// A model whose vertices are transformed on the device every frame.
pub struct DeformedModel {
    pub model: Arc<Model>,
    /// Transformed vertex buffers, indexed by `[mesh][image]`.
    pub vertex_buffers: Vec<Vec<gpu::Buffer>>,
    pub vertex_stride: u32,
    /// One updateable structure per frame image.
    pub bottom_levels: Vec<BottomLevelHandle>,
}

impl DeformedModel {
    pub(crate) fn registrations(&self, image_index: usize) -> Vec<crate::MeshRegistration> {
        self.model
            .meshes
            .iter()
            .zip(self.vertex_buffers.iter())
            .map(|(mesh, buffers)| {
                mesh.registration(buffers[image_index], crate::WHITE, self.model.light_offset)
            })
            .collect()
    }
}

pub struct DeformableEntity {
    pub name: String,
    pub models: Vec<DeformedModel>,
}

impl DeformableEntity {
    /// Build the per-image structures over the transformed vertex buffers.
    ///
    /// `vertex_buffers` has one `[mesh][image]` table per model.
    pub fn new(
        hub: &StructureHub,
        encoder: &mut gpu::CommandEncoder,
        name: &str,
        models: Vec<(Arc<Model>, Vec<Vec<gpu::Buffer>>)>,
        vertex_stride: u32,
    ) -> Result<Self, crate::Error> {
        let device = hub.device().as_ref();
        let mut deformed_models = Vec::with_capacity(models.len());
        for (model, vertex_buffers) in models {
            let mut bottom_levels = Vec::with_capacity(hub.image_count());
            for image_index in 0..hub.image_count() {
                let meshes = model
                    .meshes
                    .iter()
                    .zip(vertex_buffers.iter())
                    .map(|(mesh, buffers)| mesh.geometry(buffers[image_index], vertex_stride))
                    .collect();
                let blas = BottomLevelAccelerationStructure::new(
                    device,
                    encoder,
                    &format!("{}/{}{}", name, model.name, image_index),
                    meshes,
                    true,
                    false,
                    Performance::FastBuild,
                )?;
                bottom_levels.push(hub.insert_bottom_level(blas));
            }
            deformed_models.push(DeformedModel {
                model,
                vertex_buffers,
                vertex_stride,
                bottom_levels,
            });
        }
        Ok(Self {
            name: name.to_string(),
            models: deformed_models,
        })
    }

    /// Refit the structures of one image after its vertices were rewritten.
    #[profiling::function]
    pub fn update_structures(
        &self,
        hub: &StructureHub,
        encoder: &mut gpu::CommandEncoder,
        image_index: usize,
    ) -> Result<(), crate::Error> {
        for deformed in self.models.iter() {
            let blas = deformed
                .bottom_levels
                .get(image_index)
                .and_then(|&handle| hub.bottom_level(handle))
                .ok_or_else(|| crate::Error::MissingBottomLevel {
                    model: deformed.model.name.clone(),
                })?;
            blas.update(encoder)?;
        }
        Ok(())
    }

    pub fn bottom_level(&self, model_index: usize, image_index: usize) -> Option<BottomLevelHandle> {
        self.models
            .get(model_index)?
            .bottom_levels
            .get(image_index)
            .copied()
    }

    pub fn destroy(&self, hub: &StructureHub) {
        for deformed in self.models.iter() {
            for &handle in deformed.bottom_levels.iter() {
                hub.release_bottom_level(handle);
            }
        }
    }
}

/// A tinted copy of a model that isn't rendered by itself.
pub struct Particle {
    pub model: Arc<Model>,
    pub color: [f32; 4],
    resource_index: AtomicU32,
}

impl Particle {
    pub fn new(model: &Arc<Model>, color: [f32; 4]) -> Self {
        Self {
            model: Arc::clone(model),
            color,
            resource_index: AtomicU32::new(NO_RESOURCE),
        }
    }

    pub fn resource_index(&self) -> Option<u32> {
        match self.resource_index.load(Ordering::Acquire) {
            NO_RESOURCE => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_resource_index(&self, index: u32) {
        self.resource_index.store(index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tessera_graphics as gpu;

    fn deformable(
        context: &Arc<gpu::capture::Context>,
        hub: &crate::StructureHub,
        encoder: &mut gpu::CommandEncoder,
    ) -> super::DeformableEntity {
        let model = Arc::new(crate::test_util::model(
            context,
            "body",
            &[3, 6],
            crate::Lifetime::Long,
            false,
        ));
        let vertex_buffers: Vec<Vec<gpu::Buffer>> = model
            .meshes
            .iter()
            .map(|mesh| {
                (0..hub.image_count())
                    .map(|_| crate::test_util::mesh(context, "deformed", mesh.vertex_count).vertex_buffer)
                    .collect()
            })
            .collect();
        super::DeformableEntity::new(hub, encoder, "guard", vec![(model, vertex_buffers)], 12).unwrap()
    }

    #[test]
    fn per_image_slot_ranges() {
        let (context, hub) = crate::test_util::hub(32, 2);
        let mut encoder = gpu::CommandEncoder::new(gpu::CommandEncoderDesc { name: "test" });
        encoder.start();
        let entity = deformable(&context, &hub, &mut encoder);
        let mut tlas = crate::TopLevelAccelerationStructure::new(&hub, 0, true);
        tlas.add_deformable_resource(&entity).unwrap();
        assert_eq!(tlas.slot_ranges(), &[0..2, 2..4]);

        for image_index in 0..2 {
            let handle = entity.bottom_level(0, image_index).unwrap();
            let blas = hub.bottom_level(handle).unwrap();
            let base = blas.resource_index().unwrap();
            assert_eq!(base, image_index as u32 * 2);
            let slot = hub.registry().slot(base).unwrap();
            assert_eq!(
                slot.vertex,
                gpu::BufferBinding::from(entity.models[0].vertex_buffers[0][image_index])
            );
        }
    }

    #[test]
    fn update_refits_only_one_image() {
        let (context, hub) = crate::test_util::hub(32, 2);
        let mut encoder = gpu::CommandEncoder::new(gpu::CommandEncoderDesc { name: "test" });
        encoder.start();
        let entity = deformable(&context, &hub, &mut encoder);
        entity.update_structures(&hub, &mut encoder, 1).unwrap();
        use gpu::CommandDevice as _;
        context.submit(&mut encoder).unwrap();

        let raw = |image_index| {
            let handle = entity.bottom_level(0, image_index).unwrap();
            hub.bottom_level(handle).unwrap().structure().raw()
        };
        assert_eq!(context.structure(raw(0)).unwrap().update_count, 0);
        assert_eq!(context.structure(raw(1)).unwrap().update_count, 1);
        entity.destroy(&hub);
        assert_eq!(hub.bottom_level_count(), 0);
    }

    #[test]
    fn particle_takes_its_tint() {
        let (context, hub) = crate::test_util::hub(32, 2);
        let model = crate::test_util::built_model(&context, &hub, "spark", &[3], crate::Lifetime::Short);
        let particle = super::Particle::new(&model, [1.0, 0.5, 0.0, 1.0]);
        assert_eq!(particle.resource_index(), None);
        let mut tlas = crate::TopLevelAccelerationStructure::new(&hub, 1, false);
        let base = tlas.add_particle_resource(&particle).unwrap();
        assert_eq!(particle.resource_index(), Some(base));
        let info = hub.registry().read_mesh_info(1, base);
        assert_eq!(info.color_tint, [1.0, 0.5, 0.0, 1.0]);
    }
}
