use std::sync::Arc;
use tessera_graphics as gpu;

use crate::{
    entity::{DeformableEntity, Particle},
    BottomLevelAccelerationStructure, Model, StructureHub, TopLevelAccelerationStructure, TopLevelState,
};

const VISIBLE_MASK: u8 = 0xFF;

/// Top-level structures of every frame image, kept in lockstep.
///
/// An instance id refers to the same object in every image.
pub struct Scene {
    hub: Arc<StructureHub>,
    layers: Vec<TopLevelAccelerationStructure>,
}

impl Scene {
    pub fn new(hub: &Arc<StructureHub>, updateable: bool) -> Self {
        let layers = (0..hub.image_count())
            .map(|image_index| TopLevelAccelerationStructure::new(hub, image_index, updateable))
            .collect();
        Self {
            hub: Arc::clone(hub),
            layers,
        }
    }

    pub fn layer(&self, image_index: usize) -> &TopLevelAccelerationStructure {
        &self.layers[image_index]
    }

    pub fn instance_count(&self) -> u32 {
        self.layers[0].instance_count()
    }

    fn check_capacity(&self, count: usize) -> Result<(), crate::Error> {
        let layer = &self.layers[0];
        if layer.instance_count() as usize + count > layer.capacity() as usize {
            Err(crate::Error::InstanceCapacity {
                capacity: layer.capacity(),
            })
        } else {
            Ok(())
        }
    }

    fn add_to_layer(
        &mut self,
        image_index: usize,
        blas: &BottomLevelAccelerationStructure,
        resource_index: u32,
        transform: gpu::Transform,
    ) -> Result<u32, crate::Error> {
        self.layers[image_index].add_instance(gpu::AccelerationStructureInstance::new(
            transform,
            resource_index,
            VISIBLE_MASK,
            blas.reference(),
        ))
    }

    /// Add an instance of a built model. Models without slots get them here.
    pub fn add_model(&mut self, model: &Model, transform: gpu::Transform) -> Result<u32, crate::Error> {
        self.check_capacity(1)?;
        let blas = self.hub.model_bottom_level(model)?;
        let resource_index = match blas.resource_index() {
            Some(index) => index,
            None => self.layers[0].add_model_resource(model)?,
        };
        let mut id = 0;
        for image_index in 0..self.layers.len() {
            id = self.add_to_layer(image_index, &blas, resource_index, transform)?;
        }
        Ok(id)
    }

    /// Add one instance per model of the entity, each image pointing at
    /// its own deformed structure.
    pub fn add_deformable(
        &mut self,
        entity: &DeformableEntity,
        transform: gpu::Transform,
    ) -> Result<Vec<u32>, crate::Error> {
        self.check_capacity(entity.models.len())?;
        let mut ids = Vec::with_capacity(entity.models.len());
        for (model_index, deformed) in entity.models.iter().enumerate() {
            let mut id = 0;
            for image_index in 0..self.layers.len() {
                let blas = entity
                    .bottom_level(model_index, image_index)
                    .and_then(|handle| self.hub.bottom_level(handle))
                    .ok_or_else(|| crate::Error::MissingBottomLevel {
                        model: deformed.model.name.clone(),
                    })?;
                let resource_index = match blas.resource_index() {
                    Some(index) => index,
                    None => {
                        self.layers[0].add_deformable_resource(entity)?;
                        blas.resource_index().unwrap_or_default()
                    }
                };
                id = self.add_to_layer(image_index, &blas, resource_index, transform)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn add_particle(
        &mut self,
        particle: &Particle,
        transform: gpu::Transform,
    ) -> Result<u32, crate::Error> {
        self.check_capacity(1)?;
        let blas = self.hub.model_bottom_level(&particle.model)?;
        let resource_index = match particle.resource_index() {
            Some(index) => index,
            None => self.layers[0].add_particle_resource(particle)?,
        };
        let mut id = 0;
        for image_index in 0..self.layers.len() {
            id = self.add_to_layer(image_index, &blas, resource_index, transform)?;
        }
        Ok(id)
    }

    /// Move an instance in every image. Images that were never built
    /// start from the new transform on their first build.
    pub fn set_transform(&mut self, id: u32, transform: gpu::Transform) {
        for layer in self.layers.iter_mut() {
            match layer.state() {
                TopLevelState::Empty => layer.set_initial_transform(id, transform),
                _ => layer.update_instance(id, transform),
            }
        }
    }

    pub fn build(
        &mut self,
        encoder: &mut gpu::CommandEncoder,
        image_index: usize,
    ) -> Result<bool, crate::Error> {
        self.layers[image_index].build(encoder)
    }

    pub fn destroy(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_graphics::{self as gpu, CommandDevice as _};

    #[test]
    fn instances_stay_in_lockstep() {
        let (context, hub) = crate::test_util::hub(16, 2);
        let rock = crate::test_util::built_model(&context, &hub, "rock", &[3], crate::Lifetime::Short);
        let tree = crate::test_util::built_model(&context, &hub, "tree", &[3, 3], crate::Lifetime::Short);
        let mut scene = super::Scene::new(&hub, true);
        let a = scene.add_model(&rock, gpu::IDENTITY_TRANSFORM.into()).unwrap();
        let b = scene.add_model(&tree, gpu::IDENTITY_TRANSFORM.into()).unwrap();
        let c = scene.add_model(&rock, gpu::IDENTITY_TRANSFORM.into()).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        // the second rock reuses the slots of the first
        assert_eq!(hub.registry().slot_count(), 3);
        for image_index in 0..2 {
            let layer = scene.layer(image_index);
            assert_eq!(layer.instance_count(), 3);
            assert_eq!(layer.instance(2).unwrap().custom_index(), 0);
            assert_eq!(layer.instance(1).unwrap().custom_index(), 1);
        }

        let mut encoder = gpu::CommandEncoder::new(gpu::CommandEncoderDesc { name: "frame" });
        encoder.start();
        assert!(scene.build(&mut encoder, 0).unwrap());
        context.submit(&mut encoder).unwrap();

        // the image built later starts from the moved transform
        let mut moved = gpu::IDENTITY_TRANSFORM;
        moved[11] = 1.0;
        scene.set_transform(b, moved.into());
        assert!(scene.layer(0).is_dirty());
        encoder.start();
        assert!(scene.build(&mut encoder, 0).unwrap());
        assert!(scene.build(&mut encoder, 1).unwrap());
        context.submit(&mut encoder).unwrap();
        for image_index in 0..2 {
            let layer = scene.layer(image_index);
            assert_eq!(layer.instance(b).unwrap().transform, moved);
            let info = context.structure(layer.structure().unwrap().raw()).unwrap();
            assert_eq!(info.instances[b as usize].transform, moved);
        }
        scene.destroy();
    }

    #[test]
    fn particles_are_tinted() {
        let (context, hub) = crate::test_util::hub(16, 2);
        let spark = crate::test_util::built_model(&context, &hub, "spark", &[3], crate::Lifetime::Short);
        let particle = crate::entity::Particle::new(&spark, [0.0, 1.0, 0.0, 1.0]);
        let mut scene = super::Scene::new(&hub, false);
        let id = scene.add_particle(&particle, gpu::IDENTITY_TRANSFORM.into()).unwrap();
        let index = particle.resource_index().unwrap();
        assert_eq!(scene.layer(1).instance(id).unwrap().custom_index(), index);
        assert_eq!(hub.registry().read_mesh_info(0, index).color_tint, [0.0, 1.0, 0.0, 1.0]);
        let again = scene.add_particle(&particle, gpu::IDENTITY_TRANSFORM.into()).unwrap();
        assert_eq!(again, id + 1);
        assert_eq!(hub.registry().slot_count(), 1);
    }
}
