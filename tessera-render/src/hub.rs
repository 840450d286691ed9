use std::sync::Arc;
use tessera_graphics as gpu;

use crate::{arena, BindingRegistry, BottomLevelAccelerationStructure, Model};

pub type BottomLevelHandle = arena::Handle<BottomLevelAccelerationStructure>;

/// Shared state of the structure subsystem: the device, the slot
/// registry, and every bottom-level structure alive.
pub struct StructureHub {
    device: Arc<dyn gpu::Device>,
    registry: BindingRegistry,
    bottom_levels: arena::Arena<BottomLevelAccelerationStructure>,
    ray_tracing: bool,
}

impl StructureHub {
    pub fn new(device: &Arc<dyn gpu::Device>, registry: BindingRegistry, ray_tracing: bool) -> Self {
        Self {
            device: Arc::clone(device),
            registry,
            bottom_levels: arena::Arena::new(),
            ray_tracing,
        }
    }

    pub fn device(&self) -> &Arc<dyn gpu::Device> {
        &self.device
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    /// Without ray tracing, build tasks only upload geometry.
    pub fn is_ray_tracing_enabled(&self) -> bool {
        self.ray_tracing
    }

    pub fn image_count(&self) -> usize {
        self.registry.image_count()
    }

    pub fn insert_bottom_level(&self, blas: BottomLevelAccelerationStructure) -> BottomLevelHandle {
        self.bottom_levels.alloc(blas)
    }

    pub fn bottom_level(&self, handle: BottomLevelHandle) -> Option<Arc<BottomLevelAccelerationStructure>> {
        self.bottom_levels.get(handle)
    }

    pub fn bottom_level_count(&self) -> usize {
        self.bottom_levels.len()
    }

    /// Look up the structure of a model that has been built.
    pub fn model_bottom_level(
        &self,
        model: &Model,
    ) -> Result<Arc<BottomLevelAccelerationStructure>, crate::Error> {
        model
            .bottom_level()
            .and_then(|handle| self.bottom_levels.get(handle))
            .ok_or_else(|| crate::Error::MissingBottomLevel {
                model: model.name.clone(),
            })
    }

    /// Destroy a structure. The caller makes sure no submitted work uses it.
    pub fn release_bottom_level(&self, handle: BottomLevelHandle) {
        if let Some(blas) = self.bottom_levels.free(handle) {
            self.destroy_shared(blas);
        }
    }

    fn destroy_shared(&self, blas: Arc<BottomLevelAccelerationStructure>) {
        match Arc::try_unwrap(blas) {
            Ok(blas) => blas.destroy(self.device.as_ref()),
            Err(blas) => log::warn!(
                "Structure '{}' is still referenced, leaking it",
                blas.structure().name()
            ),
        }
    }

    pub fn destroy(&self) {
        self.bottom_levels
            .dealloc_each(|_, blas| self.destroy_shared(blas));
    }
}
