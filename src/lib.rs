#![allow(
    irrefutable_let_patterns,
    clippy::new_without_default,
    // Conflicts with `pattern_type_mismatch`
    clippy::needless_borrowed_reference,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

use std::sync::Arc;
use tessera_graphics::{self as gpu, CommandDevice as _, DescriptorDevice as _, MemoryManager as _};
use tessera_render as render;

pub mod config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad configuration: {0}")]
    Config(#[from] ron::error::SpannedError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Render(#[from] render::Error),
    #[error(transparent)]
    Device(#[from] gpu::DeviceError),
}

/// Slots are addressed by the 24-bit custom index of structure instances.
pub const MAX_BINDINGS: u32 = 1 << 24;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct ObjectHandle(usize);

/// Convert a glam affine transform into the row-major layout of
/// structure instances.
pub fn transform_from_affine(affine: &glam::Affine3A) -> gpu::Transform {
    let matrix = glam::Mat4::from(*affine);
    let col_matrix = mint::ColumnMatrix3x4 {
        x: matrix.x_axis.truncate().into(),
        y: matrix.y_axis.truncate().into(),
        z: matrix.z_axis.truncate().into(),
        w: matrix.w_axis.truncate().into(),
    };
    mint::RowMatrix3x4::from(col_matrix)
}

enum Visual {
    Model(Arc<render::Model>),
    Particle(render::entity::Particle),
    Deformable(render::entity::DeformableEntity),
}

struct Object {
    name: String,
    visual: Visual,
    /// Scene instance ids, the same in every frame image.
    instances: Vec<u32>,
}

/// Tessera Engine ties together the device, the worker pool that loads
/// models in the background, and the per-image scene structures that are
/// rebuilt every frame.
pub struct Engine {
    pacer: render::util::FramePacer,
    scene: render::Scene,
    worker_pool: render::task::WorkerPool,
    hub: Arc<render::StructureHub>,
    models: Vec<Arc<render::Model>>,
    /// Temporary buffers of work submitted outside of a frame.
    loose_buffers: Vec<gpu::Buffer>,
    objects: slab::Slab<Object>,
    descriptor_sets: Vec<gpu::DescriptorSet>,
    mesh_info_buffer: gpu::Buffer,
    device: Arc<dyn gpu::Device>,
    workers: Vec<choir::WorkerHandle>,
    choir: Arc<choir::Choir>,
}

impl Engine {
    #[profiling::function]
    pub fn new(device: &Arc<dyn gpu::Device>, config: &config::Engine) -> Result<Self, Error> {
        log::info!("Initializing the engine");
        if config.frame_count == 0 {
            return Err(render::Error::InvalidConfiguration("no frame images").into());
        }
        if config.max_bindings == 0 {
            return Err(render::Error::InvalidConfiguration("no binding slots").into());
        }
        if config.max_bindings > MAX_BINDINGS {
            return Err(render::Error::InvalidConfiguration(
                "binding slots don't fit into 24-bit instance indices",
            )
            .into());
        }

        let num_workers = config
            .worker_count
            .unwrap_or_else(|| num_cpus::get_physical().max((num_cpus::get() * 3 + 2) / 4))
            .max(1);
        log::info!("Initializing Choir with {} workers", num_workers);
        let choir = choir::Choir::new();
        let workers = (0..num_workers)
            .map(|i| choir.add_worker(&format!("Worker-{}", i)))
            .collect();

        let mut descriptor_sets = Vec::with_capacity(config.frame_count);
        for i in 0..config.frame_count {
            descriptor_sets.push(device.create_descriptor_set(&format!("ray tracing {}", i))?);
        }
        let mesh_info_buffer = device.get_buffer(gpu::BufferDesc {
            name: "mesh info",
            size: render::BindingRegistry::mesh_info_buffer_size(
                config.max_bindings,
                config.frame_count,
            ),
            usage: gpu::BufferUsage::UNIFORM,
            memory: gpu::Memory::Shared,
        })?;
        let registry = render::BindingRegistry::new(
            device,
            render::BindingRegistryDesc {
                max_bindings: config.max_bindings,
                descriptor_sets: descriptor_sets.clone(),
                mesh_info_buffer,
            },
        );
        let hub = Arc::new(render::StructureHub::new(
            device,
            registry,
            config.ray_tracing,
        ));
        let scene = render::Scene::new(&hub, config.updateable_scene);
        let pacer = render::util::FramePacer::new(device.as_ref(), config.frame_count);
        let worker_pool = render::task::WorkerPool::new(&choir, device);

        Ok(Self {
            pacer,
            scene,
            worker_pool,
            hub,
            models: Vec::new(),
            loose_buffers: Vec::new(),
            objects: slab::Slab::new(),
            descriptor_sets,
            mesh_info_buffer,
            device: Arc::clone(device),
            workers,
            choir,
        })
    }

    pub fn destroy(&mut self) {
        self.worker_pool.wait_idle();
        let device = self.device.as_ref();
        for submission in self.worker_pool.take_submissions() {
            submission.discard(&self.hub);
        }
        self.workers.clear();
        self.pacer.destroy(device);
        for buffer in self.loose_buffers.drain(..) {
            device.release_buffer(buffer);
        }
        self.scene.destroy();
        for object in self.objects.drain() {
            if let Visual::Deformable(entity) = object.visual {
                entity.destroy(&self.hub);
            }
        }
        self.hub.destroy();
        for model in self.models.drain(..) {
            for mesh in model.meshes.iter() {
                mesh.free(device);
            }
        }
        for set in self.descriptor_sets.drain(..) {
            device.destroy_descriptor_set(set);
        }
        device.release_buffer(self.mesh_info_buffer);
    }

    pub fn device(&self) -> &Arc<dyn gpu::Device> {
        &self.device
    }

    pub fn hub(&self) -> &Arc<render::StructureHub> {
        &self.hub
    }

    pub fn scene(&self) -> &render::Scene {
        &self.scene
    }

    pub fn frame_index(&self) -> usize {
        self.pacer.frame_index()
    }

    /// Frame image that the next frame renders into.
    pub fn image_index(&self) -> usize {
        self.pacer.image_index()
    }

    /// Allocate the device buffers of a model. Its contents come from
    /// [`Self::load_model`].
    pub fn create_model(
        &mut self,
        name: &str,
        meshes: Vec<render::model::MeshDesc>,
        lifetime: render::Lifetime,
        rendered: bool,
    ) -> Result<Arc<render::Model>, Error> {
        let device = self.device.as_ref();
        let ray_tracing = self.hub.is_ray_tracing_enabled();
        let mut allocated = Vec::with_capacity(meshes.len());
        for desc in meshes {
            match render::Mesh::allocate(device, desc, ray_tracing) {
                Ok(mesh) => allocated.push(mesh),
                Err(e) => {
                    for mesh in allocated.iter() {
                        mesh.free(device);
                    }
                    return Err(e.into());
                }
            }
        }
        let model = Arc::new(render::Model::new(name, allocated, lifetime, rendered));
        self.models.push(Arc::clone(&model));
        Ok(model)
    }

    /// Schedule the upload and structure build of a model.
    pub fn load_model(&self, model: &Arc<render::Model>, vertex_data: Vec<u8>, vertex_stride: u32) {
        log::info!(
            "Loading model '{}' with {} bytes of vertices",
            model.name,
            vertex_data.len()
        );
        let task = render::task::ModelBuildTask::new(
            &self.hub,
            self.pacer.image_index(),
            model,
            vertex_data,
            vertex_stride,
        );
        self.worker_pool.add_work(Box::new(task));
    }

    /// Number of background loads that haven't finished yet.
    pub fn pending_loads(&self) -> usize {
        self.worker_pool.pending()
    }

    /// Block until all background loads are done, and submit their work.
    /// Loaded models can be placed right after.
    pub fn wait_idle(&mut self) -> Result<(), Error> {
        self.worker_pool.wait_idle();
        self.submit_work()
    }

    /// Submit finished background work and attach the structures it built.
    fn submit_work(&mut self) -> Result<(), Error> {
        let device = self.device.as_ref();
        for mut submission in self.worker_pool.take_submissions() {
            log::debug!(
                "Submitting '{}', scheduled for image {}",
                submission.name,
                submission.image_index
            );
            device.submit(&mut submission.encoder)?;
            submission.publish(&self.hub);
            self.loose_buffers.append(&mut submission.temp_buffers);
        }
        Ok(())
    }

    fn insert_object(&mut self, name: &str, visual: Visual, instances: Vec<u32>) -> ObjectHandle {
        log::debug!("Object '{}' with instances {:?}", name, instances);
        ObjectHandle(self.objects.insert(Object {
            name: name.to_string(),
            visual,
            instances,
        }))
    }

    /// Place a loaded model into the scene.
    pub fn add_object(
        &mut self,
        name: &str,
        model: &Arc<render::Model>,
        transform: gpu::Transform,
    ) -> Result<ObjectHandle, Error> {
        let mut instances = Vec::new();
        if self.hub.is_ray_tracing_enabled() {
            instances.push(self.scene.add_model(model, transform)?);
        }
        Ok(self.insert_object(name, Visual::Model(Arc::clone(model)), instances))
    }

    /// Place a tinted copy of a loaded model into the scene.
    pub fn add_particle(
        &mut self,
        name: &str,
        model: &Arc<render::Model>,
        color: [f32; 4],
        transform: gpu::Transform,
    ) -> Result<ObjectHandle, Error> {
        let particle = render::entity::Particle::new(model, color);
        let mut instances = Vec::new();
        if self.hub.is_ray_tracing_enabled() {
            instances.push(self.scene.add_particle(&particle, transform)?);
        }
        Ok(self.insert_object(name, Visual::Particle(particle), instances))
    }

    /// Place models whose vertices get rewritten every frame.
    ///
    /// `models` has one `[mesh][image]` table of transformed vertex buffers
    /// per model. Their structures are refitted at the start of each frame.
    pub fn add_deformable(
        &mut self,
        name: &str,
        models: Vec<(Arc<render::Model>, Vec<Vec<gpu::Buffer>>)>,
        vertex_stride: u32,
        transform: gpu::Transform,
    ) -> Result<ObjectHandle, Error> {
        if !self.hub.is_ray_tracing_enabled() {
            return Err(render::Error::InvalidConfiguration("ray tracing is disabled").into());
        }
        let device = self.device.as_ref();
        let mut encoder = device.create_command_encoder(gpu::CommandEncoderDesc { name });
        encoder.start();
        let entity =
            render::entity::DeformableEntity::new(&self.hub, &mut encoder, name, models, vertex_stride)?;
        encoder.finish();
        device.submit(&mut encoder)?;
        let instances = self.scene.add_deformable(&entity, transform)?;
        Ok(self.insert_object(name, Visual::Deformable(entity), instances))
    }

    pub fn object_name(&self, handle: ObjectHandle) -> &str {
        &self.objects[handle.0].name
    }

    pub fn object_model(&self, handle: ObjectHandle) -> Option<&Arc<render::Model>> {
        match self.objects[handle.0].visual {
            Visual::Model(ref model) => Some(model),
            Visual::Particle(ref particle) => Some(&particle.model),
            Visual::Deformable(_) => None,
        }
    }

    pub fn deformable(&self, handle: ObjectHandle) -> Option<&render::entity::DeformableEntity> {
        match self.objects[handle.0].visual {
            Visual::Deformable(ref entity) => Some(entity),
            _ => None,
        }
    }

    pub fn object_instances(&self, handle: ObjectHandle) -> &[u32] {
        &self.objects[handle.0].instances
    }

    /// Move an object. Takes effect in each image on its next build.
    pub fn set_transform(&mut self, handle: ObjectHandle, transform: gpu::Transform) {
        for &id in self.objects[handle.0].instances.iter() {
            self.scene.set_transform(id, transform);
        }
    }

    fn check_faults(&self) -> Result<(), Error> {
        self.choir.check_panic();
        match self.worker_pool.take_fault() {
            Some(fault) => {
                log::error!("Background work failed: {}", fault);
                Err(fault.into())
            }
            None => Ok(()),
        }
    }

    /// Start a frame: submit finished background work, recycle the
    /// resources of the current image, and bring the image's structures
    /// up to date.
    #[profiling::function]
    pub fn begin_frame(&mut self) -> Result<usize, Error> {
        self.check_faults()?;
        self.submit_work()?;
        let device = self.device.as_ref();
        let (image_index, encoder, resources) = self.pacer.begin_frame(device);
        // kept until this image comes around again
        resources.buffers.append(&mut self.loose_buffers);

        if self.hub.is_ray_tracing_enabled() {
            for (_, object) in self.objects.iter() {
                if let Visual::Deformable(ref entity) = object.visual {
                    entity.update_structures(&self.hub, encoder, image_index)?;
                }
            }
            if self.scene.build(encoder, image_index)? {
                log::trace!("Rebuilt the scene of image {}", image_index);
            }
        }
        Ok(image_index)
    }

    #[profiling::function]
    pub fn end_frame(&mut self) -> Result<gpu::SyncPoint, Error> {
        let sync_point = self.pacer.end_frame(self.device.as_ref())?;
        self.check_faults()?;
        Ok(sync_point)
    }
}
