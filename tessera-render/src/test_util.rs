use std::sync::Arc;
use tessera_graphics::{self as gpu, CommandDevice as _, DescriptorDevice as _, MemoryManager as _};

pub fn hub(
    max_bindings: u32,
    image_count: usize,
) -> (Arc<gpu::capture::Context>, Arc<crate::StructureHub>) {
    let _ = env_logger::try_init();
    let context = Arc::new(gpu::capture::Context::new());
    let device: Arc<dyn gpu::Device> = context.clone();
    let mesh_info_buffer = context
        .get_buffer(gpu::BufferDesc {
            name: "mesh info",
            size: crate::BindingRegistry::mesh_info_buffer_size(max_bindings, image_count),
            usage: gpu::BufferUsage::UNIFORM,
            memory: gpu::Memory::Shared,
        })
        .unwrap();
    let descriptor_sets = (0..image_count)
        .map(|i| context.create_descriptor_set(&format!("ray tracing {i}")).unwrap())
        .collect();
    let registry = crate::BindingRegistry::new(
        &device,
        crate::BindingRegistryDesc {
            max_bindings,
            descriptor_sets,
            mesh_info_buffer,
        },
    );
    let hub = Arc::new(crate::StructureHub::new(&device, registry, true));
    (context, hub)
}

pub fn mesh(context: &gpu::capture::Context, name: &str, vertex_count: u32) -> crate::Mesh {
    crate::Mesh::allocate(
        context,
        crate::model::MeshDesc {
            name,
            vertex_count,
            vertex_stride: 12,
            texture: crate::Texture::default(),
            transparent: false,
        },
        true,
    )
    .unwrap()
}

pub fn model(
    context: &gpu::capture::Context,
    name: &str,
    vertex_counts: &[u32],
    lifetime: crate::Lifetime,
    rendered: bool,
) -> crate::Model {
    let meshes = vertex_counts
        .iter()
        .enumerate()
        .map(|(i, &count)| mesh(context, &format!("{name}{i}"), count))
        .collect();
    crate::Model::new(name, meshes, lifetime, rendered)
}

/// A rendered model with its bottom-level structure built and submitted.
pub fn built_model(
    context: &gpu::capture::Context,
    hub: &Arc<crate::StructureHub>,
    name: &str,
    vertex_counts: &[u32],
    lifetime: crate::Lifetime,
) -> Arc<crate::Model> {
    let model = Arc::new(model(context, name, vertex_counts, lifetime, true));
    let vertex_data = vec![0u8; model.vertex_count() as usize * 12];
    let task = crate::task::ModelBuildTask::new(hub, 0, &model, vertex_data, 12);
    let mut submission = task
        .run(&crate::task::WorkerContext::new(hub.device()))
        .unwrap()
        .unwrap();
    context.submit(&mut submission.encoder).unwrap();
    submission.publish(hub);
    for buffer in submission.temp_buffers {
        context.release_buffer(buffer);
    }
    model
}
