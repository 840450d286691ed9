use std::sync::Arc;
use tessera_graphics::{self as gpu, MemoryManager as _};
use tessera_render as render;

const STRIDE: u32 = 12;

fn engine(config: &str) -> (Arc<gpu::capture::Context>, tessera::Engine) {
    let _ = env_logger::try_init();
    let context = Arc::new(gpu::capture::Context::new());
    let device: Arc<dyn gpu::Device> = context.clone();
    let config = tessera::config::Engine::from_ron(config).unwrap();
    let engine = tessera::Engine::new(&device, &config).unwrap();
    (context, engine)
}

fn create_model(
    engine: &mut tessera::Engine,
    name: &str,
    vertex_counts: &[u32],
    lifetime: render::Lifetime,
) -> Arc<render::Model> {
    let meshes = vertex_counts
        .iter()
        .map(|&vertex_count| render::model::MeshDesc {
            name,
            vertex_count,
            vertex_stride: STRIDE,
            texture: render::Texture::default(),
            transparent: false,
        })
        .collect();
    engine.create_model(name, meshes, lifetime, true).unwrap()
}

fn vertices(model: &render::Model) -> Vec<u8> {
    (0..model.vertex_count() * STRIDE).map(|i| i as u8).collect()
}

fn frame(engine: &mut tessera::Engine) -> usize {
    let image_index = engine.begin_frame().unwrap();
    engine.end_frame().unwrap();
    image_index
}

fn translation(x: f32, y: f32, z: f32) -> gpu::Transform {
    tessera::transform_from_affine(&glam::Affine3A::from_translation(glam::Vec3::new(x, y, z)))
}

#[test]
fn loaded_models_reach_the_scene() {
    let (context, mut engine) = engine("(frame_count: 2, worker_count: Some(2), max_bindings: 32)");
    let model = create_model(&mut engine, "crate", &[3], render::Lifetime::Short);
    let data = vertices(&model);
    engine.load_model(&model, data.clone(), STRIDE);
    engine.wait_idle().unwrap();
    assert_eq!(engine.pending_loads(), 0);

    let object = engine
        .add_object("crate", &model, gpu::IDENTITY_TRANSFORM.into())
        .unwrap();
    assert_eq!(engine.object_instances(object), &[0]);
    assert_eq!(frame(&mut engine), 0);

    let names = context
        .submissions()
        .into_iter()
        .map(|s| s.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["build crate", "main"]);
    assert_eq!(context.read_buffer(model.meshes[0].vertex_buffer), data);

    let blas = engine.hub().model_bottom_level(&model).unwrap();
    let layer = engine.scene().layer(0);
    assert_eq!(layer.state(), render::TopLevelState::Clean);
    let info = context.structure(layer.structure().unwrap().raw()).unwrap();
    assert_eq!(info.instances.len(), 1);
    assert_eq!(info.instances[0].acceleration_structure_reference, blas.reference().0);
    assert_eq!(engine.scene().layer(1).state(), render::TopLevelState::Empty);

    assert_eq!(frame(&mut engine), 1);
    assert_eq!(engine.scene().layer(1).state(), render::TopLevelState::Clean);

    // the staging buffer lives until its image comes around again
    let before = context.buffer_count();
    engine.begin_frame().unwrap();
    assert_eq!(context.buffer_count(), before - 1);
    engine.end_frame().unwrap();

    drop(blas);
    engine.destroy();
    assert_eq!(context.buffer_count(), 0);
    assert_eq!(context.memory_allocation_count(), 0);
    assert_eq!(context.structure_count(), 0);
}

#[test]
fn empty_payload_is_skipped() {
    let (context, mut engine) = engine("(frame_count: 2, worker_count: Some(1), max_bindings: 32)");
    let model = create_model(&mut engine, "ghost", &[3], render::Lifetime::Short);
    engine.load_model(&model, Vec::new(), STRIDE);
    engine.wait_idle().unwrap();
    frame(&mut engine);
    assert_eq!(context.submission_count(), 1);
    assert!(model.bottom_level().is_none());
    assert!(matches!(
        engine.add_object("ghost", &model, gpu::IDENTITY_TRANSFORM.into()),
        Err(tessera::Error::Render(render::Error::MissingBottomLevel { .. }))
    ));
    engine.destroy();
}

#[test]
fn failed_loads_end_the_session() {
    let (_context, mut engine) = engine("(frame_count: 2, worker_count: Some(1), max_bindings: 32)");
    let model = create_model(&mut engine, "broken", &[3], render::Lifetime::Short);
    engine.load_model(&model, vec![0; 7], STRIDE);
    engine.wait_idle().unwrap();
    assert!(matches!(
        engine.begin_frame(),
        Err(tessera::Error::Render(render::Error::PayloadMismatch {
            expected: 36,
            actual: 7,
            ..
        }))
    ));
}

#[test]
fn moving_objects_refits_the_scene() {
    let (context, mut engine) = engine("(frame_count: 1, worker_count: Some(1), max_bindings: 32)");
    let model = create_model(&mut engine, "ball", &[3], render::Lifetime::Short);
    engine.load_model(&model, vertices(&model), STRIDE);
    engine.wait_idle().unwrap();
    let object = engine
        .add_object("ball", &model, gpu::IDENTITY_TRANSFORM.into())
        .unwrap();
    frame(&mut engine);

    engine.set_transform(object, translation(0.0, 5.0, 0.0));
    frame(&mut engine);
    let layer = engine.scene().layer(0);
    let info = context.structure(layer.structure().unwrap().raw()).unwrap();
    assert_eq!(info.update_count, 1);
    assert_eq!(info.instances[0].transform[7], 5.0);

    // nothing changed, nothing recorded
    let before = context.structure(layer.structure().unwrap().raw()).unwrap();
    frame(&mut engine);
    let after = context.structure(engine.scene().layer(0).structure().unwrap().raw()).unwrap();
    assert_eq!(before.build_count, after.build_count);
    assert_eq!(before.update_count, after.update_count);
    engine.destroy();
}

#[test]
fn long_lived_models_share_their_slots() {
    let (context, mut engine) = engine("(frame_count: 2, worker_count: Some(2), max_bindings: 32)");
    let rock = create_model(&mut engine, "rock", &[3, 3], render::Lifetime::Long);
    let spark = create_model(&mut engine, "spark", &[3], render::Lifetime::Short);
    engine.load_model(&rock, vertices(&rock), STRIDE);
    engine.load_model(&spark, vertices(&spark), STRIDE);
    engine.wait_idle().unwrap();
    assert_eq!(engine.hub().registry().slot_count(), 2);

    let a = engine
        .add_object("rock-a", &rock, gpu::IDENTITY_TRANSFORM.into())
        .unwrap();
    let b = engine
        .add_object("rock-b", &rock, translation(1.0, 0.0, 0.0))
        .unwrap();
    let color = [1.0, 0.25, 0.0, 1.0];
    let p = engine
        .add_particle("ember", &spark, color, translation(0.0, 1.0, 0.0))
        .unwrap();
    assert_eq!(engine.object_name(p), "ember");
    assert_eq!(engine.hub().registry().slot_count(), 3);

    frame(&mut engine);
    let layer = engine.scene().layer(0);
    let info = context.structure(layer.structure().unwrap().raw()).unwrap();
    let custom = |handle| info.instances[engine.object_instances(handle)[0] as usize].custom_index();
    assert_eq!(custom(a), 0);
    assert_eq!(custom(b), 0);
    assert_eq!(custom(p), 2);
    for image_index in 0..2 {
        assert_eq!(engine.hub().registry().read_mesh_info(image_index, 2).color_tint, color);
    }
    engine.destroy();
}

#[test]
fn deformables_refit_the_current_image() {
    let (context, mut engine) = engine("(frame_count: 2, worker_count: Some(1), max_bindings: 32)");
    let body = create_model(&mut engine, "body", &[3], render::Lifetime::Long);
    let vertex_buffers = (0..2)
        .map(|i| {
            context
                .get_buffer(gpu::BufferDesc {
                    name: &format!("skinned {}", i),
                    size: 3 * STRIDE as u64,
                    usage: gpu::BufferUsage::STORAGE | gpu::BufferUsage::RAY_TRACING,
                    memory: gpu::Memory::Device,
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    let handle = engine
        .add_deformable(
            "guard",
            vec![(Arc::clone(&body), vec![vertex_buffers.clone()])],
            STRIDE,
            gpu::IDENTITY_TRANSFORM.into(),
        )
        .unwrap();
    assert_eq!(engine.object_instances(handle).len(), 1);

    assert_eq!(frame(&mut engine), 0);
    let raw = |engine: &tessera::Engine, image_index| {
        let entity = engine.deformable(handle).unwrap();
        let blas = engine
            .hub()
            .bottom_level(entity.bottom_level(0, image_index).unwrap())
            .unwrap();
        blas.structure().raw()
    };
    assert_eq!(context.structure(raw(&engine, 0)).unwrap().update_count, 1);
    assert_eq!(context.structure(raw(&engine, 1)).unwrap().update_count, 0);

    engine.destroy();
    for buffer in vertex_buffers {
        context.release_buffer(buffer);
    }
    assert_eq!(context.buffer_count(), 0);
}

#[test]
fn moves_reach_images_built_later() {
    let (context, mut engine) = engine("(frame_count: 2, worker_count: Some(1), max_bindings: 32)");
    let model = create_model(&mut engine, "ball", &[3], render::Lifetime::Short);
    engine.load_model(&model, vertices(&model), STRIDE);
    engine.wait_idle().unwrap();
    let object = engine
        .add_object("ball", &model, gpu::IDENTITY_TRANSFORM.into())
        .unwrap();
    assert_eq!(frame(&mut engine), 0);
    engine.set_transform(object, translation(0.0, 5.0, 0.0));
    for _ in 0..4 {
        frame(&mut engine);
    }
    for image_index in 0..2 {
        let layer = engine.scene().layer(image_index);
        let info = context.structure(layer.structure().unwrap().raw()).unwrap();
        assert_eq!(info.instances[0].transform[7], 5.0, "image {}", image_index);
    }
    engine.destroy();
}

#[test]
fn models_wait_for_their_submission() {
    let (_context, mut engine) = engine("(frame_count: 2, worker_count: Some(1), max_bindings: 32)");
    let model = create_model(&mut engine, "late", &[3], render::Lifetime::Short);
    engine.load_model(&model, vertices(&model), STRIDE);
    while engine.pending_loads() != 0 {
        std::thread::yield_now();
    }
    // done on the worker, but not handed to the device yet
    assert!(model.bottom_level().is_none());
    engine.wait_idle().unwrap();
    assert!(model.bottom_level().is_some());
    engine.destroy();
}

#[test]
fn oversized_binding_capacity_is_rejected() {
    let context = Arc::new(gpu::capture::Context::new());
    let device: Arc<dyn gpu::Device> = context;
    let config = tessera::config::Engine::from_ron("(max_bindings: 16777217)").unwrap();
    assert!(matches!(
        tessera::Engine::new(&device, &config),
        Err(tessera::Error::Render(render::Error::InvalidConfiguration(_)))
    ));
}

#[test]
fn zero_frame_images_are_rejected() {
    let context = Arc::new(gpu::capture::Context::new());
    let device: Arc<dyn gpu::Device> = context;
    let config = tessera::config::Engine::from_ron("(frame_count: 0)").unwrap();
    assert!(matches!(
        tessera::Engine::new(&device, &config),
        Err(tessera::Error::Render(render::Error::InvalidConfiguration(_)))
    ));
}
