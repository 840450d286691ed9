#![allow(irrefutable_let_patterns, clippy::new_without_default)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod acceleration_structure;
pub mod arena;
mod binding;
mod bottom_level;
pub mod entity;
mod hub;
pub mod model;
mod scene;
pub mod task;
#[cfg(test)]
mod test_util;
mod top_level;
pub mod util;

pub use binding::*;
pub use bottom_level::*;
pub use hub::*;
pub use model::{Lifetime, Mesh, Model, Texture};
pub use scene::*;
pub use top_level::*;

use tessera_graphics as gpu;

/// Binding numbers of the ray-tracing descriptor set.
pub mod bindings {
    pub const ACCELERATION_STRUCTURE: u32 = 0;
    pub const VERTEX_BUFFERS: u32 = 1;
    pub const INDEX_BUFFERS: u32 = 2;
    pub const TEXTURES: u32 = 3;
    pub const MESH_INFO: u32 = 4;
}

/// Tint used by everything that doesn't carry its own color.
pub const WHITE: [f32; 4] = [1.0; 4];

/// Per-mesh record that ray-tracing shaders look up by binding slot.
///
/// One array of these exists per frame image, with a fixed 48-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct MeshInfo {
    pub vertex_slot: u32,
    pub index_slot: u32,
    pub specular_exponent: f32,
    pub specular_intensity: f32,
    pub color_tint: [f32; 4],
    pub light_offset: u32,
    pub pad: [u32; 3],
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] gpu::DeviceError),
    #[error("out of binding slots: {requested} requested, {available} available")]
    BindingsExhausted { requested: u32, available: u32 },
    #[error("top-level structure is full with {capacity} instances")]
    InstanceCapacity { capacity: u32 },
    #[error("invalid acceleration structure configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("model '{model}' doesn't have a bottom-level structure yet")]
    MissingBottomLevel { model: String },
    #[error("vertex payload of {actual} bytes doesn't match {expected} bytes of model '{model}'")]
    PayloadMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
}

#[test]
fn mesh_info_layout() {
    assert_eq!(std::mem::size_of::<MeshInfo>(), 48);
    assert_eq!(std::mem::offset_of!(MeshInfo, color_tint), 16);
    assert_eq!(std::mem::offset_of!(MeshInfo, light_offset), 32);
}
