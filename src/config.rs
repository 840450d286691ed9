use std::{fs, path::Path};

fn default_frame_count() -> usize {
    2
}
fn default_max_bindings() -> u32 {
    1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, serde::Deserialize)]
pub struct Engine {
    /// Number of frame images kept in flight.
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
    /// Worker threads. Picked from the CPU count when missing.
    #[serde(default)]
    pub worker_count: Option<usize>,
    /// Capacity of every binding array, and of each top-level structure.
    #[serde(default = "default_max_bindings")]
    pub max_bindings: u32,
    #[serde(default = "default_true")]
    pub ray_tracing: bool,
    /// Refit the scene structures in place when only transforms change.
    #[serde(default = "default_true")]
    pub updateable_scene: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            frame_count: default_frame_count(),
            worker_count: None,
            max_bindings: default_max_bindings(),
            ray_tracing: true,
            updateable_scene: true,
        }
    }
}

impl Engine {
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::de::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let bytes = fs::read(path)?;
        Ok(ron::de::from_bytes(&bytes)?)
    }
}

fn default_vec() -> mint::Vector3<f32> {
    [0.0; 3].into()
}
fn default_scale() -> f32 {
    1.0
}

/// Placement of an object in the scene.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct Placement {
    #[serde(default = "default_vec")]
    pub pos: mint::Vector3<f32>,
    /// Euler angles, in degrees.
    #[serde(default = "default_vec")]
    pub rot: mint::Vector3<f32>,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            pos: default_vec(),
            rot: default_vec(),
            scale: default_scale(),
        }
    }
}

impl Placement {
    pub fn to_transform(&self) -> tessera_graphics::Transform {
        let rot = glam::Vec3::from(self.rot);
        let affine = glam::Affine3A::from_scale_rotation_translation(
            glam::Vec3::splat(self.scale),
            glam::Quat::from_euler(
                glam::EulerRot::XYZ,
                rot.x.to_radians(),
                rot.y.to_radians(),
                rot.z.to_radians(),
            ),
            self.pos.into(),
        );
        crate::transform_from_affine(&affine)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn defaults_fill_the_gaps() {
        let config = super::Engine::from_ron("(max_bindings: 64)").unwrap();
        assert_eq!(config.max_bindings, 64);
        assert_eq!(config.frame_count, 2);
        assert_eq!(config.worker_count, None);
        assert!(config.ray_tracing && config.updateable_scene);
    }

    #[test]
    fn placement_translates() {
        let placement: super::Placement = ron::de::from_str("(pos: (x: 1.0, y: 2.0, z: 3.0))").unwrap();
        let transform = placement.to_transform();
        assert_eq!([transform.x.w, transform.y.w, transform.z.w], [1.0, 2.0, 3.0]);
        assert_eq!([transform.x.x, transform.y.y, transform.z.z], [1.0; 3]);
        assert_eq!(transform.x.y, 0.0);
    }

    #[test]
    fn broken_text_is_an_error() {
        assert!(super::Engine::from_ron("(frame_count: \"two\")").is_err());
    }
}
