//! Components attached to scene entities.

use crate::assets::{CubeHandle, ModelHandle};
use crate::camera::Camera;
use glam::{Mat4, Quat, Vec3};

/// Position, rotation and scale of an entity.
///
/// ```
/// use umbra::scene::Transform;
/// use glam::{Quat, Vec3};
///
/// let transform = Transform::from_position(Vec3::new(0.0, 2.0, 0.0))
///     .rotation(Quat::from_rotation_y(0.5))
///     .uniform_scale(2.0);
/// assert_eq!(transform.matrix().w_axis.y, 2.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    /// Unit quaternion.
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    /// Rotates the transform so +Z points at `target`.
    pub fn looking_at(mut self, target: Vec3) -> Self {
        let forward = (target - self.position).normalize_or(Vec3::Z);
        self.rotation = Quat::from_rotation_arc(Vec3::Z, forward);
        self
    }

    /// Local-to-world matrix: scale, then rotate, then translate.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// World-space +Z of the entity.
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }
}

/// Display name of an entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagComponent {
    pub name: String,
}

impl TagComponent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A model drawn at the entity's transform.
///
/// The visibility fields are outputs of
/// [`SceneGraph::frustum_culling`](super::SceneGraph::frustum_culling); they are
/// overwritten on every call.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticMeshComponent {
    pub model: ModelHandle,
    /// One flag per sub-mesh of the model.
    pub submodel_in_frustum: Vec<bool>,
    /// True when any sub-mesh is visible.
    pub in_frustum: bool,
}

impl StaticMeshComponent {
    pub fn new(model: ModelHandle) -> Self {
        Self {
            model,
            submodel_in_frustum: Vec::new(),
            in_frustum: false,
        }
    }
}

/// A viewpoint. The entity's transform places and orients it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraComponent {
    /// Vertical field of view in radians.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    /// The camera the renderer draws from.
    pub primary: bool,
}

impl Default for CameraComponent {
    fn default() -> Self {
        Self {
            fov: std::f32::consts::FRAC_PI_3,
            near: 0.1,
            far: 1000.0,
            primary: true,
        }
    }
}

impl CameraComponent {
    /// A [`Camera`] at `transform` for a target with the given aspect ratio.
    pub fn camera(&self, transform: &Transform, aspect: f32) -> Camera {
        Camera {
            position: transform.position,
            forward: transform.forward(),
            up: transform.up(),
            fov: self.fov,
            near: self.near,
            far: self.far,
            aspect,
        }
    }
}

/// A directional light shining along the entity's +Z.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionalLightComponent {
    pub color: Vec3,
    pub intensity: f32,
    pub cast_shadows: bool,
}

impl Default for DirectionalLightComponent {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 3.0,
            cast_shadows: true,
        }
    }
}

/// Environment cube rendered behind the scene and used for image-based lighting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkyboxComponent {
    pub cube: CubeHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_scales_before_rotating() {
        let transform = Transform::new()
            .rotation(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2))
            .scale(Vec3::new(2.0, 1.0, 1.0));
        let p = transform.matrix().transform_point3(Vec3::X);
        assert!(p.abs_diff_eq(Vec3::new(0.0, 0.0, -2.0), 1e-5));
    }

    #[test]
    fn looking_at_points_forward_at_the_target() {
        let transform = Transform::from_position(Vec3::ZERO).looking_at(Vec3::new(0.0, 0.0, -3.0));
        assert!(transform.forward().abs_diff_eq(Vec3::NEG_Z, 1e-5));
    }

    #[test]
    fn camera_follows_the_transform() {
        let transform = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let camera = CameraComponent::default().camera(&transform, 2.0);
        assert_eq!(camera.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(camera.forward, Vec3::Z);
        assert_eq!(camera.aspect, 2.0);
    }
}
