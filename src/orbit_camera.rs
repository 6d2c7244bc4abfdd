//! Mouse-driven orbit controller for the viewer.

use glam::Vec3;
use winit::event::MouseButton;

use crate::camera::Camera;
use crate::input::Input;

const MAX_ELEVATION: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

/// Orbits a target point: right-drag rotates, the wheel zooms.
#[derive(Clone, Debug)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub distance: f32,
    /// Horizontal angle in radians, 0 looking down +Z.
    pub azimuth: f32,
    /// Vertical angle in radians, clamped short of the poles.
    pub elevation: f32,
    pub sensitivity: f32,
    pub zoom_sensitivity: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    /// Lens and clip planes; position and orientation are overwritten.
    pub lens: Camera,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            distance: 8.0,
            azimuth: 0.6,
            elevation: 0.4,
            sensitivity: 0.005,
            zoom_sensitivity: 0.5,
            min_distance: 0.5,
            max_distance: 200.0,
            lens: Camera::new().with_clip_planes(0.1, 200.0),
        }
    }
}

impl OrbitCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<Vec3>) -> Self {
        self.target = target.into();
        self
    }

    pub fn distance(mut self, distance: f32) -> Self {
        self.distance = distance.clamp(self.min_distance, self.max_distance);
        self
    }

    pub fn update(&mut self, input: &Input) {
        if input.mouse_down(MouseButton::Right) {
            let delta = input.cursor_delta();
            self.azimuth -= delta.x * self.sensitivity;
            self.elevation = (self.elevation + delta.y * self.sensitivity)
                .clamp(-MAX_ELEVATION, MAX_ELEVATION);
        }
        let scroll = input.scroll();
        if scroll != 0.0 {
            self.distance =
                (self.distance - scroll * self.zoom_sensitivity).clamp(self.min_distance, self.max_distance);
        }
    }

    pub fn camera(&self, aspect: f32) -> Camera {
        // The camera sits on the far side of the target from its view direction.
        let offset = -Vec3::new(
            self.elevation.cos() * self.azimuth.sin(),
            -self.elevation.sin(),
            self.elevation.cos() * self.azimuth.cos(),
        ) * self.distance;
        self.lens
            .at(self.target + offset)
            .looking_at(self.target)
            .with_aspect(aspect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_looks_at_the_target_from_distance() {
        let orbit = OrbitCamera::new().target([1.0, 0.0, 2.0]).distance(5.0);
        let camera = orbit.camera(1.5);
        assert!((camera.position.distance(orbit.target) - 5.0).abs() < 1e-4);
        let to_target = (orbit.target - camera.position).normalize();
        assert!(camera.forward.abs_diff_eq(to_target, 1e-5));
        assert!(camera.position.y > orbit.target.y);
        assert_eq!(camera.aspect, 1.5);
    }

    #[test]
    fn distance_is_clamped() {
        let orbit = OrbitCamera::new().distance(1000.0);
        assert_eq!(orbit.distance, orbit.max_distance);
    }
}
