//! Perspective camera with reversed-Z projection and TAA jitter.
//!
//! Matrices are left-handed (+Z forward, +Y up), matching the engine's world space. The
//! projection maps the near plane to depth 1 and the far plane to depth 0, so the depth
//! buffer clears to 0 and tests with `GreaterEqual`.

use crate::collision::Frustum;
use glam::{Mat4, Vec2, Vec3};

/// A perspective camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    /// Width over height of the render target.
    pub aspect: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, -5.0),
            forward: Vec3::Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_3,
            near: 0.1,
            far: 1000.0,
            aspect: 16.0 / 9.0,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, position: impl Into<Vec3>) -> Self {
        self.position = position.into();
        self
    }

    pub fn looking_at(mut self, target: impl Into<Vec3>) -> Self {
        self.forward = (target.into() - self.position).normalize_or(Vec3::Z);
        self
    }

    pub fn with_fov(mut self, fov_degrees: f32) -> Self {
        self.fov = fov_degrees.to_radians();
        self
    }

    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn with_aspect(mut self, aspect: f32) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn right(&self) -> Vec3 {
        self.up.cross(self.forward).normalize_or(Vec3::X)
    }

    /// Up vector re-orthogonalised against forward and right.
    pub fn orthogonal_up(&self) -> Vec3 {
        self.forward.cross(self.right()).normalize_or(Vec3::Y)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_lh(self.position, self.forward, self.up)
    }

    /// Reversed-Z perspective projection.
    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_lh(self.fov, self.aspect.max(1e-4), self.far, self.near)
    }

    /// The projection shifted by `jitter` in normalised device coordinates.
    pub fn jittered_projection(&self, jitter: Vec2) -> Mat4 {
        let mut proj = self.projection();
        proj.z_axis.x += jitter.x;
        proj.z_axis.y += jitter.y;
        proj
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// World-space view frustum (unjittered).
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(&self.view_projection())
    }

    /// View-space corners of the slice between depths `near` and `far`.
    ///
    /// Order: near plane left-top, right-top, right-bottom, left-bottom, then the same
    /// four on the far plane.
    pub fn slice_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let tan_y = (self.fov * 0.5).tan();
        let tan_x = tan_y * self.aspect;
        let mut corners = [Vec3::ZERO; 8];
        for (i, z) in [near, far].into_iter().enumerate() {
            let (x, y) = (tan_x * z, tan_y * z);
            corners[i * 4] = Vec3::new(-x, y, z);
            corners[i * 4 + 1] = Vec3::new(x, y, z);
            corners[i * 4 + 2] = Vec3::new(x, -y, z);
            corners[i * 4 + 3] = Vec3::new(-x, -y, z);
        }
        corners
    }
}

/// Element `index` of the van der Corput sequence in `base`, in [0, 1).
pub fn halton(mut index: u32, base: u32) -> f32 {
    let mut result = 0.0;
    let mut fraction = 1.0;
    while index > 0 {
        fraction /= base as f32;
        result += fraction * (index % base) as f32;
        index /= base;
    }
    result
}

/// Sub-pixel offset for `frame` in normalised device coordinates, cycling through the first
/// `sample_count` Halton(2, 3) points.
pub fn taa_jitter(frame: u64, sample_count: u32, width: u32, height: u32) -> Vec2 {
    let index = (frame % sample_count.max(1) as u64) as u32 + 1;
    Vec2::new(
        (halton(index, 2) - 0.5) * 2.0 / width.max(1) as f32,
        (halton(index, 3) - 0.5) * 2.0 / height.max(1) as f32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_is_reversed_z() {
        let camera = Camera::new().at(Vec3::ZERO).with_clip_planes(0.5, 100.0);
        let proj = camera.projection();
        let near = proj.project_point3(Vec3::new(0.0, 0.0, 0.5));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, 100.0));
        assert!((near.z - 1.0).abs() < 1e-5);
        assert!(far.z.abs() < 1e-5);
    }

    #[test]
    fn view_looks_down_forward() {
        let camera = Camera::new().at([0.0, 0.0, -5.0]).looking_at(Vec3::ZERO);
        let p = camera.view().transform_point3(Vec3::ZERO);
        assert!((p - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);
        assert!(camera.right().abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn halton_points() {
        assert_eq!(halton(1, 2), 0.5);
        assert_eq!(halton(2, 2), 0.25);
        assert_eq!(halton(3, 2), 0.75);
        assert!((halton(1, 3) - 1.0 / 3.0).abs() < 1e-6);
        assert!((halton(2, 3) - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn jitter_repeats_with_sample_count() {
        let a = taa_jitter(1, 8, 1920, 1080);
        assert_eq!(a, taa_jitter(9, 8, 1920, 1080));
        assert_ne!(a, taa_jitter(2, 8, 1920, 1080));
        assert!(a.x.abs() <= 1.0 / 1920.0 && a.y.abs() <= 1.0 / 1080.0);
    }

    #[test]
    fn slice_corners_project_to_screen_corners() {
        let camera = Camera::new().at(Vec3::ZERO);
        let corners = camera.slice_corners(1.0, 10.0);
        let proj = camera.projection();
        let lt = proj.project_point3(corners[0]);
        let rb = proj.project_point3(corners[6]);
        assert!((lt.x + 1.0).abs() < 1e-4 && (lt.y - 1.0).abs() < 1e-4);
        assert!((rb.x - 1.0).abs() < 1e-4 && (rb.y + 1.0).abs() < 1e-4);
    }
}
