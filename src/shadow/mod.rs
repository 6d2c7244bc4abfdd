//! Cascaded shadow maps for one directional light.
//!
//! Each frame, [`CascadedShadowManager::update_frame`] splits the camera's depth range into
//! `cascade_levels` intervals and fits an orthographic light projection around each one:
//!
//! 1. Interval `i` ends at `partitions[i]` of the shadowed depth range and starts at the
//!    previous interval's end ([`CascadeFit::ToCascade`]) or the near plane
//!    ([`CascadeFit::ToScene`]).
//! 2. The interval's sub-frustum is moved into light space and bounded.
//! 3. Optionally the footprint is padded to a rotation-independent size.
//! 4. It is padded by the PCF kernel's border.
//! 5. Optionally it is snapped to whole texels so the map does not shimmer as the camera
//!    moves.
//! 6. Near and far come from the selected [`NearFarFit`].
//! 7. The projection, its source box and the interval end are stored per cascade.
//!
//! The manager also owns the shadow textures: a depth array with one slice per cascade,
//! and for filterable techniques a moments array plus a blur scratch target.

pub mod cascade;

use crate::camera::Camera;
use crate::collision::Aabb;
use crate::config::{CascadeFit, MAX_CASCADES, NearFarFit, ShadowConfig, ShadowType, partitions_are_valid};
use crate::device::{RenderBackend, Viewport};
use crate::error::EngineError;
use crate::resources::{Depth2DArray, Texture2D, Texture2DArray};
use cascade::{
    ZERO_ONE_FAR, ZERO_ONE_NEAR, compute_near_far, fix_footprint_size, pad_for_kernel,
    scene_in_light_space, snap_to_texels, texture_scale_offset, widen_degenerate,
};
use glam::{Mat4, Vec3, Vec4};

/// Moments format per filterable technique.
pub fn moments_format(technique: ShadowType) -> Option<wgpu::TextureFormat> {
    match technique {
        ShadowType::Hard => None,
        ShadowType::Esm => Some(wgpu::TextureFormat::R32Float),
        ShadowType::Vsm | ShadowType::Evsm2 => Some(wgpu::TextureFormat::Rg32Float),
        ShadowType::Evsm4 => Some(wgpu::TextureFormat::Rgba32Float),
    }
}

/// A view matrix looking along `direction`, placed so the whole scene lies in front of it.
pub fn light_view_matrix(direction: Vec3, scene: &Aabb) -> Mat4 {
    let direction = direction.normalize_or(Vec3::NEG_Y);
    let up = if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let (center, radius) = if scene.is_empty() {
        (Vec3::ZERO, 1.0)
    } else {
        (scene.center(), scene.extents().length().max(1.0))
    };
    Mat4::look_to_lh(center - direction * radius * 2.0, direction, up)
}

/// Shadow textures, recreated whenever their size, count or technique changes.
#[derive(Debug)]
pub struct ShadowResources {
    pub depth: Depth2DArray,
    pub moments: Option<Texture2DArray>,
    pub blur_scratch: Option<Texture2D>,
    size: u32,
    levels: u32,
    technique: ShadowType,
}

impl ShadowResources {
    fn matches(&self, config: &ShadowConfig) -> bool {
        self.size == config.shadow_size
            && self.levels == config.cascade_levels as u32
            && moments_format(self.technique) == moments_format(config.technique)
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.depth.release(backend);
        if let Some(moments) = self.moments.as_mut() {
            moments.release(backend);
        }
        if let Some(scratch) = self.blur_scratch.as_mut() {
            scratch.release(backend);
        }
    }
}

/// Fits and stores the per-cascade light projections.
#[derive(Debug)]
pub struct CascadedShadowManager {
    config: ShadowConfig,
    /// Light view matrix of the last update.
    pub shadow_view: Mat4,
    /// Orthographic projection per cascade.
    pub shadow_proj: [Mat4; MAX_CASCADES],
    /// Light-space box each projection was built from.
    pub shadow_proj_bounding_box: [Aabb; MAX_CASCADES],
    /// View-space depth at which each cascade ends.
    pub cascade_partitions_frustum: [f32; MAX_CASCADES],
    resources: Option<ShadowResources>,
}

impl CascadedShadowManager {
    pub fn new(mut config: ShadowConfig) -> Self {
        sanitize(&mut config);
        Self {
            config,
            shadow_view: Mat4::IDENTITY,
            shadow_proj: [Mat4::IDENTITY; MAX_CASCADES],
            shadow_proj_bounding_box: [Aabb::EMPTY; MAX_CASCADES],
            cascade_partitions_frustum: [0.0; MAX_CASCADES],
            resources: None,
        }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    pub fn cascade_levels(&self) -> usize {
        self.config.cascade_levels
    }

    pub fn technique(&self) -> ShadowType {
        self.config.technique
    }

    /// Replaces the whole configuration. Textures are recreated on the next
    /// [`init_resources`](Self::init_resources) if their shape changed.
    pub fn set_config(&mut self, mut config: ShadowConfig) {
        sanitize(&mut config);
        self.config = config;
    }

    /// Sets the cascade ends. Rejected unless the first `cascade_levels` values strictly
    /// increase within (0, 1].
    pub fn set_partitions(&mut self, partitions: &[f32]) -> bool {
        if !partitions_are_valid(partitions, self.config.cascade_levels) {
            log::warn!("Rejected cascade partitions {:?}", partitions);
            return false;
        }
        self.config.partitions = partitions[..self.config.cascade_levels].to_vec();
        true
    }

    /// Changes the cascade count (clamped to 1..=8), regenerating partitions when the
    /// current ones no longer fit.
    pub fn set_cascade_levels(&mut self, levels: usize) {
        self.config.cascade_levels = levels.clamp(1, MAX_CASCADES);
        sanitize(&mut self.config);
    }

    pub fn set_technique(&mut self, technique: ShadowType) {
        self.config.technique = technique;
    }

    pub fn set_shadow_size(&mut self, size: u32) {
        self.config.shadow_size = size.clamp(128, 8192);
    }

    /// Fits every cascade for this frame.
    pub fn update_frame(&mut self, camera: &Camera, light_view: &Mat4, scene: &Aabb) {
        let config = &self.config;
        let levels = config.cascade_levels;
        self.shadow_view = *light_view;

        let camera_to_light = *light_view * camera.view().inverse();
        let scene_points = scene_in_light_space(scene, light_view);
        let scene_z = Aabb::from_points(scene_points);
        let near = camera.near;
        let range = (camera.far.min(config.max_distance) - near).max(f32::EPSILON);

        let mut previous_end = near;
        for i in 0..levels {
            let begin = match config.cascade_fit {
                CascadeFit::ToCascade => previous_end,
                CascadeFit::ToScene => near,
            };
            let end = near + config.partitions[i] * range;
            previous_end = end;

            let corners = camera
                .slice_corners(begin, end)
                .map(|c| camera_to_light.transform_point3(c));
            let bounds = Aabb::from_points(corners);
            let (mut min, mut max) = (bounds.min, bounds.max);

            if config.fixed_size_frustum_aabb {
                fix_footprint_size(&mut min, &mut max, &corners);
            }
            pad_for_kernel(&mut min, &mut max, config.pcf_kernel_size, config.shadow_size);
            if config.move_light_texel_size {
                snap_to_texels(&mut min, &mut max, config.shadow_size);
            }

            let cascade_range = (min.z, max.z);
            let (near_plane, far_plane) = match config.near_far_fit {
                NearFarFit::ZeroOne => (ZERO_ONE_NEAR, ZERO_ONE_FAR),
                NearFarFit::CascadeAabb => cascade_range,
                NearFarFit::SceneAabb if !scene.is_empty() => (scene_z.min.z, scene_z.max.z),
                NearFarFit::SceneAabbIntersection if !scene.is_empty() => {
                    compute_near_far(min, max, &scene_points)
                        .map(|(n, f)| (n.max(min.z), f.min(max.z)))
                        .filter(|(n, f)| n <= f)
                        .unwrap_or(cascade_range)
                }
                _ => cascade_range,
            };
            let (near_plane, far_plane) = widen_degenerate(near_plane, far_plane);

            self.shadow_proj[i] =
                Mat4::orthographic_lh(min.x, max.x, min.y, max.y, near_plane, far_plane);
            self.shadow_proj_bounding_box[i] = Aabb::new(
                Vec3::new(min.x, min.y, near_plane),
                Vec3::new(max.x, max.y, far_plane),
            );
            self.cascade_partitions_frustum[i] = end;
        }
        for i in levels..MAX_CASCADES {
            self.cascade_partitions_frustum[i] = self.cascade_partitions_frustum[levels - 1];
        }
    }

    /// Light view-projection of one cascade.
    pub fn cascade_view_proj(&self, cascade: usize) -> Mat4 {
        self.shadow_proj[cascade.min(MAX_CASCADES - 1)] * self.shadow_view
    }

    /// Per-cascade scale and offset from light view space to shadow texture space.
    pub fn cascade_scale_offsets(&self) -> ([Vec4; MAX_CASCADES], [Vec4; MAX_CASCADES]) {
        let mut scales = [Vec4::ZERO; MAX_CASCADES];
        let mut offsets = [Vec4::ZERO; MAX_CASCADES];
        for i in 0..self.config.cascade_levels {
            (scales[i], offsets[i]) = texture_scale_offset(&self.shadow_proj[i]);
        }
        (scales, offsets)
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.config.shadow_size as f32, self.config.shadow_size as f32)
    }

    /// Creates (or recreates) the shadow textures to match the configuration.
    pub fn init_resources(&mut self, backend: &mut dyn RenderBackend) -> Result<(), EngineError> {
        if let Some(resources) = self.resources.as_mut() {
            if resources.matches(&self.config) {
                resources.technique = self.config.technique;
                return Ok(());
            }
        }
        self.release(backend);

        let size = self.config.shadow_size;
        let levels = self.config.cascade_levels as u32;
        let depth = Depth2DArray::new(backend, "Shadow Depth", size, size, levels)?;
        let mut resources = ShadowResources {
            depth,
            moments: None,
            blur_scratch: None,
            size,
            levels,
            technique: self.config.technique,
        };
        if let Some(format) = moments_format(self.config.technique) {
            let built = Texture2DArray::new(
                backend,
                "Shadow Moments",
                size,
                size,
                levels,
                format,
                1,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
            .and_then(|moments| {
                resources.moments = Some(moments);
                Texture2D::render_target(backend, "Shadow Blur", size, size, format)
            });
            match built {
                Ok(scratch) => resources.blur_scratch = Some(scratch),
                Err(e) => {
                    resources.release(backend);
                    return Err(e);
                }
            }
        }
        log::info!(
            "Shadow maps: {} cascades of {}x{} ({:?})",
            levels,
            size,
            size,
            self.config.technique
        );
        self.resources = Some(resources);
        Ok(())
    }

    pub fn resources(&self) -> Option<&ShadowResources> {
        self.resources.as_ref()
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(mut resources) = self.resources.take() {
            resources.release(backend);
        }
    }
}

fn sanitize(config: &mut ShadowConfig) {
    config.cascade_levels = config.cascade_levels.clamp(1, MAX_CASCADES);
    if !partitions_are_valid(&config.partitions, config.cascade_levels) {
        config.partitions = crate::config::default_partitions(config.cascade_levels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_partitions;
    use crate::device::RecordingBackend;
    use glam::Vec2;

    fn camera() -> Camera {
        Camera::new()
            .at([3.0, 4.0, -12.0])
            .looking_at([0.0, 0.0, 0.0])
            .with_clip_planes(0.5, 100.0)
            .with_aspect(1.5)
    }

    fn scene() -> Aabb {
        Aabb::new(Vec3::new(-20.0, -1.0, -20.0), Vec3::new(20.0, 6.0, 20.0))
    }

    fn light_view(scene: &Aabb) -> Mat4 {
        light_view_matrix(Vec3::new(0.4, -1.0, 0.3), scene)
    }

    #[test]
    fn partitions_are_monotonic_for_every_fit() {
        let scene = scene();
        let partitions = [
            default_partitions(4),
            vec![0.1, 0.2, 0.5, 1.0],
            vec![0.25, 0.5, 0.75, 1.0],
            vec![0.9, 0.95, 0.99, 1.0],
        ];
        for fit in [CascadeFit::ToCascade, CascadeFit::ToScene] {
            for p in &partitions {
                let mut manager = CascadedShadowManager::new(ShadowConfig {
                    cascade_fit: fit,
                    partitions: p.clone(),
                    ..Default::default()
                });
                manager.update_frame(&camera(), &light_view(&scene), &scene);
                let ends = manager.cascade_partitions_frustum;
                assert!(ends.windows(2).all(|w| w[0] <= w[1]), "{:?}", ends);
                assert!((ends[3] - 100.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn intersection_fit_stays_within_cascade_box_fit() {
        let scene = scene();
        let view = light_view(&scene);
        let mut tight = CascadedShadowManager::new(ShadowConfig::default());
        let mut cascade_box = CascadedShadowManager::new(ShadowConfig {
            near_far_fit: NearFarFit::CascadeAabb,
            ..Default::default()
        });
        tight.update_frame(&camera(), &view, &scene);
        cascade_box.update_frame(&camera(), &view, &scene);
        for i in 0..4 {
            let (t, c) = (tight.shadow_proj_bounding_box[i], cascade_box.shadow_proj_bounding_box[i]);
            assert!(t.min.z <= t.max.z);
            assert!(
                t.min.z >= c.min.z - 1e-3 && t.max.z <= c.max.z + 1e-3,
                "cascade {}: [{}, {}] outside [{}, {}]",
                i,
                t.min.z,
                t.max.z,
                c.min.z,
                c.max.z
            );
        }
    }

    #[test]
    fn fixed_footprint_ignores_camera_rotation() {
        let scene = scene();
        let view = light_view(&scene);
        let mut sizes: Vec<Vec<Vec2>> = Vec::new();
        for yaw in [0.0f32, 0.5, 1.2, 2.0] {
            let cam = camera().looking_at(Vec3::new(yaw.sin(), -0.2, yaw.cos()) * 10.0 + camera().position);
            let mut manager = CascadedShadowManager::new(ShadowConfig {
                fixed_size_frustum_aabb: true,
                move_light_texel_size: false,
                ..Default::default()
            });
            manager.update_frame(&cam, &view, &scene);
            sizes.push(
                manager.shadow_proj_bounding_box[..4]
                    .iter()
                    .map(|b| (b.max - b.min).truncate())
                    .collect(),
            );
        }
        for other in &sizes[1..] {
            for (a, b) in sizes[0].iter().zip(other) {
                assert!(a.abs_diff_eq(*b, 1e-3), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn cascades_cover_their_sub_frustum() {
        let scene = scene();
        let view = light_view(&scene);
        let cam = camera();
        let mut manager = CascadedShadowManager::new(ShadowConfig {
            near_far_fit: NearFarFit::CascadeAabb,
            ..Default::default()
        });
        manager.update_frame(&cam, &view, &scene);
        let to_light = view * cam.view().inverse();
        let mut begin = cam.near;
        for i in 0..4 {
            let end = manager.cascade_partitions_frustum[i];
            let bounds = manager.shadow_proj_bounding_box[i];
            for corner in cam.slice_corners(begin, end) {
                let p = to_light.transform_point3(corner);
                assert!(p.x >= bounds.min.x - 1e-3 && p.x <= bounds.max.x + 1e-3);
                assert!(p.y >= bounds.min.y - 1e-3 && p.y <= bounds.max.y + 1e-3);
            }
            begin = end;
        }
    }

    #[test]
    fn empty_or_flat_scene_never_yields_singular_projection() {
        let cam = camera();
        for scene in [Aabb::EMPTY, Aabb::new(Vec3::ZERO, Vec3::new(5.0, 0.0, 5.0))] {
            let mut manager = CascadedShadowManager::new(ShadowConfig {
                near_far_fit: NearFarFit::SceneAabb,
                ..Default::default()
            });
            manager.update_frame(&cam, &light_view_matrix(Vec3::NEG_Y, &scene), &scene);
            for proj in &manager.shadow_proj[..4] {
                assert!(proj.determinant().abs() > 0.0);
                assert!(proj.is_finite());
            }
        }
    }

    #[test]
    fn invalid_partitions_are_rejected() {
        let mut manager = CascadedShadowManager::new(ShadowConfig::default());
        assert!(!manager.set_partitions(&[0.5, 0.4, 0.8, 1.0]));
        assert!(manager.set_partitions(&[0.1, 0.3, 0.6, 1.0]));
        assert_eq!(manager.config().partitions, vec![0.1, 0.3, 0.6, 1.0]);
        manager.set_cascade_levels(20);
        assert_eq!(manager.cascade_levels(), MAX_CASCADES);
        assert_eq!(manager.config().partitions.len(), MAX_CASCADES);
    }

    #[test]
    fn resources_follow_the_technique() {
        let mut backend = RecordingBackend::new();
        let mut manager = CascadedShadowManager::new(ShadowConfig::default());
        manager.init_resources(&mut backend).unwrap();
        assert!(manager.resources().unwrap().moments.is_none());
        assert_eq!(backend.live_textures(), 1);

        manager.set_technique(ShadowType::Evsm4);
        manager.init_resources(&mut backend).unwrap();
        let resources = manager.resources().unwrap();
        let moments = resources.moments.as_ref().unwrap();
        assert_eq!(moments.format(), wgpu::TextureFormat::Rgba32Float);
        assert_eq!(moments.layers(), 4);
        assert_eq!(backend.live_textures(), 3);

        manager.release(&mut backend);
        assert_eq!(backend.live_textures(), 0);
    }
}
