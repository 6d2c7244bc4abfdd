//! The frame pipeline.
//!
//! One [`Renderer`] owns every effect, the G-buffer and the intermediate targets, and
//! runs a fixed pass sequence per camera per frame:
//!
//! ```text
//! frustum culling -> shadow (per cascade) -> G-buffer -> lighting -> TAA resolve or copy
//!     -> skybox composite -> gizmo overlay -> present
//! ```
//!
//! The composited, un-tonemapped result is the view texture ([`Renderer::get_view_srv`]),
//! which an editor can display directly; [`Renderer::present`] tonemaps it onto the
//! swapchain.

pub mod gbuffer;

pub use gbuffer::{GBUFFER_FORMATS, GBufferDefinition};

use crate::assets::{CubeHandle, ModelManager, TextureManager};
use crate::camera::{Camera, taa_jitter};
use crate::config::{RenderConfig, ShadowType};
use crate::device::{RenderBackend, ResourceView, ViewId, Viewport};
use crate::effect::ShaderCompiler;
use crate::effects::{
    DeferredPbrEffect, EffectMaterial, EffectTransform, GBufferDebugMode, GizmosWireEffect,
    IblInputs, PreProcessEffect, PresentEffect, SamplerStates, ShadowEffect,
    SimpleSkyboxEffect, TaaEffect,
};
use crate::error::EngineError;
use crate::resources::Texture2D;
use crate::scene::{
    CameraComponent, DirectionalLightComponent, EditingSystem, Entity, ResolvedLight, SceneGraph,
    SkyboxComponent, StaticMeshComponent, Transform,
};
use crate::shadow::{CascadedShadowManager, light_view_matrix};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::collections::HashMap;

const HDR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const DEBUG_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const SHADOW_DEBUG_SIZE: u32 = 512;

const SELECTION_COLOR: Vec4 = Vec4::new(1.0, 0.8, 0.1, 1.0);
const LIGHT_COLOR: Vec4 = Vec4::new(1.0, 1.0, 0.6, 1.0);
const CASCADE_COLORS: [Vec4; 4] = [
    Vec4::new(1.0, 0.2, 0.2, 1.0),
    Vec4::new(0.2, 1.0, 0.2, 1.0),
    Vec4::new(0.2, 0.4, 1.0, 1.0),
    Vec4::new(1.0, 0.2, 1.0, 1.0),
];

/// Camera state of the frame being rendered.
#[derive(Clone, Copy, Debug)]
struct FrameCamera {
    camera: Camera,
    view: Mat4,
    jittered_proj: Mat4,
    view_proj: Mat4,
    jitter: Vec2,
}

/// Screen-sized targets outside the G-buffer.
#[derive(Debug)]
struct FrameTargets {
    lit: Texture2D,
    taa_output: Texture2D,
    history: Texture2D,
    view: Texture2D,
    gbuffer_debug: Texture2D,
}

impl FrameTargets {
    fn new(backend: &mut dyn RenderBackend, width: u32, height: u32) -> Result<Self, EngineError> {
        Ok(Self {
            lit: Texture2D::render_target(backend, "Lit", width, height, HDR_FORMAT)?,
            taa_output: Texture2D::render_target(backend, "TAA Output", width, height, HDR_FORMAT)?,
            history: Texture2D::render_target(backend, "TAA History", width, height, HDR_FORMAT)?,
            view: Texture2D::render_target(backend, "View", width, height, HDR_FORMAT)?,
            gbuffer_debug: Texture2D::render_target(backend, "GBuffer Debug", width, height, DEBUG_FORMAT)?,
        })
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        for texture in [
            &mut self.lit,
            &mut self.taa_output,
            &mut self.history,
            &mut self.view,
            &mut self.gbuffer_debug,
        ] {
            texture.release(backend);
        }
    }
}

/// What the debug targets show, if anything.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DebugViews {
    pub gbuffer: Option<GBufferDebugMode>,
    /// Cascade whose depth slice is drawn into the shadow debug target.
    pub shadow_cascade: Option<usize>,
    pub cascade_frusta: bool,
}

/// The deferred renderer.
#[derive(Debug)]
pub struct Renderer {
    config: RenderConfig,
    width: u32,
    height: u32,

    samplers: SamplerStates,
    shadow_manager: CascadedShadowManager,
    shadow_effect: ShadowEffect,
    pbr: DeferredPbrEffect,
    skybox: SimpleSkyboxEffect,
    taa: TaaEffect,
    preprocess: PreProcessEffect,
    gizmos: GizmosWireEffect,
    present: PresentEffect,

    gbuffer: GBufferDefinition,
    targets: FrameTargets,
    shadow_debug: Texture2D,
    debug_views: DebugViews,

    frame_index: u64,
    /// True until the history holds a resolved frame of the current size.
    history_invalid: bool,
    frame: FrameCamera,
    prev_view_proj: Option<Mat4>,
    prev_world: HashMap<Entity, Mat4>,
    /// Entity drawn with id `i + 1` in the last G-buffer pass.
    drawn_entities: Vec<Entity>,
    light: Option<ResolvedLight>,
    shadows_rendered: bool,
    ibl_source: Option<CubeHandle>,
}

impl Renderer {
    pub fn new(
        backend: &mut dyn RenderBackend,
        mut config: RenderConfig,
        width: u32,
        height: u32,
    ) -> Result<Self, EngineError> {
        config.validate();
        let (width, height) = (width.max(1), height.max(1));
        let compiler = match &config.shader_cache.directory {
            Some(dir) => ShaderCompiler::with_cache(dir.clone(), config.shader_cache.force_write),
            None => ShaderCompiler::new(),
        };

        let samplers = SamplerStates::new(backend)?;
        let mut shadow_effect = ShadowEffect::new(backend, &compiler, &samplers)?;
        shadow_effect.set_evsm_exponents(config.shadow.evsm_exponents);
        shadow_effect.set_blur_kernel(config.shadow.blur_kernel_size, config.shadow.blur_sigma);
        let pbr = DeferredPbrEffect::new(backend, &compiler, &samplers)?;
        let skybox = SimpleSkyboxEffect::new(backend, &compiler, &samplers)?;
        let mut taa = TaaEffect::new(backend, &compiler, &samplers)?;
        taa.set_blend_factor(config.taa.blend_factor);
        let preprocess = PreProcessEffect::new(backend, &compiler, &samplers)?;
        let gizmos = GizmosWireEffect::new(backend, &compiler)?;
        let mut present = PresentEffect::new(backend, &compiler, &samplers)?;
        present.set_exposure(config.exposure);

        let gbuffer = GBufferDefinition::new(backend, width, height)?;
        let targets = FrameTargets::new(backend, width, height)?;
        let shadow_debug = Texture2D::render_target(
            backend,
            "Shadow Debug",
            SHADOW_DEBUG_SIZE,
            SHADOW_DEBUG_SIZE,
            DEBUG_FORMAT,
        )?;

        let camera = Camera::new().with_aspect(width as f32 / height as f32);
        log::info!("Renderer initialised at {}x{}", width, height);
        Ok(Self {
            shadow_manager: CascadedShadowManager::new(config.shadow.clone()),
            config,
            width,
            height,
            samplers,
            shadow_effect,
            pbr,
            skybox,
            taa,
            preprocess,
            gizmos,
            present,
            gbuffer,
            targets,
            shadow_debug,
            debug_views: DebugViews::default(),
            frame_index: 0,
            history_invalid: true,
            frame: FrameCamera {
                camera,
                view: camera.view(),
                jittered_proj: camera.projection(),
                view_proj: camera.view_projection(),
                jitter: Vec2::ZERO,
            },
            prev_view_proj: None,
            prev_world: HashMap::new(),
            drawn_entities: Vec::new(),
            light: None,
            shadows_rendered: false,
            ibl_source: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Recreates every screen-sized target. The next frame starts a fresh TAA history.
    pub fn resize(&mut self, backend: &mut dyn RenderBackend, width: u32, height: u32) -> Result<(), EngineError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        self.gbuffer.release(backend);
        self.targets.release(backend);
        self.gbuffer = GBufferDefinition::new(backend, width, height)?;
        self.targets = FrameTargets::new(backend, width, height)?;
        self.width = width;
        self.height = height;
        self.history_invalid = true;
        self.prev_view_proj = None;
        log::info!("Renderer resized to {}x{}", width, height);
        Ok(())
    }

    pub fn set_taa_enabled(&mut self, enabled: bool) {
        if enabled && !self.config.taa.enabled {
            self.history_invalid = true;
        }
        self.config.taa.enabled = enabled;
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.config.exposure = exposure;
        self.present.set_exposure(exposure);
    }

    /// Switches the shadow filtering technique; shadow textures follow on the next frame.
    pub fn set_shadow_technique(&mut self, technique: ShadowType) {
        self.config.shadow.technique = technique;
        self.shadow_manager.set_technique(technique);
    }

    pub fn set_debug_views(&mut self, views: DebugViews) {
        self.debug_views = views;
    }

    pub fn shadow_manager(&self) -> &CascadedShadowManager {
        &self.shadow_manager
    }

    pub fn shadow_manager_mut(&mut self) -> &mut CascadedShadowManager {
        &mut self.shadow_manager
    }

    pub fn gbuffer(&self) -> &GBufferDefinition {
        &self.gbuffer
    }

    /// Sets up the camera for a new frame, applying the TAA jitter when enabled.
    pub fn begin_frame(&mut self, camera: &Camera) {
        let mut camera = *camera;
        camera.aspect = self.width as f32 / self.height as f32;
        let jitter = if self.config.taa.enabled {
            taa_jitter(self.frame_index, self.config.taa.sample_count, self.width, self.height)
        } else {
            Vec2::ZERO
        };
        self.frame = FrameCamera {
            camera,
            view: camera.view(),
            jittered_proj: camera.jittered_projection(jitter),
            view_proj: camera.view_projection(),
            jitter,
        };
    }

    /// Renders one full frame of `scene` from `camera` and presents it.
    #[allow(clippy::too_many_arguments)]
    pub fn render_frame(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &mut SceneGraph,
        models: &ModelManager,
        textures: &TextureManager,
        editing: &mut EditingSystem,
        camera: &Camera,
    ) -> Result<(), EngineError> {
        self.begin_frame(camera);
        scene.frustum_culling(&self.frame.camera.frustum(), models);
        self.update_environment(backend, scene, textures)?;
        self.shadow_pass(backend, scene, models)?;
        self.gbuffer_pass(backend, scene, models, textures);
        self.lighting_and_taa_pass(backend);
        self.skybox_pass(backend, scene, textures);
        self.gizmo_pass(backend, scene, models, editing)?;
        self.present(backend);
        self.end_frame();
        Ok(())
    }

    /// Precomputes image-based lighting when the skybox cube changes.
    pub fn update_environment(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        textures: &TextureManager,
    ) -> Result<(), EngineError> {
        if !self.config.ibl {
            return Ok(());
        }
        let cube = scene
            .skybox_entity()
            .and_then(|entity| scene.get_component::<SkyboxComponent>(entity).map(|s| s.cube));
        if cube.is_none() || cube == self.ibl_source {
            return Ok(());
        }
        if let Some(texture) = cube.and_then(|handle| textures.get_cube(handle)) {
            self.preprocess.compute(backend, texture.srv())?;
            self.ibl_source = cube;
        }
        Ok(())
    }

    /// Renders every cascade of the directional light's shadow map, then converts and
    /// blurs moments for the filterable techniques. Skipped without a shadow-casting
    /// light or without geometry.
    pub fn shadow_pass(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        models: &ModelManager,
    ) -> Result<(), EngineError> {
        self.light = scene.directional_light();
        self.shadows_rendered = false;
        let Some(light) = self.light.filter(|light| light.cast_shadows) else {
            return Ok(());
        };
        let scene_bounds = scene.scene_bounding_box();
        if scene_bounds.is_empty() {
            return Ok(());
        }

        self.shadow_manager.init_resources(backend)?;
        let light_view = light_view_matrix(light.direction, &scene_bounds);
        self.shadow_manager
            .update_frame(&self.frame.camera, &light_view, &scene_bounds);
        let Some(resources) = self.shadow_manager.resources() else {
            return Ok(());
        };

        let casters = shadow_casters(scene);
        let levels = self.shadow_manager.cascade_levels() as u32;
        backend.set_viewport(self.shadow_manager.viewport());
        self.shadow_effect.set_view_matrix(&self.shadow_manager.shadow_view);
        for cascade in 0..levels {
            let Some(dsv) = resources.depth.dsv(cascade) else {
                continue;
            };
            backend.set_render_targets(&[], Some(dsv));
            backend.clear_depth_stencil(dsv, 1.0);
            self.shadow_effect
                .set_proj_matrix(&self.shadow_manager.shadow_proj[cascade as usize]);
            for (world, model) in &casters {
                let Some(model) = models.get_model(*model) else {
                    continue;
                };
                self.shadow_effect.set_world_matrix(world);
                if !self.shadow_effect.apply_depth(backend) {
                    continue;
                }
                for mesh in &model.meshes {
                    crate::effects::draw_mesh(backend, mesh);
                }
            }
        }

        let technique = self.shadow_manager.technique();
        if let (true, Some(moments), Some(scratch)) = (
            technique.is_filterable(),
            resources.moments.as_ref(),
            resources.blur_scratch.as_ref(),
        ) {
            let blur = self.config.shadow.blur_kernel_size > 1;
            for cascade in 0..levels {
                backend.set_render_targets(&[moments.target(0, cascade)], None);
                self.shadow_effect.set_depth_source(resources.depth.layer_srv(cascade));
                self.shadow_effect.render_moments(technique, backend);
                if !blur {
                    continue;
                }
                backend.set_render_targets(&[scratch.rtv()], None);
                self.shadow_effect.set_blur_source(moments.layer_srv(cascade));
                self.shadow_effect.render_blur(true, backend);
                backend.set_render_targets(&[moments.target(0, cascade)], None);
                self.shadow_effect.set_blur_source(Some(scratch.srv()));
                self.shadow_effect.render_blur(false, backend);
            }
            self.shadow_effect.set_depth_source(None);
            self.shadow_effect.set_blur_source(None);
        }

        if let Some(cascade) = self.debug_views.shadow_cascade {
            let cascade = (cascade as u32).min(levels - 1);
            if let Some(rtv) = self.shadow_debug.rtv() {
                backend.set_render_targets(&[Some(rtv)], None);
                backend.set_viewport(Viewport::new(SHADOW_DEBUG_SIZE as f32, SHADOW_DEBUG_SIZE as f32));
                self.shadow_effect.set_depth_source(resources.depth.layer_srv(cascade));
                self.shadow_effect.render_debug(backend);
                self.shadow_effect.set_depth_source(None);
            }
        }
        self.shadows_rendered = true;
        log::debug!("Rendered {} shadow cascades ({:?})", levels, technique);
        Ok(())
    }

    /// Fills the G-buffer with every visible entity. Entity ids are the draw index plus
    /// one, so 0 stays "nothing".
    pub fn gbuffer_pass(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        models: &ModelManager,
        textures: &TextureManager,
    ) {
        let color_targets = self.gbuffer.render_targets();
        backend.set_render_targets(&color_targets, self.gbuffer.depth.dsv());
        backend.set_viewport(Viewport::new(self.width as f32, self.height as f32));
        self.gbuffer.clear(backend);

        let prev_view_proj = self.prev_view_proj.unwrap_or(self.frame.view_proj);
        self.pbr.set_camera(
            &self.frame.view,
            &self.frame.jittered_proj,
            &self.frame.view_proj,
            &prev_view_proj,
            self.frame.camera.position,
        );
        self.pbr.set_screen_size(self.width, self.height);

        self.drawn_entities.clear();
        let mut current_world = HashMap::with_capacity(scene.entities_in_viewer().len());
        for &entity in scene.entities_in_viewer() {
            let (Some(transform), Some(mesh)) = (
                scene.get_component::<Transform>(entity),
                scene.get_component::<StaticMeshComponent>(entity),
            ) else {
                continue;
            };
            let Some(model) = models.get_model(mesh.model) else {
                continue;
            };

            let world = transform.matrix();
            let prev = self.prev_world.get(&entity).copied().unwrap_or(world);
            current_world.insert(entity, world);
            self.drawn_entities.push(entity);
            let id = self.drawn_entities.len() as u32;
            self.pbr.set_object(&world, &prev, id);

            for (index, sub) in model.meshes.iter().enumerate() {
                if !mesh.submodel_in_frustum.get(index).copied().unwrap_or(false) {
                    continue;
                }
                let Some(material) = model.material(sub) else {
                    continue;
                };
                let albedo = material
                    .albedo_texture
                    .and_then(|handle| textures.get_texture(handle))
                    .or_else(|| textures.get_texture(textures.default_white()))
                    .map(|texture| ResourceView::from(texture.srv()));
                self.pbr.set_material(material, albedo);
                self.pbr.draw_mesh(backend, sub);
            }
        }
        self.prev_world = current_world;
        log::debug!("G-buffer pass drew {} entities", self.drawn_entities.len());
    }

    /// Deferred lighting into the lit target, then TAA into the TAA output.
    ///
    /// On the first frame after creation, a resize or re-enabling TAA, and whenever TAA
    /// is off, the lit target is copied to the output unchanged. The output is copied to
    /// the history every frame.
    pub fn lighting_and_taa_pass(&mut self, backend: &mut dyn RenderBackend) {
        let inputs = self.gbuffer.inputs();
        self.pbr.set_gbuffer(&inputs);
        match self.light {
            Some(light) => {
                self.pbr
                    .set_directional_light(light.direction, light.color, light.intensity)
            }
            None => self.pbr.set_directional_light(Vec3::NEG_Y, Vec3::ZERO, 0.0),
        }

        let technique = self.shadow_manager.technique();
        self.pbr.set_shadows_enabled(self.shadows_rendered);
        if self.shadows_rendered {
            self.pbr.set_shadow_params(&self.shadow_manager);
            let resources = self.shadow_manager.resources();
            self.pbr.set_shadow_maps(
                resources.map(|r| r.depth.srv()),
                resources.and_then(|r| r.moments.as_ref()).map(|m| m.srv()),
            );
        }

        let ibl = self.config.ibl && self.preprocess.is_ready();
        if ibl {
            self.pbr.set_ibl(&IblInputs {
                irradiance: self.preprocess.irradiance_srv(),
                prefiltered: self.preprocess.prefiltered_srv(),
                brdf_lut: self.preprocess.brdf_lut_srv(),
                prefilter_mip_count: self.preprocess.prefilter_mip_count(),
            });
        }

        backend.set_viewport(Viewport::new(self.width as f32, self.height as f32));
        backend.set_render_targets(&[self.targets.lit.rtv()], None);
        self.pbr.render_lighting(technique, ibl, backend);

        if let (Some(mode), Some(rtv)) = (self.debug_views.gbuffer, self.targets.gbuffer_debug.rtv()) {
            backend.set_render_targets(&[Some(rtv)], None);
            self.pbr.render_debug(mode, backend);
        }

        if self.config.taa.enabled && !self.history_invalid {
            self.taa.set_inputs(
                Some(self.targets.lit.srv()),
                Some(self.targets.history.srv()),
                inputs.motion,
            );
            backend.set_render_targets(&[self.targets.taa_output.rtv()], None);
            self.taa.render(backend);
        } else {
            backend.copy_texture(self.targets.lit.texture(), self.targets.taa_output.texture());
        }
        backend.copy_texture(self.targets.taa_output.texture(), self.targets.history.texture());
        self.history_invalid = false;
    }

    /// Composites the sky behind the TAA output into the view texture; without a skybox
    /// the TAA output is copied through.
    pub fn skybox_pass(&mut self, backend: &mut dyn RenderBackend, scene: &SceneGraph, textures: &TextureManager) {
        let cube = scene
            .skybox_entity()
            .and_then(|entity| scene.get_component::<SkyboxComponent>(entity).map(|s| s.cube))
            .and_then(|handle| textures.get_cube(handle));
        let Some(cube) = cube else {
            backend.copy_texture(self.targets.taa_output.texture(), self.targets.view.texture());
            return;
        };
        self.skybox
            .set_camera(&self.frame.view_proj, self.frame.camera.position);
        self.skybox.set_scene(
            Some(self.targets.taa_output.srv()),
            Some(self.gbuffer.depth.srv()),
        );
        self.skybox.set_sky_cube(Some(cube.srv()));
        backend.set_render_targets(&[self.targets.view.rtv()], None);
        self.skybox.render(backend);
    }

    /// Draws editor overlays over the view texture: the selection outline, the light
    /// direction and, when enabled, the cascade volumes.
    pub fn gizmo_pass(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        models: &ModelManager,
        editing: &mut EditingSystem,
    ) -> Result<(), EngineError> {
        for obb in editing.selected_bounds(scene, models) {
            self.gizmos.add_obb(&obb, SELECTION_COLOR);
        }
        if let Some(light) = self.light {
            let bounds = scene.scene_bounding_box();
            let origin = if bounds.is_empty() { Vec3::ZERO } else { bounds.center() };
            self.gizmos
                .add_light_direction(origin, light.direction, 2.0, LIGHT_COLOR);
        }
        if self.debug_views.cascade_frusta && self.shadows_rendered {
            for cascade in 0..self.shadow_manager.cascade_levels() {
                let color = CASCADE_COLORS[cascade % CASCADE_COLORS.len()];
                self.gizmos
                    .add_frustum_from_matrix(&self.shadow_manager.cascade_view_proj(cascade), color);
            }
        }
        if self.gizmos.line_count() == 0 {
            return Ok(());
        }
        self.gizmos.set_view_proj(&self.frame.view_proj);
        backend.set_render_targets(&[self.targets.view.rtv()], self.gbuffer.depth.dsv());
        self.gizmos.draw(backend)
    }

    /// Tonemaps the view texture onto the swapchain, submits and presents. Headless
    /// devices without a swapchain only submit.
    pub fn present(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(backbuffer) = backend.acquire_backbuffer() {
            backend.set_render_targets(&[Some(backbuffer)], None);
            backend.set_viewport(Viewport::new(self.width as f32, self.height as f32));
            self.present.set_source(Some(self.targets.view.srv()));
            self.present.render(backend);
            backend.submit();
            backend.present();
        } else {
            backend.submit();
        }
    }

    /// Advances the TAA sequence and remembers this frame's matrices for motion vectors.
    pub fn end_frame(&mut self) {
        self.prev_view_proj = Some(self.frame.view_proj);
        self.frame_index = self.frame_index.wrapping_add(1);
    }

    /// Reads the entity id under pixel `(x, y)` of the last G-buffer pass and selects
    /// that entity in `editing`; a background pixel clears the selection. Flushes the
    /// device. A failed readback leaves the selection alone.
    pub fn pick_entity_gpu(
        &self,
        backend: &mut dyn RenderBackend,
        editing: &mut EditingSystem,
        x: u32,
        y: u32,
    ) -> Option<Entity> {
        let id = backend.read_texel_u32(self.gbuffer.entity_id.texture(), x, y)?;
        let picked = id
            .checked_sub(1)
            .and_then(|index| self.drawn_entities.get(index as usize).copied());
        editing.select(picked);
        picked
    }

    /// The editor selection, if its entity is still alive.
    pub fn get_selected_entity(&self, editing: &mut EditingSystem, scene: &SceneGraph) -> Option<Entity> {
        editing.get_selected_entity(scene)
    }

    pub fn reset_selected_entity(&self, editing: &mut EditingSystem) {
        editing.reset_selected_entity();
    }

    /// The composited, un-tonemapped frame.
    pub fn get_view_srv(&self) -> ViewId {
        self.targets.view.srv()
    }

    pub fn gbuffer_debug_srv(&self) -> Option<ViewId> {
        self.debug_views.gbuffer.map(|_| self.targets.gbuffer_debug.srv())
    }

    pub fn shadow_debug_srv(&self) -> Option<ViewId> {
        self.debug_views.shadow_cascade.map(|_| self.shadow_debug.srv())
    }

    /// Current jitter in normalised device coordinates.
    pub fn jitter(&self) -> Vec2 {
        self.frame.jitter
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.shadow_effect.release(backend);
        self.pbr.release(backend);
        self.skybox.release(backend);
        self.taa.release(backend);
        self.preprocess.release(backend);
        self.gizmos.release(backend);
        self.present.release(backend);
        self.shadow_manager.release(backend);
        self.gbuffer.release(backend);
        self.targets.release(backend);
        self.shadow_debug.release(backend);
        self.samplers.release(backend);
    }
}

/// World matrices and models of every mesh that casts shadows: everything except the
/// skybox and editor markers on cameras and lights. Off-screen meshes still cast.
fn shadow_casters(scene: &SceneGraph) -> Vec<(Mat4, crate::assets::ModelHandle)> {
    let mut query = scene.world().query::<(
        &Transform,
        &StaticMeshComponent,
        Option<&SkyboxComponent>,
        Option<&CameraComponent>,
        Option<&DirectionalLightComponent>,
    )>();
    query
        .iter()
        .filter(|(_, (_, _, skybox, camera, light))| {
            skybox.is_none() && camera.is_none() && light.is_none()
        })
        .map(|(_, (transform, mesh, ..))| (transform.matrix(), mesh.model))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Material;
    use crate::device::{Command, RecordingBackend};

    struct Fixture {
        backend: RecordingBackend,
        models: ModelManager,
        textures: TextureManager,
        scene: SceneGraph,
        editing: EditingSystem,
        camera: Camera,
        cube: Entity,
    }

    fn fixture() -> Fixture {
        let mut backend = RecordingBackend::new();
        let mut models = ModelManager::new();
        let textures = TextureManager::new(&mut backend).unwrap();
        let model = models.create_cube(&mut backend, Material::default()).unwrap();

        let mut scene = SceneGraph::new();
        let cube = scene.create_entity("cube");
        scene.add_component(cube, Transform::new());
        scene.add_component(cube, StaticMeshComponent::new(model));
        let sun = scene.create_entity("sun");
        scene.add_component(sun, Transform::new().looking_at(Vec3::new(0.3, -1.0, 0.2)));
        scene.add_component(sun, DirectionalLightComponent::default());

        Fixture {
            backend,
            models,
            textures,
            scene,
            editing: EditingSystem::new(),
            camera: Camera::new().at([0.0, 1.0, -4.0]).looking_at(Vec3::ZERO),
            cube,
        }
    }

    fn render(renderer: &mut Renderer, f: &mut Fixture) {
        renderer
            .render_frame(
                &mut f.backend,
                &mut f.scene,
                &f.models,
                &f.textures,
                &mut f.editing,
                &f.camera,
            )
            .unwrap();
    }

    fn copied(commands: &[Command], src: &Texture2D, dst: &Texture2D) -> bool {
        commands.contains(&Command::CopyTexture {
            src: src.texture(),
            dst: dst.texture(),
        })
    }

    #[test]
    fn first_frame_copies_lit_and_later_frames_resolve() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        f.backend.take_commands();

        render(&mut renderer, &mut f);
        let first = f.backend.take_commands();
        assert!(copied(&first, &renderer.targets.lit, &renderer.targets.taa_output));
        assert!(copied(&first, &renderer.targets.taa_output, &renderer.targets.history));

        render(&mut renderer, &mut f);
        let second = f.backend.take_commands();
        assert!(!copied(&second, &renderer.targets.lit, &renderer.targets.taa_output));
        assert!(copied(&second, &renderer.targets.taa_output, &renderer.targets.history));
        assert_ne!(renderer.jitter(), Vec2::ZERO);
    }

    #[test]
    fn resize_restarts_the_history() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        render(&mut renderer, &mut f);
        renderer.resize(&mut f.backend, 32, 48).unwrap();
        assert_eq!((renderer.width(), renderer.height()), (32, 48));
        assert_eq!(renderer.gbuffer().width(), 32);
        f.backend.take_commands();

        render(&mut renderer, &mut f);
        let commands = f.backend.take_commands();
        assert!(copied(&commands, &renderer.targets.lit, &renderer.targets.taa_output));
    }

    #[test]
    fn shadow_cascades_render_before_the_gbuffer() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        f.backend.take_commands();
        render(&mut renderer, &mut f);
        let commands = f.backend.take_commands();

        let shadow_clears: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Command::ClearDepthStencil { depth, .. } if *depth == 1.0))
            .map(|(i, _)| i)
            .collect();
        let gbuffer_clear = commands
            .iter()
            .position(|c| matches!(c, Command::ClearDepthStencil { depth, .. } if *depth == 0.0))
            .unwrap();
        assert_eq!(shadow_clears.len(), renderer.shadow_manager().cascade_levels());
        assert!(shadow_clears.iter().all(|&i| i < gbuffer_clear));
        assert_eq!(commands.last(), Some(&Command::Present));
    }

    #[test]
    fn no_light_means_no_shadow_pass() {
        let mut f = fixture();
        let sun = f.scene.find_by_name("sun").unwrap();
        f.scene.destroy_entity(sun);
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        f.backend.take_commands();
        render(&mut renderer, &mut f);
        assert_eq!(
            f.backend
                .count(|c| matches!(c, Command::ClearDepthStencil { depth, .. } if *depth == 1.0)),
            0
        );
        assert!(renderer.shadow_manager().resources().is_none());
    }

    #[test]
    fn gpu_pick_maps_ids_back_to_entities() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        render(&mut renderer, &mut f);
        assert_eq!(renderer.drawn_entities, vec![f.cube]);

        let entity_ids = renderer.gbuffer.entity_id.texture();
        f.backend.set_texel(entity_ids, 10, 12, 1);
        assert_eq!(renderer.pick_entity_gpu(&mut f.backend, &mut f.editing, 10, 12), Some(f.cube));
        assert_eq!(f.editing.get_selected_entity(&f.scene), Some(f.cube));
        assert_eq!(renderer.get_selected_entity(&mut f.editing, &f.scene), Some(f.cube));

        renderer.reset_selected_entity(&mut f.editing);
        assert_eq!(f.editing.get_selected_entity(&f.scene), None);

        f.editing.select(Some(f.cube));
        assert_eq!(renderer.pick_entity_gpu(&mut f.backend, &mut f.editing, 0, 0), None);
        assert_eq!(renderer.get_selected_entity(&mut f.editing, &f.scene), None);
    }

    #[test]
    fn selection_follows_the_editor_after_destroy() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        render(&mut renderer, &mut f);
        f.backend.set_texel(renderer.gbuffer.entity_id.texture(), 3, 3, 1);
        renderer.pick_entity_gpu(&mut f.backend, &mut f.editing, 3, 3);

        assert!(f.editing.destroy_selected(&mut f.scene));
        assert_eq!(renderer.get_selected_entity(&mut f.editing, &f.scene), None);
    }

    #[test]
    fn environment_is_precomputed_once_per_sky() {
        let mut f = fixture();
        let sky = f
            .textures
            .create_sky_cube(&mut f.backend, 8, Vec3::new(0.2, 0.4, 0.9), Vec3::ONE, Vec3::splat(0.2))
            .unwrap();
        let sky_entity = f.scene.create_entity("sky");
        f.scene.add_component(sky_entity, SkyboxComponent { cube: sky });

        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        f.backend.take_commands();
        render(&mut renderer, &mut f);
        let dispatches = f.backend.count(|c| matches!(c, Command::Dispatch { .. }));
        assert!(dispatches > 0);

        f.backend.take_commands();
        render(&mut renderer, &mut f);
        assert_eq!(f.backend.count(|c| matches!(c, Command::Dispatch { .. })), 0);
    }

    #[test]
    fn debug_targets_are_only_exposed_when_enabled() {
        let mut f = fixture();
        let mut renderer = Renderer::new(&mut f.backend, RenderConfig::default(), 64, 64).unwrap();
        assert!(renderer.gbuffer_debug_srv().is_none());
        assert!(renderer.shadow_debug_srv().is_none());

        renderer.set_debug_views(DebugViews {
            gbuffer: Some(GBufferDebugMode::Normal),
            shadow_cascade: Some(1),
            cascade_frusta: true,
        });
        render(&mut renderer, &mut f);
        assert!(renderer.gbuffer_debug_srv().is_some());
        assert!(renderer.shadow_debug_srv().is_some());
    }
}
