//! Deferred PBR shading: the G-buffer fill, the full-screen lighting pass and G-buffer
//! debug views.
//!
//! # Passes
//!
//! | Pass | Shaders | Notes |
//! |------|---------|-------|
//! | `GBuffer` | `vs_gbuffer` / `ps_gbuffer` | five targets, reversed-Z depth |
//! | `Lighting_<Technique>` | `vs_fullscreen` / `ps_lighting` | one per [`ShadowType`] |
//! | `Lighting_<Technique>_Ibl` | same, with `USE_IBL` | once IBL maps exist |
//! | `DebugGBuffer` | `vs_fullscreen` / `ps_debug_gbuffer` | see [`GBufferDebugMode`] |
//!
//! The lighting pass reads the G-buffer with texel loads, so every G-buffer target and the
//! depth buffer must match the output size.

use super::{
    EffectMaterial, EffectTransform, SamplerStates, ShaderEntry, add_shaders, draw_fullscreen,
    set_float, set_floats, set_mat4, set_uint, set_vec4,
};
use crate::assets::{Material, MeshData};
use crate::config::{CascadeSelection, MAX_CASCADES, ShadowType};
use crate::device::{RenderBackend, RenderStates, ResourceView, ViewId};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;
use crate::shadow::CascadedShadowManager;
use glam::{Mat4, Vec3, Vec4};

const SOURCE: &str = include_str!("../shaders/deferred_pbr.wgsl");

const TECHNIQUES: [ShadowType; 5] = [
    ShadowType::Hard,
    ShadowType::Vsm,
    ShadowType::Esm,
    ShadowType::Evsm2,
    ShadowType::Evsm4,
];

/// Name of the lighting pass for a technique.
pub fn lighting_pass_name(technique: ShadowType, ibl: bool) -> String {
    if ibl {
        format!("Lighting_{}_Ibl", technique.pass_suffix())
    } else {
        format!("Lighting_{}", technique.pass_suffix())
    }
}

/// What the `DebugGBuffer` pass shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GBufferDebugMode {
    #[default]
    Albedo = 0,
    Normal = 1,
    Roughness = 2,
    Metalness = 3,
    Position = 4,
    Motion = 5,
    Depth = 6,
}

impl GBufferDebugMode {
    pub const ALL: [GBufferDebugMode; 7] = [
        GBufferDebugMode::Albedo,
        GBufferDebugMode::Normal,
        GBufferDebugMode::Roughness,
        GBufferDebugMode::Metalness,
        GBufferDebugMode::Position,
        GBufferDebugMode::Motion,
        GBufferDebugMode::Depth,
    ];
}

/// Shader-resource views of the G-buffer, as read by the lighting and debug passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GBufferInputs {
    pub albedo: Option<ViewId>,
    pub normal: Option<ViewId>,
    pub position: Option<ViewId>,
    pub motion: Option<ViewId>,
    pub depth: Option<ViewId>,
}

/// Precomputed image-based lighting maps.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IblInputs {
    pub irradiance: Option<ViewId>,
    pub prefiltered: Option<ViewId>,
    pub brdf_lut: Option<ViewId>,
    pub prefilter_mip_count: u32,
}

/// The deferred PBR effect.
#[derive(Debug)]
pub struct DeferredPbrEffect {
    effect: EffectHelper,
    view: Mat4,
    proj: Mat4,
}

impl DeferredPbrEffect {
    pub fn new(
        backend: &mut dyn RenderBackend,
        compiler: &ShaderCompiler,
        samplers: &SamplerStates,
    ) -> Result<Self, EngineError> {
        let mut effect = EffectHelper::new();
        add_shaders(
            &mut effect,
            compiler,
            backend,
            SOURCE,
            &[
                ShaderEntry::new("deferred_pbr.vs_gbuffer", "vs_gbuffer"),
                ShaderEntry::new("deferred_pbr.ps_gbuffer", "ps_gbuffer"),
                ShaderEntry::new("deferred_pbr.vs_fullscreen", "vs_fullscreen"),
                ShaderEntry::new("deferred_pbr.ps_debug_gbuffer", "ps_debug_gbuffer"),
            ],
        )?;

        for technique in TECHNIQUES {
            let define = format!("SHADOW_{}", technique.pass_suffix().to_uppercase());
            for ibl in [false, true] {
                let name = format!(
                    "deferred_pbr.ps_{}",
                    lighting_pass_name(technique, ibl).to_lowercase()
                );
                let mut defines = vec![(define.as_str(), "1")];
                if ibl {
                    defines.push(("USE_IBL", "1"));
                }
                let compiled = compiler.compile(&name, SOURCE, "ps_lighting", &defines)?;
                effect.add_shader(&name, &compiled, backend)?;
                effect.add_effect_pass(
                    &lighting_pass_name(technique, ibl),
                    &EffectPassDesc::graphics("deferred_pbr.vs_fullscreen", &name),
                )?;
            }
        }

        effect.add_effect_pass(
            "GBuffer",
            &EffectPassDesc::graphics("deferred_pbr.vs_gbuffer", "deferred_pbr.ps_gbuffer"),
        )?;
        effect.add_effect_pass(
            "DebugGBuffer",
            &EffectPassDesc::graphics("deferred_pbr.vs_fullscreen", "deferred_pbr.ps_debug_gbuffer"),
        )?;

        let fullscreen = TECHNIQUES
            .iter()
            .flat_map(|&t| [lighting_pass_name(t, false), lighting_pass_name(t, true)])
            .chain(std::iter::once("DebugGBuffer".to_string()));
        for name in fullscreen {
            if let Some(pass) = effect.get_effect_pass(&name) {
                pass.set_render_states(RenderStates::fullscreen());
            }
        }

        samplers.bind(&mut effect);
        let mut pbr = Self {
            effect,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        };
        pbr.set_shadows_enabled(false);
        pbr.set_directional_light(Vec3::new(0.3, -1.0, 0.2), Vec3::ONE, 3.0);
        pbr.set_ambient(Vec3::splat(0.03));
        Ok(pbr)
    }

    /// Per-object constants for the next G-buffer draw. `entity_id` is what picking reads
    /// back; 0 means "no entity".
    pub fn set_object(&mut self, world: &Mat4, prev_world: &Mat4, entity_id: u32) {
        self.set_world_matrix(world);
        set_mat4(&mut self.effect, "prev_world", prev_world);
        set_uint(&mut self.effect, "entity_id", entity_id);
    }

    /// Camera constants for the frame. `view_proj` uses the jittered projection, the
    /// others are unjittered and drive motion vectors.
    pub fn set_camera(
        &mut self,
        view: &Mat4,
        jittered_proj: &Mat4,
        unjittered_view_proj: &Mat4,
        prev_view_proj: &Mat4,
        position: Vec3,
    ) {
        self.view = *view;
        self.proj = *jittered_proj;
        set_mat4(&mut self.effect, "view", view);
        set_mat4(&mut self.effect, "view_proj", &(*jittered_proj * *view));
        set_mat4(&mut self.effect, "unjittered_view_proj", unjittered_view_proj);
        set_mat4(&mut self.effect, "prev_view_proj", prev_view_proj);
        set_vec4(&mut self.effect, "camera_pos", position.extend(1.0));
    }

    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        set_vec4(&mut self.effect, "screen", Vec4::new(w, h, 1.0 / w, 1.0 / h));
    }

    /// `direction` is the way the light travels; `color` is scaled by `intensity`.
    pub fn set_directional_light(&mut self, direction: Vec3, color: Vec3, intensity: f32) {
        let direction = direction.normalize_or(Vec3::NEG_Y);
        set_vec4(&mut self.effect, "direction", direction.extend(0.0));
        set_vec4(&mut self.effect, "color", (color * intensity).extend(1.0));
    }

    /// Constant ambient term used when image-based lighting is off.
    pub fn set_ambient(&mut self, ambient: Vec3) {
        set_vec4(&mut self.effect, "ambient", ambient.extend(1.0));
    }

    pub fn set_shadows_enabled(&mut self, enabled: bool) {
        set_uint(&mut self.effect, "shadows_enabled", enabled as u32);
    }

    /// Copies the cascade fit of this frame and the filtering settings into the lighting
    /// constants.
    pub fn set_shadow_params(&mut self, manager: &CascadedShadowManager) {
        let config = manager.config();
        let (scales, offsets) = manager.cascade_scale_offsets();
        let flatten = |v: [Vec4; MAX_CASCADES]| -> Vec<f32> { v.iter().flat_map(|v| v.to_array()).collect() };

        set_floats(&mut self.effect, "cascade_scale", &flatten(scales));
        set_floats(&mut self.effect, "cascade_offset", &flatten(offsets));
        set_mat4(&mut self.effect, "light_view", &manager.shadow_view);
        set_floats(&mut self.effect, "partitions", &manager.cascade_partitions_frustum);
        set_uint(&mut self.effect, "cascade_levels", manager.cascade_levels() as u32);
        set_uint(
            &mut self.effect,
            "selection",
            match config.selection {
                CascadeSelection::Interval => 0,
                CascadeSelection::Map => 1,
            },
        );
        set_uint(&mut self.effect, "pcf_kernel_size", config.pcf_kernel_size);
        set_uint(&mut self.effect, "blend_between_cascades", config.blend_between_cascades as u32);
        set_float(&mut self.effect, "blend_area", config.blend_area);
        set_float(&mut self.effect, "depth_offset", config.depth_offset);
        set_float(&mut self.effect, "texel_size", 1.0 / config.shadow_size.max(1) as f32);
        set_float(&mut self.effect, "light_bleeding_reduction", config.light_bleeding_reduction);
        set_floats(&mut self.effect, "evsm_exponents", &config.evsm_exponents);
    }

    /// Shadow depth array for hard shadows, moments array for the filterable techniques.
    pub fn set_shadow_maps(&mut self, depth: Option<ViewId>, moments: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("shadow_map", depth.map(ResourceView::from));
        self.effect
            .set_shader_resource_by_name("shadow_moments", moments.map(ResourceView::from));
    }

    pub fn set_gbuffer(&mut self, inputs: &GBufferInputs) {
        let slots = [
            ("gbuffer_albedo", inputs.albedo),
            ("gbuffer_normal", inputs.normal),
            ("gbuffer_position", inputs.position),
            ("gbuffer_motion", inputs.motion),
            ("gbuffer_depth", inputs.depth),
        ];
        for (name, view) in slots {
            self.effect
                .set_shader_resource_by_name(name, view.map(ResourceView::from));
        }
    }

    pub fn set_ibl(&mut self, ibl: &IblInputs) {
        self.effect
            .set_shader_resource_by_name("irradiance_map", ibl.irradiance.map(ResourceView::from));
        self.effect
            .set_shader_resource_by_name("prefiltered_map", ibl.prefiltered.map(ResourceView::from));
        self.effect
            .set_shader_resource_by_name("brdf_lut", ibl.brdf_lut.map(ResourceView::from));
        set_float(&mut self.effect, "prefilter_mip_count", ibl.prefilter_mip_count as f32);
    }

    /// Binds the G-buffer pass; the caller then draws meshes with [`draw_mesh`](Self::draw_mesh).
    pub fn apply_gbuffer(&mut self, backend: &mut dyn RenderBackend) -> bool {
        self.effect.apply_pass("GBuffer", backend)
    }

    /// Re-applies the G-buffer pass so the latest object and material constants are
    /// uploaded, then draws the sub-mesh.
    pub fn draw_mesh(&mut self, backend: &mut dyn RenderBackend, mesh: &MeshData) {
        if self.apply_gbuffer(backend) {
            super::draw_mesh(backend, mesh);
        }
    }

    /// Full-screen lighting with the pass for `technique`.
    pub fn render_lighting(
        &mut self,
        technique: ShadowType,
        ibl: bool,
        backend: &mut dyn RenderBackend,
    ) -> bool {
        if !self.effect.apply_pass(&lighting_pass_name(technique, ibl), backend) {
            return false;
        }
        draw_fullscreen(backend);
        true
    }

    pub fn render_debug(&mut self, mode: GBufferDebugMode, backend: &mut dyn RenderBackend) -> bool {
        let Some(pass) = self.effect.get_effect_pass("DebugGBuffer") else {
            return false;
        };
        if let Some(mut variable) = pass.get_ps_param_by_name("mode") {
            variable.set_uint(mode as u32);
        }
        self.effect.apply_pass("DebugGBuffer", backend);
        draw_fullscreen(backend);
        true
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn proj_matrix(&self) -> Mat4 {
        self.proj
    }

    pub fn helper(&mut self) -> &mut EffectHelper {
        &mut self.effect
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.effect.release(backend);
    }
}

impl EffectTransform for DeferredPbrEffect {
    fn set_world_matrix(&mut self, world: &Mat4) {
        set_mat4(&mut self.effect, "world", world);
        set_mat4(&mut self.effect, "world_inv_transpose", &world.inverse().transpose());
    }

    fn set_view_matrix(&mut self, view: &Mat4) {
        self.view = *view;
        set_mat4(&mut self.effect, "view", view);
        set_mat4(&mut self.effect, "view_proj", &(self.proj * self.view));
    }

    fn set_proj_matrix(&mut self, proj: &Mat4) {
        self.proj = *proj;
        set_mat4(&mut self.effect, "view_proj", &(self.proj * self.view));
    }
}

impl EffectMaterial for DeferredPbrEffect {
    fn set_material(&mut self, material: &Material, albedo: Option<ResourceView>) {
        set_vec4(&mut self.effect, "base_color", material.base_color);
        set_float(&mut self.effect, "metallic", material.metallic);
        set_float(&mut self.effect, "roughness", material.roughness);
        self.effect.set_shader_resource_by_name("albedo_map", albedo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShadowConfig;
    use crate::device::{Command, ShaderStage};
    use crate::effects::test_support::setup;

    #[test]
    fn every_technique_has_both_lighting_passes() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        for technique in TECHNIQUES {
            assert!(pbr.helper().has_pass(&lighting_pass_name(technique, false)));
            assert!(pbr.helper().has_pass(&lighting_pass_name(technique, true)));
        }
        assert_eq!(lighting_pass_name(ShadowType::Evsm2, true), "Lighting_Evsm2_Ibl");
    }

    #[test]
    fn only_ibl_passes_read_the_ibl_maps() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let mut reads_irradiance = |name: &str| {
            let pass = pbr.helper().get_effect_pass(name).unwrap();
            let mask = pass.stage(ShaderStage::Pixel).unwrap().shader_resource_mask;
            mask & (1 << 7) != 0
        };
        assert!(!reads_irradiance("Lighting_Hard"));
        assert!(reads_irradiance("Lighting_Hard_Ibl"));
    }

    #[test]
    fn lighting_draws_one_fullscreen_triangle() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        backend.take_commands();
        assert!(pbr.render_lighting(ShadowType::Vsm, false, &mut backend));
        assert!(backend.commands().contains(&Command::Draw {
            vertex_count: 3,
            start_vertex: 0,
        }));
    }

    #[test]
    fn object_constants_reach_the_object_block() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let world = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        pbr.set_object(&world, &world, 7);
        let id = pbr.helper().get_constant_buffer_variable("entity_id").unwrap();
        assert_eq!(id.get_raw(), &7u32.to_le_bytes());
        let world_raw = pbr.helper().get_constant_buffer_variable("world").unwrap();
        assert_eq!(world_raw.get_raw(), bytemuck::cast_slice::<f32, u8>(&world.to_cols_array()));
    }

    #[test]
    fn shadow_params_follow_the_manager() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let manager = CascadedShadowManager::new(ShadowConfig {
            cascade_levels: 3,
            shadow_size: 2048,
            ..Default::default()
        });
        pbr.set_shadow_params(&manager);
        let levels = pbr.helper().get_constant_buffer_variable("cascade_levels").unwrap();
        assert_eq!(levels.get_raw(), &3u32.to_le_bytes());
        let texel = pbr.helper().get_constant_buffer_variable("texel_size").unwrap();
        assert_eq!(texel.get_raw(), &(1.0f32 / 2048.0).to_le_bytes());
    }

    #[test]
    fn debug_mode_is_a_pass_parameter() {
        let (mut backend, compiler, samplers) = setup();
        let mut pbr = DeferredPbrEffect::new(&mut backend, &compiler, &samplers).unwrap();
        assert!(pbr.render_debug(GBufferDebugMode::Motion, &mut backend));
        let pass = pbr.helper().get_effect_pass("DebugGBuffer").unwrap();
        let mode = pass.get_ps_param_by_name("mode").unwrap();
        assert_eq!(mode.get_raw(), &5u32.to_le_bytes());
    }
}
