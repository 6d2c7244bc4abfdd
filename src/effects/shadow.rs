//! Shadow map rendering: cascade depth, moment conversion, separable blur and a debug view.

use super::{
    EffectTransform, SamplerStates, ShaderEntry, add_shaders, draw_fullscreen, set_floats,
    set_mat4, set_uint,
};
use crate::config::ShadowType;
use crate::device::{
    DepthStencilState, RasterizerState, RenderBackend, RenderStates, ResourceView, ViewId,
};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;
use glam::Mat4;

const SOURCE: &str = include_str!("../shaders/shadow.wgsl");

/// Largest blur radius the shader's weight table holds.
pub const MAX_BLUR_RADIUS: u32 = 15;

const FILTERABLE: [ShadowType; 4] = [
    ShadowType::Vsm,
    ShadowType::Esm,
    ShadowType::Evsm2,
    ShadowType::Evsm4,
];

/// Normalised Gaussian weights for offsets `0..=radius` of a `kernel_size` tap kernel.
///
/// The centre weight plus twice every other weight sums to one.
pub fn gaussian_weights(kernel_size: u32, sigma: f32) -> ([f32; 16], u32) {
    let radius = (kernel_size / 2).min(MAX_BLUR_RADIUS);
    let sigma = sigma.max(0.1);
    let mut weights = [0.0f32; 16];
    for (i, weight) in weights.iter_mut().enumerate().take(radius as usize + 1) {
        let x = i as f32;
        *weight = (-(x * x) / (2.0 * sigma * sigma)).exp();
    }
    let total = weights[0] + 2.0 * weights[1..=radius as usize].iter().sum::<f32>();
    for weight in &mut weights {
        *weight /= total;
    }
    (weights, radius)
}

/// Renders cascades into the shadow depth array and post-processes them for the
/// filterable techniques.
///
/// Passes: `Depth`, `Moments_Vsm`, `Moments_Esm`, `Moments_Evsm2`, `Moments_Evsm4`,
/// `BlurX`, `BlurY` and `Debug`.
#[derive(Debug)]
pub struct ShadowEffect {
    effect: EffectHelper,
    world: Mat4,
    view: Mat4,
    proj: Mat4,
}

impl ShadowEffect {
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
                ShaderEntry::new("shadow.vs_depth", "vs_depth"),
                ShaderEntry::new("shadow.vs_fullscreen", "vs_fullscreen"),
                ShaderEntry::with_defines("shadow.ps_moments_vsm", "ps_moments", &[("MOMENTS_VSM", "1")]),
                ShaderEntry::with_defines("shadow.ps_moments_esm", "ps_moments", &[("MOMENTS_ESM", "1")]),
                ShaderEntry::with_defines("shadow.ps_moments_evsm2", "ps_moments", &[("MOMENTS_EVSM2", "1")]),
                ShaderEntry::with_defines("shadow.ps_moments_evsm4", "ps_moments", &[("MOMENTS_EVSM4", "1")]),
                ShaderEntry::new("shadow.ps_blur", "ps_blur"),
                ShaderEntry::new("shadow.ps_debug", "ps_debug"),
            ],
        )?;

        effect.add_effect_pass("Depth", &EffectPassDesc::vertex_only("shadow.vs_depth"))?;
        if let Some(pass) = effect.get_effect_pass("Depth") {
            pass.set_render_states(RenderStates {
                // Both faces cast, so thin geometry still shadows
                rasterizer: RasterizerState {
                    cull_mode: None,
                    depth_bias: 0,
                    slope_scaled_depth_bias: 1.0,
                },
                depth_stencil: DepthStencilState::LESS_EQUAL,
                ..Default::default()
            });
        }

        for technique in FILTERABLE {
            let pass = format!("Moments_{}", technique.pass_suffix());
            let ps = format!("shadow.ps_moments_{}", technique.pass_suffix().to_lowercase());
            effect.add_effect_pass(&pass, &EffectPassDesc::graphics("shadow.vs_fullscreen", &ps))?;
        }
        for pass in ["BlurX", "BlurY"] {
            effect.add_effect_pass(pass, &EffectPassDesc::graphics("shadow.vs_fullscreen", "shadow.ps_blur"))?;
        }
        effect.add_effect_pass("Debug", &EffectPassDesc::graphics("shadow.vs_fullscreen", "shadow.ps_debug"))?;

        for (pass, direction) in [("BlurX", [1, 0]), ("BlurY", [0, 1])] {
            if let Some(pass) = effect.get_effect_pass(pass) {
                if let Some(mut variable) = pass.get_ps_param_by_name("direction") {
                    variable.set_sint_vector(&direction);
                }
            }
        }
        let fullscreen = FILTERABLE
            .iter()
            .map(|t| format!("Moments_{}", t.pass_suffix()))
            .chain(["BlurX", "BlurY", "Debug"].map(String::from));
        for name in fullscreen {
            if let Some(pass) = effect.get_effect_pass(&name) {
                pass.set_render_states(RenderStates::fullscreen());
            }
        }

        samplers.bind(&mut effect);
        let mut shadow = Self {
            effect,
            world: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        };
        shadow.set_blur_kernel(5, 1.5);
        shadow.set_evsm_exponents([40.0, 5.0]);
        Ok(shadow)
    }

    pub fn set_evsm_exponents(&mut self, exponents: [f32; 2]) {
        set_floats(&mut self.effect, "evsm_exponents", &exponents);
    }

    /// Rebuilds the blur weights. `kernel_size` is the full tap count across one axis.
    pub fn set_blur_kernel(&mut self, kernel_size: u32, sigma: f32) {
        let (weights, radius) = gaussian_weights(kernel_size, sigma);
        set_floats(&mut self.effect, "weights", &weights);
        set_uint(&mut self.effect, "radius", radius);
    }

    /// The cascade depth slice the moments and debug passes read.
    pub fn set_depth_source(&mut self, view: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("shadow_depth", view.map(ResourceView::from));
    }

    /// The texture the next blur pass reads.
    pub fn set_blur_source(&mut self, view: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("blur_source", view.map(ResourceView::from));
    }

    /// Binds the depth pass with the current world-view-projection.
    pub fn apply_depth(&mut self, backend: &mut dyn RenderBackend) -> bool {
        let world_view_proj = self.proj * self.view * self.world;
        set_mat4(&mut self.effect, "world_view_proj", &world_view_proj);
        self.effect.apply_pass("Depth", backend)
    }

    /// Converts the bound depth slice into moments for `technique` and draws.
    pub fn render_moments(&mut self, technique: ShadowType, backend: &mut dyn RenderBackend) -> bool {
        if !technique.is_filterable() {
            return false;
        }
        let pass = format!("Moments_{}", technique.pass_suffix());
        if !self.effect.apply_pass(&pass, backend) {
            return false;
        }
        draw_fullscreen(backend);
        true
    }

    /// One axis of the separable blur over the bound blur source.
    pub fn render_blur(&mut self, horizontal: bool, backend: &mut dyn RenderBackend) -> bool {
        let pass = if horizontal { "BlurX" } else { "BlurY" };
        if !self.effect.apply_pass(pass, backend) {
            return false;
        }
        draw_fullscreen(backend);
        true
    }

    /// Visualises the bound depth slice.
    pub fn render_debug(&mut self, backend: &mut dyn RenderBackend) -> bool {
        if !self.effect.apply_pass("Debug", backend) {
            return false;
        }
        draw_fullscreen(backend);
        true
    }

    pub fn helper(&mut self) -> &mut EffectHelper {
        &mut self.effect
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.effect.release(backend);
    }
}

impl EffectTransform for ShadowEffect {
    fn set_world_matrix(&mut self, world: &Mat4) {
        self.world = *world;
    }

    fn set_view_matrix(&mut self, view: &Mat4) {
        self.view = *view;
    }

    fn set_proj_matrix(&mut self, proj: &Mat4) {
        self.proj = *proj;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, ShaderStage};
    use crate::effects::test_support::setup;

    #[test]
    fn gaussian_weights_are_normalised() {
        for (size, sigma) in [(1, 1.0), (5, 1.5), (9, 3.0), (31, 8.0), (99, 2.0)] {
            let (weights, radius) = gaussian_weights(size, sigma);
            let total = weights[0] + 2.0 * weights[1..=radius as usize].iter().sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5, "size {} sums to {}", size, total);
            assert!(radius <= MAX_BLUR_RADIUS);
            assert!(weights[radius as usize + 1..].iter().all(|&w| w == 0.0));
        }
    }

    #[test]
    fn depth_pass_has_no_pixel_stage() {
        let (mut backend, compiler, samplers) = setup();
        let mut shadow = ShadowEffect::new(&mut backend, &compiler, &samplers).unwrap();
        backend.take_commands();

        shadow.set_proj_matrix(&Mat4::orthographic_lh(-1.0, 1.0, -1.0, 1.0, 0.0, 1.0));
        assert!(shadow.apply_depth(&mut backend));
        let commands = backend.take_commands();
        assert!(commands.contains(&Command::SetShader {
            stage: ShaderStage::Pixel,
            shader: None,
        }));
        let states = commands.iter().find_map(|c| match c {
            Command::SetRenderStates(states) => Some(*states),
            _ => None,
        });
        assert_eq!(states.unwrap().depth_stencil, DepthStencilState::LESS_EQUAL);
    }

    #[test]
    fn blur_directions_are_per_pass() {
        let (mut backend, compiler, samplers) = setup();
        let mut shadow = ShadowEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let mut direction = |pass: &str| {
            let pass = shadow.helper().get_effect_pass(pass).unwrap();
            pass.get_ps_param_by_name("direction").unwrap().get_raw().to_vec()
        };
        assert_eq!(direction("BlurX"), bytemuck::cast_slice::<i32, u8>(&[1, 0]).to_vec());
        assert_eq!(direction("BlurY"), bytemuck::cast_slice::<i32, u8>(&[0, 1]).to_vec());
    }

    #[test]
    fn hard_shadows_have_no_moments() {
        let (mut backend, compiler, samplers) = setup();
        let mut shadow = ShadowEffect::new(&mut backend, &compiler, &samplers).unwrap();
        backend.take_commands();
        assert!(!shadow.render_moments(ShadowType::Hard, &mut backend));
        assert!(backend.commands().is_empty());
        assert!(shadow.render_moments(ShadowType::Evsm4, &mut backend));
        assert_eq!(backend.count(|c| c.is_work()), 1);
    }
}
