//! Temporal anti-aliasing resolve.
//!
//! Blends the current lit frame with the reprojected history, clamping history to the
//! current frame's 3x3 neighbourhood. The renderer keeps the history texture; this effect
//! only reads it.

use super::{SamplerStates, ShaderEntry, add_shaders, draw_fullscreen, set_float};
use crate::device::{RenderBackend, RenderStates, ResourceView, ViewId};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;

const SOURCE: &str = include_str!("../shaders/taa.wgsl");

#[derive(Debug)]
pub struct TaaEffect {
    effect: EffectHelper,
    blend_factor: f32,
}

impl TaaEffect {
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
                ShaderEntry::new("taa.vs_fullscreen", "vs_fullscreen"),
                ShaderEntry::new("taa.ps_resolve", "ps_resolve"),
            ],
        )?;
        effect.add_effect_pass(
            "Resolve",
            &EffectPassDesc::graphics("taa.vs_fullscreen", "taa.ps_resolve"),
        )?;
        if let Some(pass) = effect.get_effect_pass("Resolve") {
            pass.set_render_states(RenderStates::fullscreen());
        }
        samplers.bind(&mut effect);
        let mut taa = Self {
            effect,
            blend_factor: 0.0,
        };
        taa.set_blend_factor(0.1);
        Ok(taa)
    }

    /// Weight of the current frame, clamped to `[0, 1]`.
    pub fn set_blend_factor(&mut self, factor: f32) {
        self.blend_factor = factor.clamp(0.0, 1.0);
        set_float(&mut self.effect, "blend_factor", self.blend_factor);
    }

    pub fn blend_factor(&self) -> f32 {
        self.blend_factor
    }

    pub fn set_inputs(
        &mut self,
        current: Option<ViewId>,
        history: Option<ViewId>,
        motion: Option<ViewId>,
    ) {
        let inputs = [
            ("current_color", current),
            ("history_color", history),
            ("motion_vectors", motion),
        ];
        for (name, view) in inputs {
            self.effect
                .set_shader_resource_by_name(name, view.map(ResourceView::from));
        }
    }

    pub fn render(&mut self, backend: &mut dyn RenderBackend) -> bool {
        if !self.effect.apply_pass("Resolve", backend) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_support::setup;

    #[test]
    fn blend_factor_is_clamped_and_uploaded() {
        let (mut backend, compiler, samplers) = setup();
        let mut taa = TaaEffect::new(&mut backend, &compiler, &samplers).unwrap();
        taa.set_blend_factor(4.0);
        assert_eq!(taa.blend_factor(), 1.0);
        let raw = taa.helper().get_constant_buffer_variable("blend_factor").unwrap();
        assert_eq!(raw.get_raw(), &1.0f32.to_le_bytes());
    }

    #[test]
    fn resolve_is_a_single_draw() {
        let (mut backend, compiler, samplers) = setup();
        let mut taa = TaaEffect::new(&mut backend, &compiler, &samplers).unwrap();
        backend.take_commands();
        assert!(taa.render(&mut backend));
        assert_eq!(backend.count(|c| c.is_work()), 1);
    }
}
