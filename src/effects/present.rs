//! Tonemaps the final HDR view texture onto the swapchain image.

use super::{SamplerStates, ShaderEntry, add_shaders, draw_fullscreen};
use crate::device::{RenderBackend, RenderStates, ResourceView, ViewId};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;

const SOURCE: &str = include_str!("../shaders/present.wgsl");

/// Tonemapping operator applied after exposure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tonemap {
    /// Clamp to `[0, 1]`.
    Linear,
    #[default]
    Aces,
}

#[derive(Debug)]
pub struct PresentEffect {
    effect: EffectHelper,
}

impl PresentEffect {
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
                ShaderEntry::new("present.vs_main", "vs_main"),
                ShaderEntry::new("present.ps_main", "ps_main"),
            ],
        )?;
        effect.add_effect_pass(
            "Present",
            &EffectPassDesc::graphics("present.vs_main", "present.ps_main"),
        )?;
        if let Some(pass) = effect.get_effect_pass("Present") {
            pass.set_render_states(RenderStates::fullscreen());
        }
        samplers.bind(&mut effect);
        let mut present = Self { effect };
        present.set_exposure(1.0);
        present.set_tonemap(Tonemap::default());
        Ok(present)
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        if let Some(pass) = self.effect.get_effect_pass("Present") {
            if let Some(mut variable) = pass.get_ps_param_by_name("exposure") {
                variable.set_float(exposure.max(0.0));
            }
        }
    }

    pub fn set_tonemap(&mut self, tonemap: Tonemap) {
        if let Some(pass) = self.effect.get_effect_pass("Present") {
            if let Some(mut variable) = pass.get_ps_param_by_name("tonemap") {
                variable.set_uint(tonemap as u32);
            }
        }
    }

    pub fn set_source(&mut self, view: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("scene_color", view.map(ResourceView::from));
    }

    /// Draws into whatever colour target is bound.
    pub fn render(&mut self, backend: &mut dyn RenderBackend) -> bool {
        if !self.effect.apply_pass("Present", backend) {
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
    fn exposure_lives_in_the_pass_params() {
        let (mut backend, compiler, samplers) = setup();
        let mut present = PresentEffect::new(&mut backend, &compiler, &samplers).unwrap();
        present.set_exposure(2.5);
        present.set_tonemap(Tonemap::Linear);
        assert!(present.helper().get_constant_buffer_variable("exposure").is_none());

        let pass = present.helper().get_effect_pass("Present").unwrap();
        assert_eq!(pass.get_ps_param_by_name("exposure").unwrap().get_raw(), &2.5f32.to_le_bytes());
        assert_eq!(pass.get_ps_param_by_name("tonemap").unwrap().get_raw(), &0u32.to_le_bytes());
    }
}
