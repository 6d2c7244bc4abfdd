//! Sky composite: fills every far-plane pixel of the scene with a cube map lookup.

use super::{SamplerStates, ShaderEntry, add_shaders, draw_fullscreen, set_mat4, set_vec4};
use crate::device::{RenderBackend, RenderStates, ResourceView, ViewId};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;
use glam::{Mat4, Vec3};

const SOURCE: &str = include_str!("../shaders/skybox.wgsl");

#[derive(Debug)]
pub struct SimpleSkyboxEffect {
    effect: EffectHelper,
}

impl SimpleSkyboxEffect {
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
                ShaderEntry::new("skybox.vs_fullscreen", "vs_fullscreen"),
                ShaderEntry::new("skybox.ps_skybox", "ps_skybox"),
            ],
        )?;
        effect.add_effect_pass(
            "Skybox",
            &EffectPassDesc::graphics("skybox.vs_fullscreen", "skybox.ps_skybox"),
        )?;
        if let Some(pass) = effect.get_effect_pass("Skybox") {
            pass.set_render_states(RenderStates::fullscreen());
        }
        samplers.bind(&mut effect);
        Ok(Self { effect })
    }

    /// `view_proj` must be unjittered so the sky does not shimmer under TAA.
    pub fn set_camera(&mut self, view_proj: &Mat4, position: Vec3) {
        set_mat4(&mut self.effect, "inv_view_proj", &view_proj.inverse());
        set_vec4(&mut self.effect, "camera_pos", position.extend(1.0));
    }

    pub fn set_scene(&mut self, color: Option<ViewId>, depth: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("scene_color", color.map(ResourceView::from));
        self.effect
            .set_shader_resource_by_name("scene_depth", depth.map(ResourceView::from));
    }

    pub fn set_sky_cube(&mut self, cube: Option<ViewId>) {
        self.effect
            .set_shader_resource_by_name("sky_cube", cube.map(ResourceView::from));
    }

    pub fn render(&mut self, backend: &mut dyn RenderBackend) -> bool {
        if !self.effect.apply_pass("Skybox", backend) {
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
    use crate::device::{Command, ShaderStage, TextureDesc, ViewDesc};
    use crate::effects::test_support::setup;

    #[test]
    fn binds_scene_and_cube_in_slot_order() {
        let (mut backend, compiler, samplers) = setup();
        let mut sky = SimpleSkyboxEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let texture = backend
            .create_texture(&TextureDesc::d2(
                "scene",
                4,
                4,
                wgpu::TextureFormat::Rgba16Float,
                wgpu::TextureUsages::TEXTURE_BINDING,
            ))
            .unwrap();
        let color = backend.create_view(&ViewDesc::whole_2d(texture, 1)).unwrap();
        sky.set_scene(Some(color), None);
        sky.set_camera(&Mat4::IDENTITY, Vec3::ZERO);
        backend.take_commands();

        assert!(sky.render(&mut backend));
        let views = backend.commands().iter().find_map(|c| match c {
            Command::SetShaderResources {
                stage: ShaderStage::Pixel,
                start_slot: 0,
                views,
            } => Some(views.clone()),
            _ => None,
        });
        assert_eq!(views.unwrap(), vec![Some(ResourceView::from(color)), None, None]);
    }
}
