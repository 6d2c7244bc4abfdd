//! The G-buffer: five colour targets and the reversed-Z depth buffer they share.

use crate::device::{RenderBackend, ViewId};
use crate::effects::GBufferInputs;
use crate::error::EngineError;
use crate::resources::{Depth2D, Texture2D};

/// Formats of the colour targets, in render-target slot order.
pub const GBUFFER_FORMATS: [wgpu::TextureFormat; 5] = [
    // albedo.rgb, metalness
    wgpu::TextureFormat::Rgba8Unorm,
    // normal.xyz, roughness
    wgpu::TextureFormat::Rgba16Float,
    // world position
    wgpu::TextureFormat::Rgba32Float,
    // motion in UV units
    wgpu::TextureFormat::Rg16Float,
    // entity id, 0 for none
    wgpu::TextureFormat::R32Uint,
];

/// The G-buffer targets for one output size. Recreate it on resize.
#[derive(Debug)]
pub struct GBufferDefinition {
    pub albedo_metalness: Texture2D,
    pub normal_roughness: Texture2D,
    pub world_position: Texture2D,
    pub motion_vector: Texture2D,
    pub entity_id: Texture2D,
    pub depth: Depth2D,
}

impl GBufferDefinition {
    pub fn new(backend: &mut dyn RenderBackend, width: u32, height: u32) -> Result<Self, EngineError> {
        let (width, height) = (width.max(1), height.max(1));
        let mut created: Vec<Texture2D> = Vec::with_capacity(GBUFFER_FORMATS.len());
        let labels = [
            "GBuffer Albedo",
            "GBuffer Normal",
            "GBuffer Position",
            "GBuffer Motion",
            "GBuffer Entity",
        ];
        for (label, format) in labels.into_iter().zip(GBUFFER_FORMATS) {
            match Texture2D::render_target(backend, label, width, height, format) {
                Ok(texture) => created.push(texture),
                Err(e) => {
                    for mut texture in created {
                        texture.release(backend);
                    }
                    return Err(e);
                }
            }
        }
        let depth = match Depth2D::new(backend, "GBuffer Depth", width, height) {
            Ok(depth) => depth,
            Err(e) => {
                for mut texture in created {
                    texture.release(backend);
                }
                return Err(e);
            }
        };

        let mut targets = created.into_iter();
        let (Some(albedo_metalness), Some(normal_roughness), Some(world_position), Some(motion_vector), Some(entity_id)) = (
            targets.next(),
            targets.next(),
            targets.next(),
            targets.next(),
            targets.next(),
        ) else {
            return Err(EngineError::Device("G-buffer targets missing".to_string()));
        };
        log::info!("G-buffer created at {}x{}", width, height);
        Ok(Self {
            albedo_metalness,
            normal_roughness,
            world_position,
            motion_vector,
            entity_id,
            depth,
        })
    }

    pub fn width(&self) -> u32 {
        self.depth.width()
    }

    pub fn height(&self) -> u32 {
        self.depth.height()
    }

    fn colors(&self) -> [&Texture2D; 5] {
        [
            &self.albedo_metalness,
            &self.normal_roughness,
            &self.world_position,
            &self.motion_vector,
            &self.entity_id,
        ]
    }

    /// Render-target views in slot order.
    pub fn render_targets(&self) -> [Option<ViewId>; 5] {
        self.colors().map(|t| t.rtv())
    }

    /// Clears every target: colours to zero (entity 0 means none), depth to the far plane.
    pub fn clear(&self, backend: &mut dyn RenderBackend) {
        for view in self.render_targets().into_iter().flatten() {
            backend.clear_render_target(view, [0.0; 4]);
        }
        if let Some(dsv) = self.depth.dsv() {
            backend.clear_depth_stencil(dsv, 0.0);
        }
    }

    /// Shader-resource views for the lighting and debug passes.
    pub fn inputs(&self) -> GBufferInputs {
        GBufferInputs {
            albedo: Some(self.albedo_metalness.srv()),
            normal: Some(self.normal_roughness.srv()),
            position: Some(self.world_position.srv()),
            motion: Some(self.motion_vector.srv()),
            depth: Some(self.depth.srv()),
        }
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        for texture in [
            &mut self.albedo_metalness,
            &mut self.normal_roughness,
            &mut self.world_position,
            &mut self.motion_vector,
            &mut self.entity_id,
        ] {
            texture.release(backend);
        }
        self.depth.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, RecordingBackend};

    #[test]
    fn targets_use_the_gbuffer_formats() {
        let mut backend = RecordingBackend::new();
        let gbuffer = GBufferDefinition::new(&mut backend, 64, 32).unwrap();
        for (texture, format) in gbuffer.colors().into_iter().zip(GBUFFER_FORMATS) {
            assert_eq!(texture.format(), format);
            assert_eq!((texture.width(), texture.height()), (64, 32));
        }
        assert!(gbuffer.render_targets().iter().all(Option::is_some));
    }

    #[test]
    fn clear_resets_depth_to_the_far_plane() {
        let mut backend = RecordingBackend::new();
        let gbuffer = GBufferDefinition::new(&mut backend, 8, 8).unwrap();
        backend.take_commands();
        gbuffer.clear(&mut backend);
        assert_eq!(backend.count(|c| matches!(c, Command::ClearRenderTarget { .. })), 5);
        assert!(backend.commands().contains(&Command::ClearDepthStencil {
            view: gbuffer.depth.dsv().unwrap(),
            depth: 0.0,
        }));
    }

    #[test]
    fn release_frees_every_texture() {
        let mut backend = RecordingBackend::new();
        let before = backend.live_textures();
        let mut gbuffer = GBufferDefinition::new(&mut backend, 8, 8).unwrap();
        assert_eq!(backend.live_textures(), before + 6);
        gbuffer.release(&mut backend);
        assert_eq!(backend.live_textures(), before);
    }
}
