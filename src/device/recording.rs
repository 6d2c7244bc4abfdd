//! A device that records calls instead of executing them.

use super::*;
use crate::arena::Arena;
use std::collections::HashMap;

/// One recorded [`RenderBackend`] call.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    UpdateBuffer {
        buffer: BufferId,
        offset: u64,
        data: Vec<u8>,
    },
    UpdateTexture {
        texture: TextureId,
        mip: u32,
        layer: u32,
        len: usize,
    },
    SetRenderStates(RenderStates),
    SetShader {
        stage: ShaderStage,
        shader: Option<ShaderId>,
    },
    SetConstantBuffers {
        stage: ShaderStage,
        start_slot: u32,
        buffers: Vec<Option<BufferId>>,
    },
    SetShaderResources {
        stage: ShaderStage,
        start_slot: u32,
        views: Vec<Option<ResourceView>>,
    },
    SetSamplers {
        stage: ShaderStage,
        start_slot: u32,
        samplers: Vec<Option<SamplerId>>,
    },
    SetUnorderedAccess {
        stage: ShaderStage,
        start_slot: u32,
        views: Vec<Option<ResourceView>>,
        initial_counts: Vec<u32>,
    },
    SetRenderTargets {
        colors: Vec<Option<ViewId>>,
        depth: Option<ViewId>,
    },
    SetViewport(Viewport),
    SetVertexBuffer(Option<BufferId>),
    SetIndexBuffer(Option<BufferId>),
    ClearRenderTarget {
        view: ViewId,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: ViewId,
        depth: f32,
    },
    Draw {
        vertex_count: u32,
        start_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyTexture {
        src: TextureId,
        dst: TextureId,
    },
    Submit,
    Present,
}

impl Command {
    /// True for calls that consume the bound state.
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            Command::Draw { .. } | Command::DrawIndexed { .. } | Command::Dispatch { .. }
        )
    }
}

/// Null device: allocates ids, keeps buffer contents and logs every call.
///
/// Used by the unit tests and for headless dry runs of the frame pipeline.
#[derive(Default)]
pub struct RecordingBackend {
    buffers: Arena<(BufferDesc, Vec<u8>)>,
    textures: Arena<TextureDesc>,
    views: Arena<ViewDesc>,
    samplers: Arena<SamplerDesc>,
    shaders: Arena<CompiledShader>,
    commands: Vec<Command>,
    texels: HashMap<(TextureId, u32, u32), u32>,
    backbuffer: Option<ViewId>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Current contents of a buffer, after every recorded update.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(buffer.0).map(|(_, data)| data.as_slice())
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(texture.0)
    }

    pub fn view_desc(&self, view: ViewId) -> Option<&ViewDesc> {
        self.views.get(view.0)
    }

    pub fn shader(&self, shader: ShaderId) -> Option<&CompiledShader> {
        self.shaders.get(shader.0)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Value returned by [`RenderBackend::read_texel_u32`] for this texel.
    pub fn set_texel(&mut self, texture: TextureId, x: u32, y: u32, value: u32) {
        self.texels.insert((texture, x, y), value);
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }
}

impl RenderBackend for RecordingBackend {
    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, EngineError> {
        if desc.size == 0 {
            return Err(EngineError::Device(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        let mut data = vec![0u8; desc.size as usize];
        if let Some(contents) = contents {
            let len = contents.len().min(data.len());
            data[..len].copy_from_slice(&contents[..len]);
        }
        Ok(BufferId(self.buffers.insert((desc.clone(), data))))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 || desc.mip_levels == 0 {
            return Err(EngineError::Device(format!(
                "texture '{}' has an empty extent",
                desc.label
            )));
        }
        Ok(TextureId(self.textures.insert(desc.clone())))
    }

    fn create_view(&mut self, desc: &ViewDesc) -> Result<ViewId, EngineError> {
        let texture = self
            .textures
            .get(desc.texture.0)
            .ok_or_else(|| EngineError::Device("view of a destroyed texture".into()))?;
        if desc.base_mip + desc.mip_count > texture.mip_levels
            || desc.base_layer + desc.layer_count > texture.layers
        {
            return Err(EngineError::Device(format!(
                "view range exceeds texture '{}'",
                texture.label
            )));
        }
        Ok(ViewId(self.views.insert(*desc)))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, EngineError> {
        Ok(SamplerId(self.samplers.insert(*desc)))
    }

    fn create_shader(&mut self, shader: &CompiledShader) -> Result<ShaderId, EngineError> {
        Ok(ShaderId(self.shaders.insert(shader.clone())))
    }

    fn destroy(&mut self, resource: ResourceId) {
        match resource {
            ResourceId::Buffer(id) => drop(self.buffers.remove(id.0)),
            ResourceId::Texture(id) => drop(self.textures.remove(id.0)),
            ResourceId::View(id) => drop(self.views.remove(id.0)),
            ResourceId::Sampler(id) => drop(self.samplers.remove(id.0)),
            ResourceId::Shader(id) => drop(self.shaders.remove(id.0)),
        }
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        if let Some((_, contents)) = self.buffers.get_mut(buffer.0) {
            let start = (offset as usize).min(contents.len());
            let len = data.len().min(contents.len() - start);
            contents[start..start + len].copy_from_slice(&data[..len]);
        }
        self.commands.push(Command::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    fn update_texture(&mut self, texture: TextureId, mip: u32, layer: u32, data: &[u8]) {
        self.commands.push(Command::UpdateTexture {
            texture,
            mip,
            layer,
            len: data.len(),
        });
    }

    fn set_render_states(&mut self, states: &RenderStates) {
        self.commands.push(Command::SetRenderStates(*states));
    }

    fn set_shader(&mut self, stage: ShaderStage, shader: Option<ShaderId>) {
        self.commands.push(Command::SetShader { stage, shader });
    }

    fn set_constant_buffers(&mut self, stage: ShaderStage, start_slot: u32, buffers: &[Option<BufferId>]) {
        self.commands.push(Command::SetConstantBuffers {
            stage,
            start_slot,
            buffers: buffers.to_vec(),
        });
    }

    fn set_shader_resources(&mut self, stage: ShaderStage, start_slot: u32, views: &[Option<ResourceView>]) {
        self.commands.push(Command::SetShaderResources {
            stage,
            start_slot,
            views: views.to_vec(),
        });
    }

    fn set_samplers(&mut self, stage: ShaderStage, start_slot: u32, samplers: &[Option<SamplerId>]) {
        self.commands.push(Command::SetSamplers {
            stage,
            start_slot,
            samplers: samplers.to_vec(),
        });
    }

    fn set_unordered_access(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        views: &[Option<ResourceView>],
        initial_counts: &[u32],
    ) {
        self.commands.push(Command::SetUnorderedAccess {
            stage,
            start_slot,
            views: views.to_vec(),
            initial_counts: initial_counts.to_vec(),
        });
    }

    fn set_render_targets(&mut self, colors: &[Option<ViewId>], depth: Option<ViewId>) {
        self.commands.push(Command::SetRenderTargets {
            colors: colors.to_vec(),
            depth,
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, _layout: Option<VertexLayout>) {
        self.commands.push(Command::SetVertexBuffer(buffer));
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferId>) {
        self.commands.push(Command::SetIndexBuffer(buffer));
    }

    fn clear_render_target(&mut self, view: ViewId, color: [f32; 4]) {
        self.commands.push(Command::ClearRenderTarget { view, color });
    }

    fn clear_depth_stencil(&mut self, view: ViewId, depth: f32) {
        self.commands.push(Command::ClearDepthStencil { view, depth });
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.commands.push(Command::Draw {
            vertex_count,
            start_vertex,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) {
        self.commands.push(Command::CopyTexture { src, dst });
    }

    fn read_texel_u32(&mut self, texture: TextureId, x: u32, y: u32) -> Option<u32> {
        self.submit();
        let desc = self.textures.get(texture.0)?;
        if x >= desc.width || y >= desc.height {
            return None;
        }
        Some(self.texels.get(&(texture, x, y)).copied().unwrap_or(0))
    }

    fn submit(&mut self) {
        self.commands.push(Command::Submit);
    }

    fn acquire_backbuffer(&mut self) -> Option<ViewId> {
        if self.backbuffer.is_none() {
            let texture = self
                .create_texture(&TextureDesc::d2(
                    "Backbuffer",
                    1,
                    1,
                    self.backbuffer_format(),
                    wgpu::TextureUsages::RENDER_ATTACHMENT,
                ))
                .ok()?;
            self.backbuffer = self.create_view(&ViewDesc::single(texture, 0, 0)).ok();
        }
        self.backbuffer
    }

    fn backbuffer_format(&self) -> wgpu::TextureFormat {
        wgpu::TextureFormat::Bgra8UnormSrgb
    }

    fn present(&mut self) {
        self.commands.push(Command::Present);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_updates_are_clamped_and_logged() {
        let mut backend = RecordingBackend::new();
        let buffer = backend
            .create_buffer(
                &BufferDesc {
                    label: "cb".into(),
                    size: 8,
                    kind: BufferKind::Constant,
                },
                None,
            )
            .unwrap();
        backend.update_buffer(buffer, 4, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(backend.buffer_contents(buffer), Some(&[0, 0, 0, 0, 1, 2, 3, 4][..]));
        assert_eq!(backend.count(|c| matches!(c, Command::UpdateBuffer { .. })), 1);
    }

    #[test]
    fn destroyed_ids_are_invalid() {
        let mut backend = RecordingBackend::new();
        let texture = backend
            .create_texture(&TextureDesc::d2(
                "t",
                4,
                4,
                wgpu::TextureFormat::R32Uint,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ))
            .unwrap();
        backend.set_texel(texture, 1, 1, 7);
        assert_eq!(backend.read_texel_u32(texture, 1, 1), Some(7));
        assert_eq!(backend.read_texel_u32(texture, 9, 1), None);

        backend.destroy(ResourceId::Texture(texture));
        assert!(backend.texture_desc(texture).is_none());
        assert!(backend.create_view(&ViewDesc::single(texture, 0, 0)).is_err());
    }
}
