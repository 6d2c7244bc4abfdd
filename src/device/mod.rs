//! Immediate-context rendering device.
//!
//! [`RenderBackend`] is the boundary between the engine and the GPU. It follows the
//! immediate-context model: shaders, constant buffers, shader resources, samplers and
//! unordered-access views are bound to numbered slots per [`ShaderStage`], render states
//! and targets are set explicitly, and every draw or dispatch consumes whatever is bound
//! at that moment. Binding a slot overwrites it for every later call until it is rebound.
//!
//! Two implementations ship with the crate:
//!
//! - [`WgpuBackend`] records the calls and replays them on `wgpu` at [`RenderBackend::submit`]
//! - [`RecordingBackend`] keeps the calls as a [`Command`] log without touching a GPU
//!
//! Resources are addressed by small typed ids ([`BufferId`], [`TextureId`], [`ViewId`],
//! [`SamplerId`], [`ShaderId`]) backed by generation-checked arena handles, so an id used
//! after [`RenderBackend::destroy`] is simply ignored.

mod recording;
mod wgpu_backend;

pub use recording::{Command, RecordingBackend};
pub use wgpu_backend::WgpuBackend;

use crate::arena::RawHandle;
use crate::effect::CompiledShader;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Programmable pipeline stages, in binding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Geometry,
        ShaderStage::Pixel,
        ShaderStage::Compute,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Hull => "hull",
            ShaderStage::Domain => "domain",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Pixel => "pixel",
            ShaderStage::Compute => "compute",
        }
    }
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            pub fn raw(&self) -> RawHandle {
                self.0
            }
        }
    };
}

resource_id!(
    /// A GPU buffer.
    BufferId
);
resource_id!(
    /// A GPU texture.
    TextureId
);
resource_id!(
    /// A view onto a texture (shader resource, render target, depth or storage view).
    ViewId
);
resource_id!(
    /// A sampler state object.
    SamplerId
);
resource_id!(
    /// A created shader stage object.
    ShaderId
);

/// Any resource id, for [`RenderBackend::destroy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
    View(ViewId),
    Sampler(SamplerId),
    Shader(ShaderId),
}

/// A resource bound to a shader-resource or unordered-access slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceView {
    Texture(ViewId),
    Buffer(BufferId),
}

impl From<ViewId> for ResourceView {
    fn from(view: ViewId) -> Self {
        ResourceView::Texture(view)
    }
}

impl From<BufferId> for ResourceView {
    fn from(buffer: BufferId) -> Self {
        ResourceView::Buffer(buffer)
    }
}

/// What a buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Constant,
    Vertex,
    Index,
    /// Structured/raw buffer readable as a shader resource and writable as a UAV.
    Storage,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub kind: BufferKind,
}

/// Texture shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D2,
    /// `layers` array slices.
    D2Array,
    /// Six faces, stored as a 6-layer array.
    Cube,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub kind: TextureKind,
    pub width: u32,
    pub height: u32,
    /// Array slices (6 for cubes, 1 for plain 2D).
    pub layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TextureDesc {
    /// A single-mip, single-sample 2D texture.
    pub fn d2(
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self {
            label: label.to_string(),
            kind: TextureKind::D2,
            width,
            height,
            layers: 1,
            mip_levels: 1,
            sample_count: 1,
            format,
            usage,
        }
    }
}

/// Which part of a texture a view exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub texture: TextureId,
    pub dimension: wgpu::TextureViewDimension,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ViewDesc {
    /// Every mip and layer of a 2D texture.
    pub fn whole_2d(texture: TextureId, mip_count: u32) -> Self {
        Self {
            texture,
            dimension: wgpu::TextureViewDimension::D2,
            base_mip: 0,
            mip_count,
            base_layer: 0,
            layer_count: 1,
        }
    }

    /// A single mip of a single layer, as used for render targets and storage writes.
    pub fn single(texture: TextureId, mip: u32, layer: u32) -> Self {
        Self {
            texture,
            dimension: wgpu::TextureViewDimension::D2,
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub address_mode: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
    pub compare: Option<wgpu::CompareFunction>,
    pub anisotropy: u16,
}

impl SamplerDesc {
    pub const LINEAR_WRAP: SamplerDesc = SamplerDesc {
        address_mode: wgpu::AddressMode::Repeat,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        compare: None,
        anisotropy: 1,
    };

    pub const LINEAR_CLAMP: SamplerDesc = SamplerDesc {
        address_mode: wgpu::AddressMode::ClampToEdge,
        ..Self::LINEAR_WRAP
    };

    pub const POINT_CLAMP: SamplerDesc = SamplerDesc {
        address_mode: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::FilterMode::Nearest,
        compare: None,
        anisotropy: 1,
    };

    /// Comparison sampler for hardware PCF. A receiver passes when its depth is not behind
    /// the stored occluder depth.
    pub const SHADOW_COMPARISON: SamplerDesc = SamplerDesc {
        address_mode: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        compare: Some(wgpu::CompareFunction::LessEqual),
        anisotropy: 1,
    };
}

/// Rasterizer state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizerState {
    pub cull_mode: Option<wgpu::Face>,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_mode: Some(wgpu::Face::Back),
            depth_bias: 0,
            slope_scaled_depth_bias: 0.0,
        }
    }
}

/// Depth test state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: wgpu::CompareFunction,
}

impl DepthStencilState {
    /// Reversed-Z opaque geometry: nearer fragments have larger depth.
    pub const REVERSED_Z: DepthStencilState = DepthStencilState {
        depth_test: true,
        depth_write: true,
        compare: wgpu::CompareFunction::GreaterEqual,
    };

    /// Conventional depth, used for shadow maps.
    pub const LESS_EQUAL: DepthStencilState = DepthStencilState {
        depth_test: true,
        depth_write: true,
        compare: wgpu::CompareFunction::LessEqual,
    };

    pub const DISABLED: DepthStencilState = DepthStencilState {
        depth_test: false,
        depth_write: false,
        compare: wgpu::CompareFunction::Always,
    };
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self::REVERSED_Z
    }
}

/// Complete fixed-function state of a pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderStates {
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    /// Applied to every color target that supports blending.
    pub blend: Option<wgpu::BlendState>,
    pub topology: wgpu::PrimitiveTopology,
}

impl Default for RenderStates {
    fn default() -> Self {
        Self {
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            blend: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
        }
    }
}

impl RenderStates {
    /// No culling, no depth, no blending: full-screen triangle passes.
    pub fn fullscreen() -> Self {
        Self {
            rasterizer: RasterizerState {
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: DepthStencilState::DISABLED,
            ..Default::default()
        }
    }
}

/// Vertex buffer layout bound alongside a vertex buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexLayout {
    pub stride: u64,
    pub attributes: &'static [wgpu::VertexAttribute],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// An immediate-context rendering device.
///
/// Creation methods return errors; binding and drawing never fail. Ids that are stale or
/// belong to the wrong kind of resource are treated as unbound.
pub trait RenderBackend {
    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, EngineError>;
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError>;
    fn create_view(&mut self, desc: &ViewDesc) -> Result<ViewId, EngineError>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, EngineError>;
    fn create_shader(&mut self, shader: &CompiledShader) -> Result<ShaderId, EngineError>;
    fn destroy(&mut self, resource: ResourceId);

    /// Replaces `data.len()` bytes at `offset`. Ordered with respect to draws: a draw
    /// recorded before the update sees the old contents.
    fn update_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]);
    /// Uploads tightly packed texel rows into one mip of one layer.
    fn update_texture(&mut self, texture: TextureId, mip: u32, layer: u32, data: &[u8]);

    fn set_render_states(&mut self, states: &RenderStates);
    fn set_shader(&mut self, stage: ShaderStage, shader: Option<ShaderId>);
    fn set_constant_buffers(&mut self, stage: ShaderStage, start_slot: u32, buffers: &[Option<BufferId>]);
    fn set_shader_resources(&mut self, stage: ShaderStage, start_slot: u32, views: &[Option<ResourceView>]);
    fn set_samplers(&mut self, stage: ShaderStage, start_slot: u32, samplers: &[Option<SamplerId>]);
    /// Binds read/write resources. `initial_counts[i]` of `u32::MAX` keeps the current counter.
    fn set_unordered_access(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        views: &[Option<ResourceView>],
        initial_counts: &[u32],
    );
    fn set_render_targets(&mut self, colors: &[Option<ViewId>], depth: Option<ViewId>);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, layout: Option<VertexLayout>);
    fn set_index_buffer(&mut self, buffer: Option<BufferId>);

    fn clear_render_target(&mut self, view: ViewId, color: [f32; 4]);
    fn clear_depth_stencil(&mut self, view: ViewId, depth: f32);

    fn draw(&mut self, vertex_count: u32, start_vertex: u32);
    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32);
    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32);

    /// Copies every mip and layer of `src` into `dst`. Both must have identical descriptions.
    fn copy_texture(&mut self, src: TextureId, dst: TextureId);
    /// Flushes pending work and reads one texel of an `R32Uint` texture.
    fn read_texel_u32(&mut self, texture: TextureId, x: u32, y: u32) -> Option<u32>;

    /// Executes everything recorded since the last submit.
    fn submit(&mut self);
    /// A render-target view of the next swapchain image, if there is a swapchain.
    fn acquire_backbuffer(&mut self) -> Option<ViewId>;
    fn backbuffer_format(&self) -> wgpu::TextureFormat;
    fn present(&mut self);
}

