//! [`RenderBackend`] on top of wgpu.
//!
//! wgpu has no immediate context, so this backend records one. Binding calls only update
//! the tracked slot state; each draw or dispatch resolves that state right away into a
//! cached pipeline and cached bind groups and appends an operation to the frame log.
//! [`submit`](RenderBackend::submit) replays the log into one command encoder:
//!
//! - consecutive draws into the same targets share one render pass
//! - clears become render passes with `LoadOp::Clear`
//! - buffer updates are staged and replayed as ordered buffer copies, so a draw always
//!   sees the constants that were current when it was recorded
//!
//! Slot spaces map onto bind groups (`b#` → group 0, `t#` → 1, `s#` → 2, `u#` → 3) and a
//! pipeline's bind group layouts are the union of its shaders' reflected bindings. Slots
//! the pipeline uses but nothing is bound to receive neutral dummy resources, and so does a
//! shader resource whose texture is also a current render target.

use super::*;
use crate::arena::Arena;
use crate::effect::reflection::{BindingKind, ReflectedBinding, SampleKind, ShaderReflection};
use crate::gpu::GpuContext;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use wgpu::util::DeviceExt;

const GROUP_COUNT: usize = 4;
const BIND_GROUP_CACHE_LIMIT: usize = 4096;

struct BufferEntry {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
}

struct TextureEntry {
    texture: Arc<wgpu::Texture>,
    desc: TextureDesc,
}

struct ViewEntry {
    view: Arc<wgpu::TextureView>,
    /// `None` for the swapchain image.
    texture: Option<TextureId>,
    dimension: wgpu::TextureViewDimension,
    format: wgpu::TextureFormat,
    sample_count: u32,
    width: u32,
    height: u32,
}

struct SamplerEntry {
    sampler: Arc<wgpu::Sampler>,
    comparison: bool,
}

struct ShaderEntry {
    module: Arc<wgpu::ShaderModule>,
    reflection: ShaderReflection,
}

#[derive(Default)]
struct StageSlots {
    constant_buffers: HashMap<u32, BufferId>,
    resources: HashMap<u32, ResourceView>,
    samplers: HashMap<u32, SamplerId>,
    unordered: HashMap<u32, ResourceView>,
}

#[derive(Default)]
struct BoundState {
    shaders: [Option<ShaderId>; 6],
    slots: [StageSlots; 6],
    states: RenderStates,
    colors: Vec<Option<ViewId>>,
    depth: Option<ViewId>,
    viewport: Option<Viewport>,
    vertex_buffer: Option<BufferId>,
    vertex_layout: Option<VertexLayout>,
    index_buffer: Option<BufferId>,
}

/// Where a layout entry takes its resource from.
#[derive(Clone)]
struct SlotSource {
    stage: ShaderStage,
    binding: ReflectedBinding,
}

struct GroupLayout {
    layout: Arc<wgpu::BindGroupLayout>,
    sources: Vec<SlotSource>,
}

struct RenderPipelineEntry {
    pipeline: Arc<wgpu::RenderPipeline>,
    groups: Vec<GroupLayout>,
}

struct ComputePipelineEntry {
    pipeline: Arc<wgpu::ComputePipeline>,
    groups: Vec<GroupLayout>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct RenderPipelineKey {
    vs: ShaderId,
    ps: Option<ShaderId>,
    cull_mode: Option<wgpu::Face>,
    depth_bias: i32,
    slope_scaled_depth_bias: u32,
    depth: Option<(wgpu::TextureFormat, DepthStencilState)>,
    blend: Option<wgpu::BlendState>,
    topology: wgpu::PrimitiveTopology,
    colors: Vec<Option<wgpu::TextureFormat>>,
    sample_count: u32,
    vertex: Option<(u64, Vec<(u64, u32, wgpu::VertexFormat)>)>,
}

enum Resolved {
    Buffer(Arc<wgpu::Buffer>),
    View(Arc<wgpu::TextureView>),
    Sampler(Arc<wgpu::Sampler>),
}

impl Resolved {
    fn address(&self) -> usize {
        match self {
            Resolved::Buffer(b) => Arc::as_ptr(b) as usize,
            Resolved::View(v) => Arc::as_ptr(v) as usize,
            Resolved::Sampler(s) => Arc::as_ptr(s) as usize,
        }
    }
}

#[derive(Clone, Copy)]
enum DrawCall {
    Plain { count: u32, start: u32 },
    Indexed { count: u32, start: u32, base_vertex: i32 },
}

struct DrawOp {
    target_ids: (Vec<Option<ViewId>>, Option<ViewId>),
    colors: Vec<Option<Arc<wgpu::TextureView>>>,
    depth: Option<Arc<wgpu::TextureView>>,
    pipeline: Arc<wgpu::RenderPipeline>,
    bind_groups: Vec<Arc<wgpu::BindGroup>>,
    vertex_buffer: Option<Arc<wgpu::Buffer>>,
    index_buffer: Option<Arc<wgpu::Buffer>>,
    viewport: Viewport,
    call: DrawCall,
}

enum Op {
    CopyBuffer {
        staging_offset: u64,
        dst: Arc<wgpu::Buffer>,
        offset: u64,
        size: u64,
    },
    ClearColor {
        view: Arc<wgpu::TextureView>,
        color: [f32; 4],
    },
    ClearDepth {
        view: Arc<wgpu::TextureView>,
        depth: f32,
    },
    Draw(Box<DrawOp>),
    Dispatch {
        pipeline: Arc<wgpu::ComputePipeline>,
        bind_groups: Vec<Arc<wgpu::BindGroup>>,
        groups: [u32; 3],
    },
    CopyTexture {
        src: Arc<wgpu::Texture>,
        dst: Arc<wgpu::Texture>,
        desc: TextureDesc,
    },
}

/// Dummy resources substituted for unbound or incompatible slots.
#[derive(Default)]
struct Dummies {
    uniform: HashMap<u64, Arc<wgpu::Buffer>>,
    storage: HashMap<u64, Arc<wgpu::Buffer>>,
    textures: HashMap<(SampleKind, wgpu::TextureViewDimension, bool), Arc<wgpu::TextureView>>,
    storage_textures: HashMap<(wgpu::TextureFormat, wgpu::TextureViewDimension), Arc<wgpu::TextureView>>,
    samplers: HashMap<bool, Arc<wgpu::Sampler>>,
}

/// The production device.
pub struct WgpuBackend {
    gpu: GpuContext,
    buffers: Arena<BufferEntry>,
    textures: Arena<TextureEntry>,
    views: Arena<ViewEntry>,
    samplers: Arena<SamplerEntry>,
    shaders: Arena<ShaderEntry>,
    state: BoundState,
    ops: Vec<Op>,
    staging: Vec<u8>,
    render_pipelines: HashMap<RenderPipelineKey, Arc<RenderPipelineEntry>>,
    compute_pipelines: HashMap<ShaderId, Arc<ComputePipelineEntry>>,
    layouts: HashMap<Vec<wgpu::BindGroupLayoutEntry>, Arc<wgpu::BindGroupLayout>>,
    bind_groups: HashMap<(usize, Vec<usize>), Arc<wgpu::BindGroup>>,
    dummies: Dummies,
    frame: Option<wgpu::SurfaceTexture>,
    backbuffer: Option<ViewId>,
    warned: HashSet<String>,
}

impl WgpuBackend {
    pub fn new(gpu: GpuContext) -> Self {
        Self {
            gpu,
            buffers: Arena::new(),
            textures: Arena::new(),
            views: Arena::new(),
            samplers: Arena::new(),
            shaders: Arena::new(),
            state: BoundState::default(),
            ops: Vec::new(),
            staging: Vec::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            dummies: Dummies::default(),
            frame: None,
            backbuffer: None,
            warned: HashSet::new(),
        }
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// Resizes the swapchain. Pending work is flushed first.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.submit();
        self.gpu.resize(width, height);
    }

    fn warn_once(&mut self, message: String) {
        if self.warned.insert(message.clone()) {
            log::warn!("{}", message);
        }
    }

    // ---------------------------------------------------------------------
    // Pipelines
    // ---------------------------------------------------------------------

    fn group_layouts(&mut self, stages: &[(ShaderStage, &ShaderReflection)]) -> Vec<GroupLayout> {
        let mut per_group: Vec<Vec<(wgpu::BindGroupLayoutEntry, SlotSource)>> =
            (0..GROUP_COUNT).map(|_| Vec::new()).collect();

        for (stage, reflection) in stages {
            let visibility = match stage {
                ShaderStage::Vertex => wgpu::ShaderStages::VERTEX,
                ShaderStage::Pixel => wgpu::ShaderStages::FRAGMENT,
                ShaderStage::Compute => wgpu::ShaderStages::COMPUTE,
                _ => continue,
            };
            for binding in &reflection.bindings {
                let group = &mut per_group[binding.space.group() as usize];
                let entry = layout_entry(binding, visibility);
                match group.iter_mut().find(|(e, _)| e.binding == binding.slot) {
                    Some((existing, source)) => {
                        existing.visibility |= visibility;
                        if existing.ty != entry.ty {
                            log::warn!(
                                "'{}' and '{}' disagree about slot {} of group {}",
                                source.binding.name,
                                binding.name,
                                binding.slot,
                                binding.space.group()
                            );
                        }
                        // Later stages own the slot.
                        *source = SlotSource {
                            stage: *stage,
                            binding: binding.clone(),
                        };
                    }
                    None => group.push((
                        entry,
                        SlotSource {
                            stage: *stage,
                            binding: binding.clone(),
                        },
                    )),
                }
            }
        }

        per_group
            .into_iter()
            .map(|mut group| {
                group.sort_by_key(|(e, _)| e.binding);
                let entries: Vec<_> = group.iter().map(|(e, _)| *e).collect();
                let layout = self
                    .layouts
                    .entry(entries.clone())
                    .or_insert_with(|| {
                        Arc::new(self.gpu.device.create_bind_group_layout(
                            &wgpu::BindGroupLayoutDescriptor {
                                label: Some("Effect Bind Group Layout"),
                                entries: &entries,
                            },
                        ))
                    })
                    .clone();
                GroupLayout {
                    layout,
                    sources: group.into_iter().map(|(_, s)| s).collect(),
                }
            })
            .collect()
    }

    fn pipeline_layout(&self, groups: &[GroupLayout]) -> wgpu::PipelineLayout {
        let layouts: Vec<&wgpu::BindGroupLayout> = groups.iter().map(|g| g.layout.as_ref()).collect();
        self.gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Effect Pipeline Layout"),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            })
    }

    fn render_pipeline(&mut self) -> Option<Arc<RenderPipelineEntry>> {
        let Some(vs) = self.state.shaders[ShaderStage::Vertex.index()] else {
            self.warn_once("draw without a vertex shader is skipped".into());
            return None;
        };
        let ps = self.state.shaders[ShaderStage::Pixel.index()];

        let mut colors = Vec::with_capacity(self.state.colors.len());
        let mut sample_count = None;
        for id in &self.state.colors {
            match id.and_then(|id| self.views.get(id.0)) {
                Some(view) => {
                    sample_count.get_or_insert(view.sample_count);
                    colors.push(Some(view.format));
                }
                None => colors.push(None),
            }
        }
        let depth_view = self.state.depth.and_then(|id| self.views.get(id.0));
        if let Some(view) = depth_view {
            sample_count.get_or_insert(view.sample_count);
        }
        let states = self.state.states;
        let key = RenderPipelineKey {
            vs,
            ps,
            cull_mode: states.rasterizer.cull_mode,
            depth_bias: states.rasterizer.depth_bias,
            slope_scaled_depth_bias: states.rasterizer.slope_scaled_depth_bias.to_bits(),
            depth: depth_view.map(|v| (v.format, states.depth_stencil)),
            blend: states.blend,
            topology: states.topology,
            colors,
            sample_count: sample_count.unwrap_or(1),
            vertex: self.state.vertex_layout.map(|layout| {
                (
                    layout.stride,
                    layout
                        .attributes
                        .iter()
                        .map(|a| (a.offset, a.shader_location, a.format))
                        .collect(),
                )
            }),
        };

        if let Some(entry) = self.render_pipelines.get(&key) {
            return Some(entry.clone());
        }

        let vs_entry = self.shaders.get(vs.0)?;
        let vs_module = vs_entry.module.clone();
        let vs_reflection = vs_entry.reflection.clone();
        let ps_parts = ps
            .and_then(|ps| self.shaders.get(ps.0))
            .map(|e| (e.module.clone(), e.reflection.clone()));

        if !vs_reflection.vertex_inputs.is_empty() {
            let provided: Vec<u32> = self
                .state
                .vertex_layout
                .map(|l| l.attributes.iter().map(|a| a.shader_location).collect())
                .unwrap_or_default();
            if let Some(missing) = vs_reflection
                .vertex_inputs
                .iter()
                .find(|loc| !provided.contains(loc))
            {
                self.warn_once(format!(
                    "'{}' reads vertex location {} that the bound layout lacks",
                    vs_reflection.entry_point, missing
                ));
                return None;
            }
        }

        let mut stages = vec![(ShaderStage::Vertex, &vs_reflection)];
        if let Some((_, reflection)) = &ps_parts {
            stages.push((ShaderStage::Pixel, reflection));
        }
        let groups = self.group_layouts(&stages);
        let layout = self.pipeline_layout(&groups);

        let attributes: Vec<wgpu::VertexAttribute> = self
            .state
            .vertex_layout
            .map(|l| l.attributes.to_vec())
            .unwrap_or_default();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = match self.state.vertex_layout {
            Some(l) if !vs_reflection.vertex_inputs.is_empty() => vec![wgpu::VertexBufferLayout {
                array_stride: l.stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }],
            _ => Vec::new(),
        };

        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .enumerate()
            .map(|(i, format)| {
                format.map(|format| {
                    let written = ps_parts
                        .as_ref()
                        .is_some_and(|(_, r)| r.fragment_outputs.contains(&(i as u32)));
                    let blendable = matches!(
                        format.sample_type(None, None),
                        Some(wgpu::TextureSampleType::Float { filterable: true })
                    );
                    wgpu::ColorTargetState {
                        format,
                        blend: if blendable { states.blend } else { None },
                        write_mask: if written {
                            wgpu::ColorWrites::ALL
                        } else {
                            wgpu::ColorWrites::empty()
                        },
                    }
                })
            })
            .collect();

        let depth_stencil = key.depth.map(|(format, ds)| wgpu::DepthStencilState {
            format,
            depth_write_enabled: ds.depth_test && ds.depth_write,
            depth_compare: if ds.depth_test {
                ds.compare
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState {
                constant: states.rasterizer.depth_bias,
                slope_scale: states.rasterizer.slope_scaled_depth_bias,
                clamp: 0.0,
            },
        });

        let label = format!(
            "{} / {}",
            vs_reflection.entry_point,
            ps_parts
                .as_ref()
                .map(|(_, r)| r.entry_point.as_str())
                .unwrap_or("-")
        );
        let pipeline = self
            .gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vs_module,
                    entry_point: Some(vs_reflection.entry_point.as_str()),
                    compilation_options: Default::default(),
                    buffers: &vertex_buffers,
                },
                primitive: wgpu::PrimitiveState {
                    topology: states.topology,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Cw,
                    cull_mode: states.rasterizer.cull_mode,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: key.sample_count,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                fragment: ps_parts.as_ref().map(|(module, reflection)| wgpu::FragmentState {
                    module,
                    entry_point: Some(reflection.entry_point.as_str()),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                multiview: None,
                cache: None,
            });
        log::debug!("Created render pipeline '{}'", label);

        let entry = Arc::new(RenderPipelineEntry {
            pipeline: Arc::new(pipeline),
            groups,
        });
        self.render_pipelines.insert(key, entry.clone());
        Some(entry)
    }

    fn compute_pipeline(&mut self) -> Option<Arc<ComputePipelineEntry>> {
        let Some(cs) = self.state.shaders[ShaderStage::Compute.index()] else {
            self.warn_once("dispatch without a compute shader is skipped".into());
            return None;
        };
        if let Some(entry) = self.compute_pipelines.get(&cs) {
            return Some(entry.clone());
        }
        let shader = self.shaders.get(cs.0)?;
        let module = shader.module.clone();
        let reflection = shader.reflection.clone();

        let groups = self.group_layouts(&[(ShaderStage::Compute, &reflection)]);
        let layout = self.pipeline_layout(&groups);
        let pipeline = self
            .gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&reflection.entry_point),
                layout: Some(&layout),
                module: &module,
                entry_point: Some(reflection.entry_point.as_str()),
                compilation_options: Default::default(),
                cache: None,
            });
        log::debug!("Created compute pipeline '{}'", reflection.entry_point);

        let entry = Arc::new(ComputePipelineEntry {
            pipeline: Arc::new(pipeline),
            groups,
        });
        self.compute_pipelines.insert(cs, entry.clone());
        Some(entry)
    }

    // ---------------------------------------------------------------------
    // Bind groups
    // ---------------------------------------------------------------------

    fn bind_groups_for(&mut self, groups: &[GroupLayout]) -> Vec<Arc<wgpu::BindGroup>> {
        let target_textures: Vec<TextureId> = self
            .state
            .colors
            .iter()
            .flatten()
            .chain(self.state.depth.iter())
            .filter_map(|id| self.views.get(id.0).and_then(|v| v.texture))
            .collect();

        let mut result = Vec::with_capacity(groups.len());
        for group in groups {
            let resolved: Vec<Resolved> = group
                .sources
                .iter()
                .map(|source| self.resolve(source, &target_textures))
                .collect();

            let key = (
                Arc::as_ptr(&group.layout) as usize,
                resolved.iter().map(Resolved::address).collect::<Vec<_>>(),
            );
            if let Some(bind_group) = self.bind_groups.get(&key) {
                result.push(bind_group.clone());
                continue;
            }

            let entries: Vec<wgpu::BindGroupEntry> = group
                .sources
                .iter()
                .zip(&resolved)
                .map(|(source, resource)| wgpu::BindGroupEntry {
                    binding: source.binding.slot,
                    resource: match resource {
                        Resolved::Buffer(buffer) => buffer.as_entire_binding(),
                        Resolved::View(view) => wgpu::BindingResource::TextureView(view),
                        Resolved::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                    },
                })
                .collect();
            let bind_group = Arc::new(self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Effect Bind Group"),
                layout: &group.layout,
                entries: &entries,
            }));

            if self.bind_groups.len() >= BIND_GROUP_CACHE_LIMIT {
                self.bind_groups.clear();
            }
            self.bind_groups.insert(key, bind_group.clone());
            result.push(bind_group);
        }
        result
    }

    fn resolve(&mut self, source: &SlotSource, target_textures: &[TextureId]) -> Resolved {
        let slots = &self.state.slots[source.stage.index()];
        let slot = source.binding.slot;
        match &source.binding.kind {
            BindingKind::UniformBuffer { size, .. } => {
                let bound = slots
                    .constant_buffers
                    .get(&slot)
                    .and_then(|id| self.buffers.get(id.0))
                    .filter(|b| b.size >= *size as u64)
                    .map(|b| b.buffer.clone());
                match bound {
                    Some(buffer) => Resolved::Buffer(buffer),
                    None => Resolved::Buffer(self.dummy_buffer(*size as u64, false)),
                }
            }
            BindingKind::StorageBuffer { read_only, size } => {
                let table = if *read_only {
                    &slots.resources
                } else {
                    &slots.unordered
                };
                let bound = match table.get(&slot) {
                    Some(ResourceView::Buffer(id)) => self.buffers.get(id.0).map(|b| b.buffer.clone()),
                    _ => None,
                };
                match bound {
                    Some(buffer) => Resolved::Buffer(buffer),
                    None => Resolved::Buffer(self.dummy_buffer(*size as u64, true)),
                }
            }
            BindingKind::Texture {
                sample,
                dimension,
                multisampled,
            } => {
                let bound = match slots.resources.get(&slot) {
                    Some(ResourceView::Texture(id)) => self.views.get(id.0),
                    _ => None,
                };
                let usable = bound
                    .filter(|view| {
                        view.dimension == dimension.to_wgpu()
                            && (view.sample_count > 1) == *multisampled
                            && sample_compatible(*sample, view.format)
                            && view.texture.is_none_or(|t| !target_textures.contains(&t))
                    })
                    .map(|view| view.view.clone());
                match usable {
                    Some(view) => Resolved::View(view),
                    None => Resolved::View(self.dummy_texture(*sample, dimension.to_wgpu(), *multisampled)),
                }
            }
            BindingKind::StorageTexture {
                format, dimension, ..
            } => {
                let bound = match slots.unordered.get(&slot) {
                    Some(ResourceView::Texture(id)) => self.views.get(id.0),
                    _ => None,
                };
                let usable = bound
                    .filter(|view| {
                        view.format == format.to_wgpu() && view.dimension == dimension.to_wgpu()
                    })
                    .map(|view| view.view.clone());
                match usable {
                    Some(view) => Resolved::View(view),
                    None => Resolved::View(self.dummy_storage_texture(format.to_wgpu(), dimension.to_wgpu())),
                }
            }
            BindingKind::Sampler { comparison } => {
                let bound = slots
                    .samplers
                    .get(&slot)
                    .and_then(|id| self.samplers.get(id.0))
                    .filter(|s| s.comparison == *comparison)
                    .map(|s| s.sampler.clone());
                match bound {
                    Some(sampler) => Resolved::Sampler(sampler),
                    None => Resolved::Sampler(self.dummy_sampler(*comparison)),
                }
            }
        }
    }

    fn dummy_buffer(&mut self, size: u64, storage: bool) -> Arc<wgpu::Buffer> {
        let size = size.max(16).next_multiple_of(16);
        let device = &self.gpu.device;
        let cache = if storage {
            &mut self.dummies.storage
        } else {
            &mut self.dummies.uniform
        };
        cache
            .entry(size)
            .or_insert_with(|| {
                Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Dummy Buffer"),
                    size,
                    usage: if storage {
                        wgpu::BufferUsages::STORAGE
                    } else {
                        wgpu::BufferUsages::UNIFORM
                    },
                    mapped_at_creation: false,
                }))
            })
            .clone()
    }

    fn dummy_texture(
        &mut self,
        sample: SampleKind,
        dimension: wgpu::TextureViewDimension,
        multisampled: bool,
    ) -> Arc<wgpu::TextureView> {
        let device = &self.gpu.device;
        self.dummies
            .textures
            .entry((sample, dimension, multisampled))
            .or_insert_with(|| {
                let format = match sample {
                    SampleKind::Float { .. } => wgpu::TextureFormat::Rgba8Unorm,
                    SampleKind::Depth => wgpu::TextureFormat::Depth32Float,
                    SampleKind::Uint => wgpu::TextureFormat::R32Uint,
                    SampleKind::Sint => wgpu::TextureFormat::R32Sint,
                };
                let mut usage = wgpu::TextureUsages::TEXTURE_BINDING;
                if multisampled {
                    usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
                }
                Arc::new(dummy_view(device, format, dimension, if multisampled { 4 } else { 1 }, usage))
            })
            .clone()
    }

    fn dummy_storage_texture(
        &mut self,
        format: wgpu::TextureFormat,
        dimension: wgpu::TextureViewDimension,
    ) -> Arc<wgpu::TextureView> {
        let device = &self.gpu.device;
        self.dummies
            .storage_textures
            .entry((format, dimension))
            .or_insert_with(|| {
                Arc::new(dummy_view(
                    device,
                    format,
                    dimension,
                    1,
                    wgpu::TextureUsages::STORAGE_BINDING,
                ))
            })
            .clone()
    }

    fn dummy_sampler(&mut self, comparison: bool) -> Arc<wgpu::Sampler> {
        let device = &self.gpu.device;
        self.dummies
            .samplers
            .entry(comparison)
            .or_insert_with(|| {
                Arc::new(device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("Dummy Sampler"),
                    compare: comparison.then_some(wgpu::CompareFunction::LessEqual),
                    ..Default::default()
                }))
            })
            .clone()
    }

    // ---------------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------------

    fn current_viewport(&self) -> Viewport {
        if let Some(viewport) = self.state.viewport {
            return viewport;
        }
        let first = self
            .state
            .colors
            .iter()
            .flatten()
            .chain(self.state.depth.iter())
            .find_map(|id| self.views.get(id.0));
        match first {
            Some(view) => Viewport::new(view.width as f32, view.height as f32),
            None => Viewport::new(1.0, 1.0),
        }
    }

    fn record_draw(&mut self, call: DrawCall) {
        if self.state.colors.iter().all(Option::is_none) && self.state.depth.is_none() {
            self.warn_once("draw without render targets is skipped".into());
            return;
        }
        let Some(pipeline) = self.render_pipeline() else {
            return;
        };
        let bind_groups = self.bind_groups_for(&pipeline.groups);

        let colors = self
            .state
            .colors
            .iter()
            .map(|id| id.and_then(|id| self.views.get(id.0)).map(|v| v.view.clone()))
            .collect();
        let depth = self
            .state
            .depth
            .and_then(|id| self.views.get(id.0))
            .map(|v| v.view.clone());
        let vertex_buffer = self
            .state
            .vertex_buffer
            .and_then(|id| self.buffers.get(id.0))
            .map(|b| b.buffer.clone());
        let index_buffer = self
            .state
            .index_buffer
            .and_then(|id| self.buffers.get(id.0))
            .map(|b| b.buffer.clone());

        if matches!(call, DrawCall::Indexed { .. }) && index_buffer.is_none() {
            self.warn_once("indexed draw without an index buffer is skipped".into());
            return;
        }

        let viewport = self.current_viewport();
        self.ops.push(Op::Draw(Box::new(DrawOp {
            target_ids: (self.state.colors.clone(), self.state.depth),
            colors,
            depth,
            pipeline: pipeline.pipeline.clone(),
            bind_groups,
            vertex_buffer,
            index_buffer,
            viewport,
            call,
        })));
    }

    fn encode_draws(encoder: &mut wgpu::CommandEncoder, draws: &[&DrawOp]) {
        let Some(first) = draws.first() else {
            return;
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = first
            .colors
            .iter()
            .map(|view| {
                view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Effect Pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: first.depth.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for draw in draws {
            pass.set_pipeline(&draw.pipeline);
            for (index, bind_group) in draw.bind_groups.iter().enumerate() {
                pass.set_bind_group(index as u32, bind_group.as_ref(), &[]);
            }
            let v = draw.viewport;
            pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
            if let Some(buffer) = &draw.vertex_buffer {
                pass.set_vertex_buffer(0, buffer.slice(..));
            }
            match draw.call {
                DrawCall::Plain { count, start } => pass.draw(start..start + count, 0..1),
                DrawCall::Indexed {
                    count,
                    start,
                    base_vertex,
                } => {
                    if let Some(buffer) = &draw.index_buffer {
                        pass.set_index_buffer(buffer.slice(..), wgpu::IndexFormat::Uint32);
                        pass.draw_indexed(start..start + count, base_vertex, 0..1);
                    }
                }
            }
        }
    }
}

fn layout_entry(binding: &ReflectedBinding, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    let ty = match &binding.kind {
        BindingKind::UniformBuffer { .. } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageBuffer { read_only, .. } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: *read_only,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Texture {
            sample,
            dimension,
            multisampled,
        } => wgpu::BindingType::Texture {
            sample_type: match sample {
                SampleKind::Float { filterable } => wgpu::TextureSampleType::Float {
                    filterable: *filterable,
                },
                SampleKind::Depth => wgpu::TextureSampleType::Depth,
                SampleKind::Uint => wgpu::TextureSampleType::Uint,
                SampleKind::Sint => wgpu::TextureSampleType::Sint,
            },
            view_dimension: dimension.to_wgpu(),
            multisampled: *multisampled,
        },
        BindingKind::StorageTexture {
            format,
            dimension,
            read_write,
        } => wgpu::BindingType::StorageTexture {
            access: if *read_write {
                wgpu::StorageTextureAccess::ReadWrite
            } else {
                wgpu::StorageTextureAccess::WriteOnly
            },
            format: format.to_wgpu(),
            view_dimension: dimension.to_wgpu(),
        },
        BindingKind::Sampler { comparison } => wgpu::BindingType::Sampler(if *comparison {
            wgpu::SamplerBindingType::Comparison
        } else {
            wgpu::SamplerBindingType::Filtering
        }),
    };
    wgpu::BindGroupLayoutEntry {
        binding: binding.slot,
        visibility,
        ty,
        count: None,
    }
}

fn sample_compatible(sample: SampleKind, format: wgpu::TextureFormat) -> bool {
    let actual = format.sample_type(None, None);
    match sample {
        SampleKind::Float { filterable: true } => {
            actual == Some(wgpu::TextureSampleType::Float { filterable: true })
        }
        SampleKind::Float { filterable: false } => matches!(
            actual,
            Some(wgpu::TextureSampleType::Float { .. } | wgpu::TextureSampleType::Depth)
        ),
        SampleKind::Depth => actual == Some(wgpu::TextureSampleType::Depth),
        SampleKind::Uint => actual == Some(wgpu::TextureSampleType::Uint),
        SampleKind::Sint => actual == Some(wgpu::TextureSampleType::Sint),
    }
}

fn dummy_view(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    dimension: wgpu::TextureViewDimension,
    sample_count: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::TextureView {
    let (texture_dimension, layers) = match dimension {
        wgpu::TextureViewDimension::D1 => (wgpu::TextureDimension::D1, 1),
        wgpu::TextureViewDimension::D3 => (wgpu::TextureDimension::D3, 1),
        wgpu::TextureViewDimension::Cube | wgpu::TextureViewDimension::CubeArray => {
            (wgpu::TextureDimension::D2, 6)
        }
        _ => (wgpu::TextureDimension::D2, 1),
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Dummy Texture"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: layers,
        },
        mip_level_count: 1,
        sample_count,
        dimension: texture_dimension,
        format,
        usage,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("Dummy View"),
        dimension: Some(dimension),
        ..Default::default()
    })
}

fn texture_dimension_size(desc: &TextureDesc, mip: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: (desc.width >> mip).max(1),
        height: (desc.height >> mip).max(1),
        depth_or_array_layers: desc.layers,
    }
}

impl RenderBackend for WgpuBackend {
    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, EngineError> {
        if desc.size == 0 {
            return Err(EngineError::Device(format!("buffer '{}' has zero size", desc.label)));
        }
        let size = desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let usage = wgpu::BufferUsages::COPY_DST
            | match desc.kind {
                BufferKind::Constant => wgpu::BufferUsages::UNIFORM,
                BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
                BufferKind::Index => wgpu::BufferUsages::INDEX,
                BufferKind::Storage => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            };
        let buffer = match contents {
            Some(contents) => {
                let mut padded = contents.to_vec();
                padded.resize(size as usize, 0);
                self.gpu
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&desc.label),
                        contents: &padded,
                        usage,
                    })
            }
            None => self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size,
                usage,
                mapped_at_creation: false,
            }),
        };
        Ok(BufferId(self.buffers.insert(BufferEntry {
            buffer: Arc::new(buffer),
            size,
        })))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 || desc.mip_levels == 0 {
            return Err(EngineError::Device(format!(
                "texture '{}' has an empty extent",
                desc.label
            )));
        }
        let mut usage = desc.usage;
        if desc.sample_count == 1 {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        }
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage,
            view_formats: &[],
        });
        Ok(TextureId(self.textures.insert(TextureEntry {
            texture: Arc::new(texture),
            desc: desc.clone(),
        })))
    }

    fn create_view(&mut self, desc: &ViewDesc) -> Result<ViewId, EngineError> {
        let entry = self
            .textures
            .get(desc.texture.0)
            .ok_or_else(|| EngineError::Device("view of a destroyed texture".into()))?;
        if desc.base_mip + desc.mip_count > entry.desc.mip_levels
            || desc.base_layer + desc.layer_count > entry.desc.layers
        {
            return Err(EngineError::Device(format!(
                "view range exceeds texture '{}'",
                entry.desc.label
            )));
        }
        let view = entry.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&entry.desc.label),
            dimension: Some(desc.dimension),
            base_mip_level: desc.base_mip,
            mip_level_count: Some(desc.mip_count),
            base_array_layer: desc.base_layer,
            array_layer_count: Some(desc.layer_count),
            ..Default::default()
        });
        let view_entry = ViewEntry {
            view: Arc::new(view),
            texture: Some(desc.texture),
            dimension: desc.dimension,
            format: entry.desc.format,
            sample_count: entry.desc.sample_count,
            width: (entry.desc.width >> desc.base_mip).max(1),
            height: (entry.desc.height >> desc.base_mip).max(1),
        };
        Ok(ViewId(self.views.insert(view_entry)))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, EngineError> {
        let sampler = self.gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Effect Sampler"),
            address_mode_u: desc.address_mode,
            address_mode_v: desc.address_mode,
            address_mode_w: desc.address_mode,
            mag_filter: desc.mag_filter,
            min_filter: desc.min_filter,
            mipmap_filter: desc.mipmap_filter,
            compare: desc.compare,
            anisotropy_clamp: desc.anisotropy.max(1),
            ..Default::default()
        });
        Ok(SamplerId(self.samplers.insert(SamplerEntry {
            sampler: Arc::new(sampler),
            comparison: desc.compare.is_some(),
        })))
    }

    fn create_shader(&mut self, shader: &CompiledShader) -> Result<ShaderId, EngineError> {
        let module = self
            .gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&shader.name),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(shader.source.clone())),
            });
        Ok(ShaderId(self.shaders.insert(ShaderEntry {
            module: Arc::new(module),
            reflection: shader.reflection.clone(),
        })))
    }

    fn destroy(&mut self, resource: ResourceId) {
        match resource {
            ResourceId::Buffer(id) => drop(self.buffers.remove(id.0)),
            ResourceId::Texture(id) => drop(self.textures.remove(id.0)),
            ResourceId::View(id) => drop(self.views.remove(id.0)),
            ResourceId::Sampler(id) => drop(self.samplers.remove(id.0)),
            ResourceId::Shader(id) => {
                drop(self.shaders.remove(id.0));
                self.render_pipelines
                    .retain(|key, _| key.vs != id && key.ps != Some(id));
                self.compute_pipelines.remove(&id);
            }
        }
        // Freed objects can share an address with new ones.
        self.bind_groups.clear();
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        let Some(entry) = self.buffers.get(buffer.0) else {
            return;
        };
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset >= entry.size {
            log::warn!("Ignoring buffer update at unaligned or out-of-range offset {}", offset);
            return;
        }
        let len = (data.len() as u64).min(entry.size - offset);
        let size = len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if size == 0 {
            return;
        }
        let staging_offset = self.staging.len() as u64;
        self.staging.extend_from_slice(&data[..len as usize]);
        self.staging.resize((staging_offset + size) as usize, 0);
        self.ops.push(Op::CopyBuffer {
            staging_offset,
            dst: entry.buffer.clone(),
            offset,
            size,
        });
    }

    fn update_texture(&mut self, texture: TextureId, mip: u32, layer: u32, data: &[u8]) {
        // Uploads go straight to the queue, so earlier recorded work must run first.
        if !self.ops.is_empty() {
            self.submit();
        }
        let Some(entry) = self.textures.get(texture.0) else {
            return;
        };
        let size = texture_dimension_size(&entry.desc, mip);
        let block = entry.desc.format.block_copy_size(None).unwrap_or(4);
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: mip,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * block),
                rows_per_image: Some(size.height),
            },
            wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn set_render_states(&mut self, states: &RenderStates) {
        self.state.states = *states;
    }

    fn set_shader(&mut self, stage: ShaderStage, shader: Option<ShaderId>) {
        if shader.is_some()
            && matches!(stage, ShaderStage::Hull | ShaderStage::Domain | ShaderStage::Geometry)
        {
            self.warn_once(format!("{} shaders are not supported and are ignored", stage.name()));
            return;
        }
        self.state.shaders[stage.index()] = shader;
    }

    fn set_constant_buffers(&mut self, stage: ShaderStage, start_slot: u32, buffers: &[Option<BufferId>]) {
        let table = &mut self.state.slots[stage.index()].constant_buffers;
        for (i, buffer) in buffers.iter().enumerate() {
            let slot = start_slot + i as u32;
            match buffer {
                Some(id) => table.insert(slot, *id),
                None => table.remove(&slot),
            };
        }
    }

    fn set_shader_resources(&mut self, stage: ShaderStage, start_slot: u32, views: &[Option<ResourceView>]) {
        let table = &mut self.state.slots[stage.index()].resources;
        for (i, view) in views.iter().enumerate() {
            let slot = start_slot + i as u32;
            match view {
                Some(view) => table.insert(slot, *view),
                None => table.remove(&slot),
            };
        }
    }

    fn set_samplers(&mut self, stage: ShaderStage, start_slot: u32, samplers: &[Option<SamplerId>]) {
        let table = &mut self.state.slots[stage.index()].samplers;
        for (i, sampler) in samplers.iter().enumerate() {
            let slot = start_slot + i as u32;
            match sampler {
                Some(id) => table.insert(slot, *id),
                None => table.remove(&slot),
            };
        }
    }

    fn set_unordered_access(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        views: &[Option<ResourceView>],
        initial_counts: &[u32],
    ) {
        if initial_counts.iter().any(|&c| c != u32::MAX) {
            self.warn_once("UAV counters do not exist in WGSL; initial counts are ignored".into());
        }
        let table = &mut self.state.slots[stage.index()].unordered;
        for (i, view) in views.iter().enumerate() {
            let slot = start_slot + i as u32;
            match view {
                Some(view) => table.insert(slot, *view),
                None => table.remove(&slot),
            };
        }
    }

    fn set_render_targets(&mut self, colors: &[Option<ViewId>], depth: Option<ViewId>) {
        self.state.colors = colors.to_vec();
        self.state.depth = depth;
        self.state.viewport = None;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = Some(viewport);
    }

    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, layout: Option<VertexLayout>) {
        self.state.vertex_buffer = buffer;
        self.state.vertex_layout = layout;
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferId>) {
        self.state.index_buffer = buffer;
    }

    fn clear_render_target(&mut self, view: ViewId, color: [f32; 4]) {
        if let Some(entry) = self.views.get(view.0) {
            self.ops.push(Op::ClearColor {
                view: entry.view.clone(),
                color,
            });
        }
    }

    fn clear_depth_stencil(&mut self, view: ViewId, depth: f32) {
        if let Some(entry) = self.views.get(view.0) {
            self.ops.push(Op::ClearDepth {
                view: entry.view.clone(),
                depth,
            });
        }
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.record_draw(DrawCall::Plain {
            count: vertex_count,
            start: start_vertex,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.record_draw(DrawCall::Indexed {
            count: index_count,
            start: start_index,
            base_vertex,
        });
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        let Some(pipeline) = self.compute_pipeline() else {
            return;
        };
        let bind_groups = self.bind_groups_for(&pipeline.groups);
        self.ops.push(Op::Dispatch {
            pipeline: pipeline.pipeline.clone(),
            bind_groups,
            groups: [groups_x, groups_y, groups_z],
        });
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) {
        let (Some(src), Some(dst)) = (self.textures.get(src.0), self.textures.get(dst.0)) else {
            return;
        };
        if src.desc.width != dst.desc.width
            || src.desc.height != dst.desc.height
            || src.desc.layers != dst.desc.layers
            || src.desc.mip_levels != dst.desc.mip_levels
            || src.desc.format != dst.desc.format
        {
            log::warn!(
                "Cannot copy '{}' into '{}': descriptions differ",
                src.desc.label,
                dst.desc.label
            );
            return;
        }
        self.ops.push(Op::CopyTexture {
            src: src.texture.clone(),
            dst: dst.texture.clone(),
            desc: src.desc.clone(),
        });
    }

    fn read_texel_u32(&mut self, texture: TextureId, x: u32, y: u32) -> Option<u32> {
        self.submit();
        let entry = self.textures.get(texture.0)?;
        if x >= entry.desc.width || y >= entry.desc.height {
            return None;
        }
        let device = &self.gpu.device;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Texel Readback"),
            size: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Texel Readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        if let Err(e) = device.poll(wgpu::PollType::wait_indefinitely()) {
            log::warn!("Texel readback wait failed: {}", e);
            return None;
        }
        match receiver.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Texel readback failed: {}", e);
                return None;
            }
            Err(_) => {
                log::warn!("Texel readback did not complete");
                return None;
            }
        }

        let value = {
            let data = slice.get_mapped_range();
            u32::from_le_bytes([data[0], data[1], data[2], data[3]])
        };
        readback.unmap();
        Some(value)
    }

    fn submit(&mut self) {
        if self.ops.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.ops);
        let staging = std::mem::take(&mut self.staging);
        let device = &self.gpu.device;

        let staging_buffer = (!staging.is_empty()).then(|| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Frame Staging"),
                contents: &staging,
                usage: wgpu::BufferUsages::COPY_SRC,
            })
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });

        let mut i = 0;
        while i < ops.len() {
            match &ops[i] {
                Op::Draw(first) => {
                    let mut batch = vec![first.as_ref()];
                    let mut j = i + 1;
                    while let Some(Op::Draw(next)) = ops.get(j) {
                        if next.target_ids != first.target_ids {
                            break;
                        }
                        batch.push(next.as_ref());
                        j += 1;
                    }
                    Self::encode_draws(&mut encoder, &batch);
                    i = j;
                    continue;
                }
                Op::CopyBuffer {
                    staging_offset,
                    dst,
                    offset,
                    size,
                } => {
                    if let Some(staging) = &staging_buffer {
                        encoder.copy_buffer_to_buffer(staging, *staging_offset, dst, *offset, *size);
                    }
                }
                Op::ClearColor { view, color } => {
                    let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Clear"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color {
                                    r: color[0] as f64,
                                    g: color[1] as f64,
                                    b: color[2] as f64,
                                    a: color[3] as f64,
                                }),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                Op::ClearDepth { view, depth } => {
                    let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Clear Depth"),
                        color_attachments: &[],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Clear(*depth),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                Op::Dispatch {
                    pipeline,
                    bind_groups,
                    groups,
                } => {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Effect Dispatch"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    for (index, bind_group) in bind_groups.iter().enumerate() {
                        pass.set_bind_group(index as u32, bind_group.as_ref(), &[]);
                    }
                    pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                }
                Op::CopyTexture { src, dst, desc } => {
                    for mip in 0..desc.mip_levels {
                        encoder.copy_texture_to_texture(
                            wgpu::TexelCopyTextureInfo {
                                texture: src,
                                mip_level: mip,
                                origin: wgpu::Origin3d::ZERO,
                                aspect: wgpu::TextureAspect::All,
                            },
                            wgpu::TexelCopyTextureInfo {
                                texture: dst,
                                mip_level: mip,
                                origin: wgpu::Origin3d::ZERO,
                                aspect: wgpu::TextureAspect::All,
                            },
                            texture_dimension_size(desc, mip),
                        );
                    }
                }
            }
            i += 1;
        }

        self.gpu.queue.submit(Some(encoder.finish()));
    }

    fn acquire_backbuffer(&mut self) -> Option<ViewId> {
        if let Some(view) = self.backbuffer {
            return Some(view);
        }
        let surface = self.gpu.surface.as_ref()?;
        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                surface.configure(&self.gpu.device, &self.gpu.config);
                surface.get_current_texture().ok()?
            }
            Err(e) => {
                log::warn!("Failed to acquire swapchain image: {}", e);
                return None;
            }
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = ViewId(self.views.insert(ViewEntry {
            view: Arc::new(view),
            texture: None,
            dimension: wgpu::TextureViewDimension::D2,
            format: self.gpu.config.format,
            sample_count: 1,
            width: frame.texture.width(),
            height: frame.texture.height(),
        }));
        self.frame = Some(frame);
        self.backbuffer = Some(id);
        Some(id)
    }

    fn backbuffer_format(&self) -> wgpu::TextureFormat {
        self.gpu.config.format
    }

    fn present(&mut self) {
        self.submit();
        if let Some(view) = self.backbuffer.take() {
            self.views.remove(view.0);
        }
        if let Some(frame) = self.frame.take() {
            frame.present();
        }
    }
}
