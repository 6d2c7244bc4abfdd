//! A named combination of stage shaders plus fixed-function state.
//!
//! Each stage keeps the slot masks its shader was reflected with; they never change after
//! the pass is created. Only the resources sitting in the effect's shared slot tables
//! change between applies.

use super::binding::{EffectTables, SlotMask, bind_ranges, mask_with};
use super::constant_buffer::{CBufferData, ConstantBufferVariable};
use super::reflection::{BindingKind, ShaderReflection, SlotSpace};
use crate::device::{
    DepthStencilState, RasterizerState, RenderBackend, RenderStates, ShaderId, ShaderStage,
};

/// Name of the per-pass uniform block in WGSL.
pub const PARAMS_BLOCK: &str = "params";

/// One stage of a pass.
#[derive(Debug)]
pub struct StageInfo {
    pub shader_name: String,
    pub shader: ShaderId,
    pub reflection: ShaderReflection,
    pub constant_buffer_mask: SlotMask,
    pub sampler_mask: SlotMask,
    pub shader_resource_mask: SlotMask,
    pub unordered_access_mask: SlotMask,
    /// Per-pass copy of the stage's `params` block.
    pub params: Option<CBufferData>,
}

impl StageInfo {
    pub(crate) fn new(shader_name: &str, shader: ShaderId, reflection: &ShaderReflection) -> Self {
        let mut info = Self {
            shader_name: shader_name.to_string(),
            shader,
            reflection: reflection.clone(),
            constant_buffer_mask: 0,
            sampler_mask: 0,
            shader_resource_mask: 0,
            unordered_access_mask: 0,
            params: None,
        };
        for binding in &reflection.bindings {
            match binding.space {
                SlotSpace::ConstantBuffer => {
                    if binding.name == PARAMS_BLOCK {
                        if let BindingKind::UniformBuffer { size, members } = &binding.kind {
                            let name = format!("{}.{}", shader_name, PARAMS_BLOCK);
                            info.params =
                                Some(CBufferData::new(&name, binding.slot, *size, members.clone()));
                        }
                    } else {
                        info.constant_buffer_mask = mask_with(info.constant_buffer_mask, binding.slot);
                    }
                }
                SlotSpace::Sampler => info.sampler_mask = mask_with(info.sampler_mask, binding.slot),
                SlotSpace::ShaderResource => {
                    info.shader_resource_mask = mask_with(info.shader_resource_mask, binding.slot)
                }
                SlotSpace::UnorderedAccess => {
                    info.unordered_access_mask = mask_with(info.unordered_access_mask, binding.slot)
                }
            }
        }
        info
    }
}

/// A pass of an [`EffectHelper`](super::EffectHelper).
#[derive(Debug)]
pub struct EffectPass {
    name: String,
    stages: [Option<StageInfo>; 6],
    states: RenderStates,
}

impl EffectPass {
    pub(crate) fn new(name: &str, stages: [Option<StageInfo>; 6]) -> Self {
        Self {
            name: name.to_string(),
            stages,
            states: RenderStates::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&StageInfo> {
        self.stages[stage.index()].as_ref()
    }

    pub(crate) fn stage_mut(&mut self, stage: ShaderStage) -> Option<&mut StageInfo> {
        self.stages[stage.index()].as_mut()
    }

    pub fn render_states(&self) -> &RenderStates {
        &self.states
    }

    pub fn set_render_states(&mut self, states: RenderStates) {
        self.states = states;
    }

    pub fn set_rasterizer_state(&mut self, state: RasterizerState) {
        self.states.rasterizer = state;
    }

    pub fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        self.states.depth_stencil = state;
    }

    pub fn set_blend_state(&mut self, state: Option<wgpu::BlendState>) {
        self.states.blend = state;
    }

    pub fn set_topology(&mut self, topology: wgpu::PrimitiveTopology) {
        self.states.topology = topology;
    }

    /// A member of a stage's `params` block.
    pub fn get_param_by_name(
        &mut self,
        stage: ShaderStage,
        name: &str,
    ) -> Option<ConstantBufferVariable<'_>> {
        self.stages[stage.index()]
            .as_mut()?
            .params
            .as_mut()?
            .variable(name)
    }

    pub fn get_vs_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Vertex, name)
    }

    pub fn get_hs_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Hull, name)
    }

    pub fn get_ds_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Domain, name)
    }

    pub fn get_gs_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Geometry, name)
    }

    pub fn get_ps_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Pixel, name)
    }

    pub fn get_cs_param_by_name(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        self.get_param_by_name(ShaderStage::Compute, name)
    }

    /// Binds the pass: render states, every stage's shader (absent stages are unbound),
    /// then one call per contiguous slot run for constant buffers, `params`, samplers,
    /// shader resources and, on pixel and compute stages, unordered-access views.
    pub fn apply(&mut self, tables: &mut EffectTables, backend: &mut dyn RenderBackend) {
        backend.set_render_states(&self.states);

        for stage in ShaderStage::ALL {
            let Some(info) = self.stages[stage.index()].as_mut() else {
                backend.set_shader(stage, None);
                continue;
            };
            backend.set_shader(stage, Some(info.shader));

            for run in bind_ranges(info.constant_buffer_mask) {
                let buffers: Vec<_> = run
                    .clone()
                    .map(|slot| {
                        tables
                            .constant_buffers
                            .get_mut(&slot)
                            .and_then(|cb| cb.flush(backend))
                    })
                    .collect();
                backend.set_constant_buffers(stage, run.start, &buffers);
            }

            if let Some(params) = info.params.as_mut() {
                let buffer = params.flush(backend);
                backend.set_constant_buffers(stage, params.slot, &[buffer]);
            }

            for run in bind_ranges(info.sampler_mask) {
                let samplers: Vec<_> = run
                    .clone()
                    .map(|slot| tables.samplers.get(&slot).and_then(|s| s.sampler))
                    .collect();
                backend.set_samplers(stage, run.start, &samplers);
            }

            for run in bind_ranges(info.shader_resource_mask) {
                let views: Vec<_> = run
                    .clone()
                    .map(|slot| tables.shader_resources.get(&slot).and_then(|s| s.view))
                    .collect();
                backend.set_shader_resources(stage, run.start, &views);
            }

            if matches!(stage, ShaderStage::Pixel | ShaderStage::Compute) {
                for run in bind_ranges(info.unordered_access_mask) {
                    let mut views = Vec::with_capacity(run.len());
                    let mut counts = Vec::with_capacity(run.len());
                    for slot in run.clone() {
                        match tables.unordered_access.get_mut(&slot) {
                            Some(uav) => {
                                views.push(uav.view);
                                counts.push(std::mem::replace(&mut uav.initial_count, u32::MAX));
                            }
                            None => {
                                views.push(None);
                                counts.push(u32::MAX);
                            }
                        }
                    }
                    backend.set_unordered_access(stage, run.start, &views, &counts);
                }
            }
        }
    }

    /// Dispatches enough workgroups to cover `threads_x * threads_y * threads_z` threads.
    pub fn dispatch(
        &self,
        backend: &mut dyn RenderBackend,
        threads_x: u32,
        threads_y: u32,
        threads_z: u32,
    ) {
        let Some(cs) = self.stage(ShaderStage::Compute) else {
            log::warn!("Pass '{}' has no compute shader; dispatch ignored", self.name);
            return;
        };
        let [wx, wy, wz] = cs.reflection.workgroup_size.map(|n| n.max(1));
        backend.dispatch(
            threads_x.div_ceil(wx),
            threads_y.div_ceil(wy),
            threads_z.div_ceil(wz),
        );
    }
}
