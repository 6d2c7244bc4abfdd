//! The per-effect registry of shaders, passes and shared slot tables.

use super::binding::{EffectTables, SamplerSlot, ShaderResourceSlot, UnorderedAccessSlot};
use super::compiler::CompiledShader;
use super::constant_buffer::{CBufferData, ConstantBufferVariable};
use super::pass::{EffectPass, PARAMS_BLOCK, StageInfo};
use super::reflection::{BindingKind, ReflectedBinding, SampleKind, SlotSpace};
use crate::device::{RenderBackend, ResourceId, ResourceView, SamplerId, ShaderId, ShaderStage};
use crate::error::EngineError;
use std::collections::HashMap;

/// Hashes a resource, shader or pass name into the id every lookup uses (64-bit FNV-1a).
pub const fn string_to_id(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Shader names per stage for [`EffectHelper::add_effect_pass`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EffectPassDesc<'a> {
    pub vs: Option<&'a str>,
    pub hs: Option<&'a str>,
    pub ds: Option<&'a str>,
    pub gs: Option<&'a str>,
    pub ps: Option<&'a str>,
    pub cs: Option<&'a str>,
}

impl<'a> EffectPassDesc<'a> {
    pub fn graphics(vs: &'a str, ps: &'a str) -> Self {
        Self {
            vs: Some(vs),
            ps: Some(ps),
            ..Default::default()
        }
    }

    pub fn vertex_only(vs: &'a str) -> Self {
        Self {
            vs: Some(vs),
            ..Default::default()
        }
    }

    pub fn compute(cs: &'a str) -> Self {
        Self {
            cs: Some(cs),
            ..Default::default()
        }
    }

    fn by_stage(&self) -> [Option<&'a str>; 6] {
        [self.vs, self.hs, self.ds, self.gs, self.ps, self.cs]
    }
}

#[derive(Debug)]
struct RegisteredShader {
    name: String,
    shader: ShaderId,
    compiled: CompiledShader,
}

/// Shaders, passes and the slot tables they share.
///
/// Resources are bound into the tables by slot or by reflected name and stay bound for
/// every later [`apply_pass`](Self::apply_pass) until they are replaced.
#[derive(Debug, Default)]
pub struct EffectHelper {
    tables: EffectTables,
    shaders: HashMap<u64, RegisteredShader>,
    passes: HashMap<u64, EffectPass>,
    /// Name → slot, one map per slot space.
    names: [HashMap<u64, u32>; 4],
}

fn texture_compatible(a: &BindingKind, b: &BindingKind) -> bool {
    match (a, b) {
        (
            BindingKind::Texture {
                sample: sa,
                dimension: da,
                multisampled: ma,
            },
            BindingKind::Texture {
                sample: sb,
                dimension: db,
                multisampled: mb,
            },
        ) => {
            let same_sample = matches!(
                (sa, sb),
                (SampleKind::Float { .. }, SampleKind::Float { .. })
            ) || sa == sb;
            same_sample && da == db && ma == mb
        }
        (
            BindingKind::StorageBuffer { read_only: ra, .. },
            BindingKind::StorageBuffer { read_only: rb, .. },
        ) => ra == rb,
        _ => a == b,
    }
}

impl EffectHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn names(&self, space: SlotSpace) -> &HashMap<u64, u32> {
        &self.names[space.group() as usize]
    }

    fn check_binding(&self, shader: &str, binding: &ReflectedBinding) -> Result<(), EngineError> {
        let conflict = || EngineError::BindingConflict {
            shader: shader.to_string(),
            resource: binding.name.clone(),
            slot: binding.slot,
        };

        if let Some(&slot) = self.names(binding.space).get(&string_to_id(&binding.name)) {
            if slot != binding.slot {
                return Err(conflict());
            }
        }

        let existing = match binding.space {
            SlotSpace::ConstantBuffer => self
                .tables
                .constant_buffers
                .get(&binding.slot)
                .map(|cb| (cb.name.as_str(), None)),
            SlotSpace::ShaderResource => self
                .tables
                .shader_resources
                .get(&binding.slot)
                .map(|s| (s.name.as_str(), Some(&s.kind))),
            SlotSpace::Sampler => self
                .tables
                .samplers
                .get(&binding.slot)
                .map(|s| (s.name.as_str(), None)),
            SlotSpace::UnorderedAccess => self
                .tables
                .unordered_access
                .get(&binding.slot)
                .map(|s| (s.name.as_str(), Some(&s.kind))),
        };
        match existing {
            Some((name, _)) if name != binding.name => Err(conflict()),
            Some((_, Some(kind))) if !texture_compatible(kind, &binding.kind) => Err(conflict()),
            _ => {
                if let (SlotSpace::Sampler, BindingKind::Sampler { comparison }) =
                    (binding.space, &binding.kind)
                {
                    if let Some(existing) = self.tables.samplers.get(&binding.slot) {
                        if existing.comparison != *comparison {
                            return Err(conflict());
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Registers a compiled shader and merges its bindings into the shared tables.
    ///
    /// Nothing is modified when an error is returned.
    pub fn add_shader(
        &mut self,
        name: &str,
        compiled: &CompiledShader,
        backend: &mut dyn RenderBackend,
    ) -> Result<(), EngineError> {
        let id = string_to_id(name);
        if self.shaders.contains_key(&id) {
            return Err(EngineError::DuplicateShader(name.to_string()));
        }

        let shared: Vec<&ReflectedBinding> = compiled
            .reflection
            .bindings
            .iter()
            .filter(|b| !(b.space == SlotSpace::ConstantBuffer && b.name == PARAMS_BLOCK))
            .collect();
        for binding in &shared {
            self.check_binding(name, binding)?;
        }

        let shader = backend.create_shader(compiled)?;

        for binding in shared {
            self.names[binding.space.group() as usize].insert(string_to_id(&binding.name), binding.slot);
            match (&binding.kind, binding.space) {
                (BindingKind::UniformBuffer { size, members }, _) => {
                    match self.tables.constant_buffers.get_mut(&binding.slot) {
                        Some(cb) => cb.merge(*size, members, backend),
                        None => {
                            self.tables.constant_buffers.insert(
                                binding.slot,
                                CBufferData::new(&binding.name, binding.slot, *size, members.clone()),
                            );
                        }
                    }
                }
                (BindingKind::Sampler { comparison }, _) => {
                    self.tables
                        .samplers
                        .entry(binding.slot)
                        .or_insert_with(|| SamplerSlot {
                            name: binding.name.clone(),
                            comparison: *comparison,
                            sampler: None,
                        });
                }
                (kind, SlotSpace::ShaderResource) => {
                    let slot = self
                        .tables
                        .shader_resources
                        .entry(binding.slot)
                        .or_insert_with(|| ShaderResourceSlot {
                            name: binding.name.clone(),
                            kind: kind.clone(),
                            view: None,
                        });
                    // Sampling anywhere makes the slot filterable.
                    if let (
                        BindingKind::Texture {
                            sample: SampleKind::Float { filterable },
                            ..
                        },
                        BindingKind::Texture {
                            sample: SampleKind::Float { filterable: true },
                            ..
                        },
                    ) = (&mut slot.kind, kind)
                    {
                        *filterable = true;
                    }
                }
                (kind, _) => {
                    self.tables
                        .unordered_access
                        .entry(binding.slot)
                        .or_insert_with(|| UnorderedAccessSlot {
                            name: binding.name.clone(),
                            kind: kind.clone(),
                            view: None,
                            initial_count: u32::MAX,
                        });
                }
            }
        }

        log::debug!(
            "Added {} shader '{}' with {} bindings",
            compiled.reflection.stage.name(),
            name,
            compiled.reflection.bindings.len()
        );
        self.shaders.insert(
            id,
            RegisteredShader {
                name: name.to_string(),
                shader,
                compiled: compiled.clone(),
            },
        );
        Ok(())
    }

    /// Combines registered shaders into a named pass.
    pub fn add_effect_pass(&mut self, name: &str, desc: &EffectPassDesc) -> Result<(), EngineError> {
        let id = string_to_id(name);
        if self.passes.contains_key(&id) {
            return Err(EngineError::DuplicatePass(name.to_string()));
        }

        let mut stages: [Option<StageInfo>; 6] = Default::default();
        for (stage, shader_name) in ShaderStage::ALL.into_iter().zip(desc.by_stage()) {
            let Some(shader_name) = shader_name else {
                continue;
            };
            let shader = self
                .shaders
                .get(&string_to_id(shader_name))
                .ok_or_else(|| EngineError::UnknownShader(shader_name.to_string()))?;
            if shader.compiled.reflection.stage != stage {
                return Err(EngineError::StageMismatch {
                    shader: shader_name.to_string(),
                    expected: stage.name(),
                });
            }
            stages[stage.index()] = Some(StageInfo::new(
                &shader.name,
                shader.shader,
                &shader.compiled.reflection,
            ));
        }

        self.passes.insert(id, EffectPass::new(name, stages));
        Ok(())
    }

    pub fn get_effect_pass(&mut self, name: &str) -> Option<&mut EffectPass> {
        self.passes.get_mut(&string_to_id(name))
    }

    pub fn has_pass(&self, name: &str) -> bool {
        self.passes.contains_key(&string_to_id(name))
    }

    /// Applies the named pass. Returns `false` when there is no such pass.
    pub fn apply_pass(&mut self, name: &str, backend: &mut dyn RenderBackend) -> bool {
        match self.passes.get_mut(&string_to_id(name)) {
            Some(pass) => {
                pass.apply(&mut self.tables, backend);
                true
            }
            None => {
                log::warn!("No effect pass named '{}'", name);
                false
            }
        }
    }

    /// Applies the named compute pass and dispatches it over a thread grid.
    pub fn dispatch_pass(
        &mut self,
        name: &str,
        backend: &mut dyn RenderBackend,
        threads: [u32; 3],
    ) -> bool {
        let Some(pass) = self.passes.get_mut(&string_to_id(name)) else {
            log::warn!("No effect pass named '{}'", name);
            return false;
        };
        pass.apply(&mut self.tables, backend);
        pass.dispatch(backend, threads[0], threads[1], threads[2]);
        true
    }

    pub fn tables(&self) -> &EffectTables {
        &self.tables
    }

    /// A constant buffer member, searched by name across every shared block. A block's own
    /// name yields the whole block.
    pub fn get_constant_buffer_variable(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        let slot = self
            .tables
            .constant_buffers
            .iter()
            .find(|(_, cb)| cb.members().iter().any(|m| m.name == name))
            .map(|(slot, _)| *slot);
        if let Some(slot) = slot {
            return self.tables.constant_buffers.get_mut(&slot)?.variable(name);
        }
        let slot = *self.names(SlotSpace::ConstantBuffer).get(&string_to_id(name))?;
        Some(self.tables.constant_buffers.get_mut(&slot)?.whole())
    }

    pub fn get_constant_buffer(&mut self, slot: u32) -> Option<&mut CBufferData> {
        self.tables.constant_buffers.get_mut(&slot)
    }

    pub fn set_shader_resource_by_slot(&mut self, slot: u32, view: Option<ResourceView>) -> bool {
        match self.tables.shader_resources.get_mut(&slot) {
            Some(entry) => {
                entry.view = view;
                true
            }
            None => false,
        }
    }

    pub fn set_shader_resource_by_name(&mut self, name: &str, view: Option<ResourceView>) -> bool {
        match self.names(SlotSpace::ShaderResource).get(&string_to_id(name)) {
            Some(&slot) => self.set_shader_resource_by_slot(slot, view),
            None => false,
        }
    }

    pub fn set_sampler_state_by_slot(&mut self, slot: u32, sampler: Option<SamplerId>) -> bool {
        match self.tables.samplers.get_mut(&slot) {
            Some(entry) => {
                entry.sampler = sampler;
                true
            }
            None => false,
        }
    }

    pub fn set_sampler_state_by_name(&mut self, name: &str, sampler: Option<SamplerId>) -> bool {
        match self.names(SlotSpace::Sampler).get(&string_to_id(name)) {
            Some(&slot) => self.set_sampler_state_by_slot(slot, sampler),
            None => false,
        }
    }

    /// Binds a read/write resource. `initial_count` is applied by the next apply only.
    pub fn set_unordered_access_by_slot(
        &mut self,
        slot: u32,
        view: Option<ResourceView>,
        initial_count: Option<u32>,
    ) -> bool {
        match self.tables.unordered_access.get_mut(&slot) {
            Some(entry) => {
                entry.view = view;
                entry.initial_count = initial_count.unwrap_or(u32::MAX);
                true
            }
            None => false,
        }
    }

    pub fn set_unordered_access_by_name(
        &mut self,
        name: &str,
        view: Option<ResourceView>,
        initial_count: Option<u32>,
    ) -> bool {
        match self.names(SlotSpace::UnorderedAccess).get(&string_to_id(name)) {
            Some(&slot) => self.set_unordered_access_by_slot(slot, view, initial_count),
            None => false,
        }
    }

    /// Destroys every GPU object the effect created.
    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        for cb in self.tables.constant_buffers.values_mut() {
            cb.release(backend);
        }
        for pass in self.passes.values_mut() {
            for stage in ShaderStage::ALL {
                if let Some(params) = pass.stage_mut(stage).and_then(|s| s.params.as_mut()) {
                    params.release(backend);
                }
            }
        }
        for shader in self.shaders.values() {
            backend.destroy(ResourceId::Shader(shader.shader));
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, RecordingBackend};
    use crate::effect::compiler::compile_source;

    const MESH: &str = r#"
        struct Frame { view_proj: mat4x4<f32>, }
        @group(0) @binding(0) var<uniform> frame: Frame;
        struct Object { world: mat4x4<f32>, }
        @group(0) @binding(1) var<uniform> object: Object;
        struct Params { tint: vec4<f32>, }
        @group(0) @binding(2) var<uniform> params: Params;
        @group(1) @binding(0) var albedo: texture_2d<f32>;
        @group(1) @binding(1) var normal_map: texture_2d<f32>;
        @group(1) @binding(3) var extra: texture_2d<f32>;
        @group(2) @binding(0) var linear_sampler: sampler;

        @vertex
        fn vs(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
            return frame.view_proj * object.world * vec4<f32>(position, 1.0);
        }

        @fragment
        fn ps(@builtin(position) p: vec4<f32>) -> @location(0) vec4<f32> {
            let uv = p.xy / 512.0;
            let a = textureSample(albedo, linear_sampler, uv);
            let n = textureSample(normal_map, linear_sampler, uv);
            let e = textureLoad(extra, vec2<i32>(0, 0), 0);
            return (a + n + e) * params.tint;
        }
    "#;

    const COMPUTE: &str = r#"
        @group(3) @binding(0) var<storage, read_write> counters: array<u32>;
        @group(3) @binding(1) var output: texture_storage_2d<rgba16float, write>;

        @compute @workgroup_size(8, 8, 1)
        fn cs(@builtin(global_invocation_id) id: vec3<u32>) {
            counters[id.x] = id.y;
            textureStore(output, vec2<i32>(id.xy), vec4<f32>(1.0));
        }
    "#;

    fn mesh_effect(backend: &mut RecordingBackend) -> EffectHelper {
        let mut effect = EffectHelper::new();
        let vs = compile_source("mesh_vs", MESH, "vs", &[]).unwrap();
        let ps = compile_source("mesh_ps", MESH, "ps", &[]).unwrap();
        effect.add_shader("mesh_vs", &vs, backend).unwrap();
        effect.add_shader("mesh_ps", &ps, backend).unwrap();
        effect
            .add_effect_pass("Mesh", &EffectPassDesc::graphics("mesh_vs", "mesh_ps"))
            .unwrap();
        effect
    }

    #[test]
    fn string_ids_are_stable() {
        assert_eq!(string_to_id(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(string_to_id("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(string_to_id("gAlbedo"), string_to_id("gNormal"));
    }

    #[test]
    fn apply_binds_contiguous_runs() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);
        backend.take_commands();

        assert!(effect.apply_pass("Mesh", &mut backend));
        let commands = backend.take_commands();

        let srv_calls: Vec<(u32, usize)> = commands
            .iter()
            .filter_map(|c| match c {
                Command::SetShaderResources {
                    stage: ShaderStage::Pixel,
                    start_slot,
                    views,
                } => Some((*start_slot, views.len())),
                _ => None,
            })
            .collect();
        assert_eq!(srv_calls, [(0, 2), (3, 1)]);

        let vs_cbuffers: Vec<(u32, usize)> = commands
            .iter()
            .filter_map(|c| match c {
                Command::SetConstantBuffers {
                    stage: ShaderStage::Vertex,
                    start_slot,
                    buffers,
                } => Some((*start_slot, buffers.len())),
                _ => None,
            })
            .collect();
        assert_eq!(vs_cbuffers, [(0, 2)]);

        for stage in [ShaderStage::Hull, ShaderStage::Domain, ShaderStage::Geometry, ShaderStage::Compute] {
            assert!(commands.contains(&Command::SetShader {
                stage,
                shader: None
            }));
        }
    }

    #[test]
    fn named_lookups_reach_the_tables() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);

        assert!(effect.get_constant_buffer_variable("view_proj").is_some());
        assert!(effect.get_constant_buffer_variable("object").is_some());
        assert!(effect.get_constant_buffer_variable("missing").is_none());
        // The per-pass block is not shared.
        assert!(effect.get_constant_buffer_variable("tint").is_none());
        assert!(
            effect
                .get_effect_pass("Mesh")
                .unwrap()
                .get_ps_param_by_name("tint")
                .is_some()
        );

        assert!(!effect.set_shader_resource_by_name("missing", None));
        assert!(!effect.set_sampler_state_by_name("albedo", None));
        assert!(effect.set_sampler_state_by_name("linear_sampler", None));
        assert!(
            matches!(
                effect.tables().shader_resources[&0].kind,
                BindingKind::Texture {
                    sample: SampleKind::Float { filterable: true },
                    ..
                }
            )
        );
        assert!(
            matches!(
                effect.tables().shader_resources[&3].kind,
                BindingKind::Texture {
                    sample: SampleKind::Float { filterable: false },
                    ..
                }
            )
        );
    }

    #[test]
    fn conflicting_bindings_are_rejected() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);

        let renamed = MESH.replace("var albedo", "var base_color").replace("(albedo,", "(base_color,");
        let ps = compile_source("renamed_ps", &renamed, "ps", &[]).unwrap();
        let result = effect.add_shader("renamed_ps", &ps, &mut backend);
        assert!(matches!(result, Err(EngineError::BindingConflict { slot: 0, .. })));

        let moved = MESH.replace("@binding(1) var normal_map", "@binding(5) var normal_map");
        let ps = compile_source("moved_ps", &moved, "ps", &[]).unwrap();
        assert!(matches!(
            effect.add_shader("moved_ps", &ps, &mut backend),
            Err(EngineError::BindingConflict { .. })
        ));

        let ps = compile_source("mesh_ps", MESH, "ps", &[]).unwrap();
        assert!(matches!(
            effect.add_shader("mesh_ps", &ps, &mut backend),
            Err(EngineError::DuplicateShader(_))
        ));
    }

    #[test]
    fn larger_constant_buffer_wins() {
        const VARIANT: &str = r#"
            struct Frame {
                view_proj: mat4x4<f32>,
            #ifdef JITTER
                jitter: vec4<f32>,
            #endif
            }
            @group(0) @binding(0) var<uniform> frame: Frame;
            @vertex fn vs() -> @builtin(position) vec4<f32> { return frame.view_proj[0]; }
        "#;
        let mut backend = RecordingBackend::new();
        let mut effect = EffectHelper::new();
        let large = compile_source("large", VARIANT, "vs", &[("JITTER", "1")]).unwrap();
        let small = compile_source("small", VARIANT, "vs", &[]).unwrap();

        effect.add_shader("large", &large, &mut backend).unwrap();
        effect
            .get_constant_buffer_variable("jitter")
            .unwrap()
            .set_float(3.0);
        effect.add_shader("small", &small, &mut backend).unwrap();

        let cb = effect.get_constant_buffer(0).unwrap();
        assert_eq!(cb.size(), 80);
        assert_eq!(&cb.bytes()[64..68], &3.0f32.to_le_bytes());
    }

    #[test]
    fn passes_validate_their_stages() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);

        assert!(matches!(
            effect.add_effect_pass("Mesh", &EffectPassDesc::graphics("mesh_vs", "mesh_ps")),
            Err(EngineError::DuplicatePass(_))
        ));
        assert!(matches!(
            effect.add_effect_pass("Bad", &EffectPassDesc::graphics("mesh_vs", "nope")),
            Err(EngineError::UnknownShader(_))
        ));
        assert!(matches!(
            effect.add_effect_pass("Swapped", &EffectPassDesc::graphics("mesh_ps", "mesh_vs")),
            Err(EngineError::StageMismatch { expected: "vertex", .. })
        ));
        assert!(!effect.has_pass("Bad"));
    }

    #[test]
    fn pass_params_are_per_pass() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);
        effect
            .add_effect_pass("Mesh2", &EffectPassDesc::graphics("mesh_vs", "mesh_ps"))
            .unwrap();

        effect
            .get_effect_pass("Mesh")
            .unwrap()
            .get_ps_param_by_name("tint")
            .unwrap()
            .set_float_vector(&[1.0, 0.0, 0.0, 1.0]);
        let other = effect
            .get_effect_pass("Mesh2")
            .unwrap()
            .get_ps_param_by_name("tint")
            .unwrap()
            .get_raw()
            .to_vec();
        assert!(other.iter().all(|&b| b == 0));
    }

    #[test]
    fn uav_initial_count_is_sticky_for_one_apply() {
        let mut backend = RecordingBackend::new();
        let mut effect = EffectHelper::new();
        let cs = compile_source("fill_cs", COMPUTE, "cs", &[]).unwrap();
        effect.add_shader("fill_cs", &cs, &mut backend).unwrap();
        effect
            .add_effect_pass("Fill", &EffectPassDesc::compute("fill_cs"))
            .unwrap();
        assert!(effect.set_unordered_access_by_name("counters", None, Some(0)));

        let counts = |backend: &mut RecordingBackend| -> Vec<Vec<u32>> {
            backend
                .take_commands()
                .into_iter()
                .filter_map(|c| match c {
                    Command::SetUnorderedAccess { initial_counts, .. } => Some(initial_counts),
                    _ => None,
                })
                .collect()
        };

        effect.apply_pass("Fill", &mut backend);
        assert_eq!(counts(&mut backend), [vec![0, u32::MAX]]);
        effect.apply_pass("Fill", &mut backend);
        assert_eq!(counts(&mut backend), [vec![u32::MAX, u32::MAX]]);
    }

    #[test]
    fn dispatch_rounds_up_to_workgroups() {
        let mut backend = RecordingBackend::new();
        let mut effect = mesh_effect(&mut backend);
        let cs = compile_source("fill_cs", COMPUTE, "cs", &[]).unwrap();
        effect.add_shader("fill_cs", &cs, &mut backend).unwrap();
        effect
            .add_effect_pass("Fill", &EffectPassDesc::compute("fill_cs"))
            .unwrap();

        effect.dispatch_pass("Fill", &mut backend, [100, 30, 1]);
        assert!(backend.commands().contains(&Command::Dispatch { x: 13, y: 4, z: 1 }));

        backend.take_commands();
        effect.dispatch_pass("Mesh", &mut backend, [100, 30, 1]);
        assert_eq!(backend.count(|c| matches!(c, Command::Dispatch { .. })), 0);
    }
}
