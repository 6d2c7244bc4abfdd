//! Resource reflection for WGSL entry points.
//!
//! [`reflect`] walks a validated [`naga::Module`] and records, for one entry point, every
//! global resource that entry point actually touches: its slot space (bind group), slot
//! index (binding), kind and, for uniform blocks, byte size and member layout. Globals that
//! the entry point never reads or writes are dropped, so use-masks built from the result
//! only contain live slots.
//!
//! # Slot spaces
//!
//! | Group | Slot space | Allowed resources |
//! |-------|------------|-------------------|
//! | 0 | `b#` constant buffers | `var<uniform>` |
//! | 1 | `t#` shader resources | sampled/depth textures, `var<storage, read>` |
//! | 2 | `s#` samplers | `sampler`, `sampler_comparison` |
//! | 3 | `u#` unordered access | storage textures, `var<storage, read_write>` |

use crate::device::ShaderStage;
use crate::error::EngineError;
use naga::{
    AddressSpace, Binding, Expression, Handle, ImageClass, ImageDimension, Module, ScalarKind,
    StorageAccess, TypeInner,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Number of slots per slot space. Use-masks are `u128`.
pub const MAX_SLOTS: u32 = 128;

/// The four slot spaces, in bind-group order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotSpace {
    ConstantBuffer,
    ShaderResource,
    Sampler,
    UnorderedAccess,
}

impl SlotSpace {
    pub fn from_group(group: u32) -> Option<Self> {
        match group {
            0 => Some(SlotSpace::ConstantBuffer),
            1 => Some(SlotSpace::ShaderResource),
            2 => Some(SlotSpace::Sampler),
            3 => Some(SlotSpace::UnorderedAccess),
            _ => None,
        }
    }

    pub fn group(self) -> u32 {
        match self {
            SlotSpace::ConstantBuffer => 0,
            SlotSpace::ShaderResource => 1,
            SlotSpace::Sampler => 2,
            SlotSpace::UnorderedAccess => 3,
        }
    }
}

/// Sample type of a sampled texture binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    /// Float texture. `filterable` is false when the shader only ever loads from it.
    Float { filterable: bool },
    Depth,
    Uint,
    Sint,
}

/// View dimension of a texture binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewDimension {
    D1,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

impl ViewDimension {
    pub fn to_wgpu(self) -> wgpu::TextureViewDimension {
        match self {
            ViewDimension::D1 => wgpu::TextureViewDimension::D1,
            ViewDimension::D2 => wgpu::TextureViewDimension::D2,
            ViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            ViewDimension::Cube => wgpu::TextureViewDimension::Cube,
            ViewDimension::CubeArray => wgpu::TextureViewDimension::CubeArray,
            ViewDimension::D3 => wgpu::TextureViewDimension::D3,
        }
    }
}

/// Storage texture formats the engine's compute and UAV paths use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg32Float,
    R32Float,
    R32Uint,
}

impl StorageFormat {
    fn from_naga(format: naga::StorageFormat) -> Option<Self> {
        match format {
            naga::StorageFormat::Rgba8Unorm => Some(StorageFormat::Rgba8Unorm),
            naga::StorageFormat::Rgba16Float => Some(StorageFormat::Rgba16Float),
            naga::StorageFormat::Rgba32Float => Some(StorageFormat::Rgba32Float),
            naga::StorageFormat::Rg32Float => Some(StorageFormat::Rg32Float),
            naga::StorageFormat::R32Float => Some(StorageFormat::R32Float),
            naga::StorageFormat::R32Uint => Some(StorageFormat::R32Uint),
            _ => None,
        }
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            StorageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            StorageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            StorageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            StorageFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            StorageFormat::R32Float => wgpu::TextureFormat::R32Float,
            StorageFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        }
    }
}

/// One named field of a uniform block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// What a reflected binding is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingKind {
    UniformBuffer {
        size: u32,
        members: Vec<UniformMember>,
    },
    StorageBuffer {
        read_only: bool,
        size: u32,
    },
    Texture {
        sample: SampleKind,
        dimension: ViewDimension,
        multisampled: bool,
    },
    StorageTexture {
        format: StorageFormat,
        dimension: ViewDimension,
        read_write: bool,
    },
    Sampler {
        comparison: bool,
    },
}

impl BindingKind {
    /// The slot space this kind of resource is allowed to live in.
    pub fn slot_space(&self) -> SlotSpace {
        match self {
            BindingKind::UniformBuffer { .. } => SlotSpace::ConstantBuffer,
            BindingKind::StorageBuffer {
                read_only: true, ..
            }
            | BindingKind::Texture { .. } => SlotSpace::ShaderResource,
            BindingKind::Sampler { .. } => SlotSpace::Sampler,
            BindingKind::StorageBuffer {
                read_only: false, ..
            }
            | BindingKind::StorageTexture { .. } => SlotSpace::UnorderedAccess,
        }
    }
}

/// A resource binding used by an entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedBinding {
    pub name: String,
    pub space: SlotSpace,
    pub slot: u32,
    pub kind: BindingKind,
}

/// Everything the effect system needs to know about one compiled entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderReflection {
    pub stage: ShaderStage,
    pub entry_point: String,
    /// Threads per workgroup; `[1, 1, 1]` outside compute.
    pub workgroup_size: [u32; 3],
    pub bindings: Vec<ReflectedBinding>,
    /// `@location` indices consumed by a vertex entry point.
    pub vertex_inputs: Vec<u32>,
    /// `@location` indices written by a fragment entry point.
    pub fragment_outputs: Vec<u32>,
}

impl ShaderReflection {
    pub fn binding(&self, space: SlotSpace, slot: u32) -> Option<&ReflectedBinding> {
        self.bindings
            .iter()
            .find(|b| b.space == space && b.slot == slot)
    }

    pub fn bindings_in(&self, space: SlotSpace) -> impl Iterator<Item = &ReflectedBinding> {
        self.bindings.iter().filter(move |b| b.space == space)
    }
}

fn reflection_error(name: &str, message: impl Into<String>) -> EngineError {
    EngineError::Reflection {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Reflects `entry_point` of a validated module.
pub fn reflect(
    name: &str,
    module: &Module,
    info: &naga::valid::ModuleInfo,
    entry_point: &str,
) -> Result<ShaderReflection, EngineError> {
    let (index, ep) = module
        .entry_points
        .iter()
        .enumerate()
        .find(|(_, ep)| ep.name == entry_point)
        .ok_or_else(|| reflection_error(name, format!("no entry point '{}'", entry_point)))?;

    let stage = match ep.stage {
        naga::ShaderStage::Vertex => ShaderStage::Vertex,
        naga::ShaderStage::Fragment => ShaderStage::Pixel,
        naga::ShaderStage::Compute => ShaderStage::Compute,
        #[allow(unreachable_patterns)]
        other => {
            return Err(reflection_error(
                name,
                format!("unsupported stage {:?}", other),
            ));
        }
    };

    let function_info = info.get_entry_point(index);
    let sampled = sampled_images(module);

    let mut bindings = Vec::new();
    for (handle, global) in module.global_variables.iter() {
        let Some(resource) = &global.binding else {
            continue;
        };
        if function_info[handle].is_empty() {
            continue;
        }
        let var_name = global
            .name
            .clone()
            .unwrap_or_else(|| format!("_{}_{}", resource.group, resource.binding));
        let kind = binding_kind(name, module, global, sampled.contains(&handle))?;

        let space = SlotSpace::from_group(resource.group).ok_or_else(|| {
            reflection_error(
                name,
                format!("'{}' uses group {} (only 0..=3)", var_name, resource.group),
            )
        })?;
        if kind.slot_space() != space {
            return Err(reflection_error(
                name,
                format!(
                    "'{}' is a {:?} resource in group {} ({:?} expected)",
                    var_name,
                    kind.slot_space(),
                    resource.group,
                    space
                ),
            ));
        }
        if resource.binding >= MAX_SLOTS {
            return Err(reflection_error(
                name,
                format!("'{}' binding {} is out of range", var_name, resource.binding),
            ));
        }

        bindings.push(ReflectedBinding {
            name: var_name,
            space,
            slot: resource.binding,
            kind,
        });
    }
    bindings.sort_by_key(|b| (b.space.group(), b.slot));

    let mut vertex_inputs = Vec::new();
    if stage == ShaderStage::Vertex {
        for arg in &ep.function.arguments {
            collect_locations(module, arg.ty, arg.binding.as_ref(), &mut vertex_inputs);
        }
    }
    let mut fragment_outputs = Vec::new();
    if stage == ShaderStage::Pixel {
        if let Some(result) = &ep.function.result {
            collect_locations(
                module,
                result.ty,
                result.binding.as_ref(),
                &mut fragment_outputs,
            );
        }
    }
    vertex_inputs.sort_unstable();
    fragment_outputs.sort_unstable();

    Ok(ShaderReflection {
        stage,
        entry_point: entry_point.to_string(),
        workgroup_size: if stage == ShaderStage::Compute {
            ep.workgroup_size
        } else {
            [1, 1, 1]
        },
        bindings,
        vertex_inputs,
        fragment_outputs,
    })
}

fn binding_kind(
    name: &str,
    module: &Module,
    global: &naga::GlobalVariable,
    sampled: bool,
) -> Result<BindingKind, EngineError> {
    let var_name = global.name.as_deref().unwrap_or("<unnamed>");
    let inner = &module.types[global.ty].inner;
    match global.space {
        AddressSpace::Uniform => {
            let size = inner.size(module.to_ctx());
            let members = match inner {
                TypeInner::Struct { members, .. } => members
                    .iter()
                    .map(|m| UniformMember {
                        name: m.name.clone().unwrap_or_default(),
                        offset: m.offset,
                        size: module.types[m.ty].inner.size(module.to_ctx()),
                    })
                    .collect(),
                _ => vec![UniformMember {
                    name: var_name.to_string(),
                    offset: 0,
                    size,
                }],
            };
            Ok(BindingKind::UniformBuffer { size, members })
        }
        AddressSpace::Storage { access } => Ok(BindingKind::StorageBuffer {
            read_only: !access.contains(StorageAccess::STORE),
            size: inner.size(module.to_ctx()),
        }),
        AddressSpace::Handle => match inner {
            TypeInner::Sampler { comparison } => Ok(BindingKind::Sampler {
                comparison: *comparison,
            }),
            TypeInner::Image {
                dim,
                arrayed,
                class,
            } => {
                let dimension = match (*dim, *arrayed) {
                    (ImageDimension::D1, _) => ViewDimension::D1,
                    (ImageDimension::D2, false) => ViewDimension::D2,
                    (ImageDimension::D2, true) => ViewDimension::D2Array,
                    (ImageDimension::Cube, false) => ViewDimension::Cube,
                    (ImageDimension::Cube, true) => ViewDimension::CubeArray,
                    (ImageDimension::D3, _) => ViewDimension::D3,
                };
                match class {
                    ImageClass::Sampled { kind, multi } => {
                        let sample = match kind {
                            ScalarKind::Float => SampleKind::Float {
                                filterable: sampled && !multi,
                            },
                            ScalarKind::Uint => SampleKind::Uint,
                            ScalarKind::Sint => SampleKind::Sint,
                            other => {
                                return Err(reflection_error(
                                    name,
                                    format!("'{}' has sample kind {:?}", var_name, other),
                                ));
                            }
                        };
                        Ok(BindingKind::Texture {
                            sample,
                            dimension,
                            multisampled: *multi,
                        })
                    }
                    ImageClass::Depth { multi } => Ok(BindingKind::Texture {
                        sample: SampleKind::Depth,
                        dimension,
                        multisampled: *multi,
                    }),
                    ImageClass::Storage { format, access } => {
                        let format = StorageFormat::from_naga(*format).ok_or_else(|| {
                            reflection_error(
                                name,
                                format!("'{}' uses unsupported storage format {:?}", var_name, format),
                            )
                        })?;
                        Ok(BindingKind::StorageTexture {
                            format,
                            dimension,
                            read_write: access.contains(StorageAccess::LOAD),
                        })
                    }
                    #[allow(unreachable_patterns)]
                    other => Err(reflection_error(
                        name,
                        format!("'{}' has unsupported image class {:?}", var_name, other),
                    )),
                }
            }
            other => Err(reflection_error(
                name,
                format!("'{}' has unsupported handle type {:?}", var_name, other),
            )),
        },
        other => Err(reflection_error(
            name,
            format!("'{}' lives in unsupported address space {:?}", var_name, other),
        )),
    }
}

/// Globals that appear as the image operand of a filtered sample anywhere in the module.
fn sampled_images(module: &Module) -> HashSet<Handle<naga::GlobalVariable>> {
    let functions = module
        .functions
        .iter()
        .map(|(_, f)| f)
        .chain(module.entry_points.iter().map(|ep| &ep.function));

    let mut sampled = HashSet::new();
    for function in functions {
        for (_, expr) in function.expressions.iter() {
            if let Expression::ImageSample { image, .. } = expr {
                if let Expression::GlobalVariable(global) = function.expressions[*image] {
                    sampled.insert(global);
                }
            }
        }
    }
    sampled
}

fn collect_locations(
    module: &Module,
    ty: Handle<naga::Type>,
    binding: Option<&Binding>,
    out: &mut Vec<u32>,
) {
    match binding {
        Some(Binding::Location { location, .. }) => out.push(*location),
        Some(Binding::BuiltIn(_)) => {}
        None => {
            if let TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    collect_locations(module, member.ty, member.binding.as_ref(), out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reflect_source(source: &str, entry: &str) -> Result<ShaderReflection, EngineError> {
        let module = naga::front::wgsl::parse_str(source).expect("parse");
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("validate");
        reflect("test", &module, &info, entry)
    }

    const LIT: &str = r#"
        struct Frame { view_proj: mat4x4<f32>, eye: vec4<f32> }
        struct Params { tint: vec4<f32>, strength: f32 }
        @group(0) @binding(0) var<uniform> frame: Frame;
        @group(0) @binding(3) var<uniform> params: Params;
        @group(1) @binding(0) var albedo: texture_2d<f32>;
        @group(1) @binding(2) var position: texture_2d<f32>;
        @group(1) @binding(5) var unused: texture_2d<f32>;
        @group(2) @binding(1) var linear: sampler;

        @vertex
        fn vs(@location(0) pos: vec3<f32>, @location(2) uv: vec2<f32>) -> @builtin(position) vec4<f32> {
            return frame.view_proj * vec4<f32>(pos + vec3<f32>(uv, 0.0), 1.0);
        }

        struct Out { @location(0) color: vec4<f32>, @location(2) extra: vec4<f32> }

        @fragment
        fn fs(@builtin(position) p: vec4<f32>) -> Out {
            let c = textureSample(albedo, linear, p.xy) * params.tint;
            let w = textureLoad(position, vec2<i32>(p.xy), 0);
            var out: Out;
            out.color = c * params.strength;
            out.extra = w;
            return out;
        }
    "#;

    #[test]
    fn only_used_globals_are_reflected() {
        let vs = reflect_source(LIT, "vs").unwrap();
        assert_eq!(vs.stage, ShaderStage::Vertex);
        assert_eq!(vs.bindings.len(), 1);
        assert_eq!(vs.bindings[0].name, "frame");
        assert_eq!(vs.vertex_inputs, vec![0, 2]);

        let fs = reflect_source(LIT, "fs").unwrap();
        let names: Vec<_> = fs.bindings.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["params", "albedo", "position", "linear"]);
        assert_eq!(fs.fragment_outputs, vec![0, 2]);
    }

    #[test]
    fn uniform_members_and_sizes() {
        let fs = reflect_source(LIT, "fs").unwrap();
        let params = fs.binding(SlotSpace::ConstantBuffer, 3).unwrap();
        match &params.kind {
            BindingKind::UniformBuffer { size, members } => {
                assert_eq!(*size, 32);
                assert_eq!(members[0].name, "tint");
                assert_eq!(members[1].offset, 16);
                assert_eq!(members[1].size, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn loaded_textures_are_unfilterable() {
        let fs = reflect_source(LIT, "fs").unwrap();
        let sample_of = |slot| match &fs.binding(SlotSpace::ShaderResource, slot).unwrap().kind {
            BindingKind::Texture { sample, .. } => *sample,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sample_of(0), SampleKind::Float { filterable: true });
        assert_eq!(sample_of(2), SampleKind::Float { filterable: false });
    }

    #[test]
    fn wrong_group_is_rejected() {
        let src = r#"
            @group(1) @binding(0) var<uniform> misplaced: vec4<f32>;
            @fragment fn fs() -> @location(0) vec4<f32> { return misplaced; }
        "#;
        assert!(matches!(
            reflect_source(src, "fs"),
            Err(EngineError::Reflection { .. })
        ));
    }

    #[test]
    fn compute_reports_workgroup_and_storage() {
        let src = r#"
            @group(3) @binding(1) var out_tex: texture_storage_2d<rgba16float, write>;
            @compute @workgroup_size(8, 4, 1)
            fn cs(@builtin(global_invocation_id) id: vec3<u32>) {
                textureStore(out_tex, vec2<i32>(id.xy), vec4<f32>(1.0));
            }
        "#;
        let cs = reflect_source(src, "cs").unwrap();
        assert_eq!(cs.workgroup_size, [8, 4, 1]);
        assert!(matches!(
            cs.bindings[0].kind,
            BindingKind::StorageTexture {
                format: StorageFormat::Rgba16Float,
                read_write: false,
                ..
            }
        ));
        assert_eq!(cs.bindings[0].space, SlotSpace::UnorderedAccess);
    }
}
