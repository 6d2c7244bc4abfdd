//! Reflected shader effects.
//!
//! An effect is an [`EffectHelper`] holding compiled shaders, the passes built from them
//! and the slot tables those passes share. Resources are bound into the tables by name or
//! slot; [`EffectHelper::apply_pass`] then binds a pass's shaders, states and every slot its
//! shaders use onto a [`RenderBackend`](crate::device::RenderBackend).
//!
//! ```no_run
//! use umbra::device::{RecordingBackend, RenderBackend};
//! use umbra::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
//!
//! # fn main() -> Result<(), umbra::EngineError> {
//! let source = include_str!("../shaders/present.wgsl");
//! let compiler = ShaderCompiler::new();
//! let mut backend = RecordingBackend::new();
//! let mut effect = EffectHelper::new();
//!
//! effect.add_shader("present_vs", &compiler.compile("present_vs", source, "vs_main", &[])?, &mut backend)?;
//! effect.add_shader("present_ps", &compiler.compile("present_ps", source, "ps_main", &[])?, &mut backend)?;
//! effect.add_effect_pass("Present", &EffectPassDesc::graphics("present_vs", "present_ps"))?;
//!
//! effect.set_shader_resource_by_name("scene_color", None);
//! effect.apply_pass("Present", &mut backend);
//! backend.draw(3, 0);
//! # Ok(())
//! # }
//! ```

mod binding;
mod compiler;
mod constant_buffer;
mod helper;
mod pass;
pub mod reflection;

pub use binding::{
    BindRanges, EffectTables, SamplerSlot, ShaderResourceSlot, SlotMask, UnorderedAccessSlot,
    bind_ranges,
};
pub use compiler::{CompiledShader, ShaderCompiler, compile_source, preprocess};
pub use constant_buffer::{CBufferData, ConstantBufferVariable};
pub use helper::{EffectHelper, EffectPassDesc, string_to_id};
pub use pass::{EffectPass, PARAMS_BLOCK, StageInfo};
pub use reflection::{ShaderReflection, reflect};
