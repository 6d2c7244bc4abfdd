//! The renderer's effects.
//!
//! Each effect owns one [`EffectHelper`] built from a WGSL file under `src/shaders/`, plus
//! domain setters (matrices, lights, shadow parameters) and pass selection. Effects are
//! plain values owned by the [`Renderer`](crate::renderer::Renderer); nothing here is
//! global.
//!
//! Optional capabilities are traits rather than runtime checks: an effect that takes
//! object transforms implements [`EffectTransform`], one that takes surface parameters
//! implements [`EffectMaterial`].

pub mod deferred_pbr;
pub mod gizmos;
pub mod preprocess;
pub mod present;
pub mod shadow;
pub mod skybox;
pub mod taa;

pub use deferred_pbr::{DeferredPbrEffect, GBufferDebugMode, GBufferInputs, IblInputs};
pub use gizmos::{GizmoVertex, GizmosWireEffect};
pub use preprocess::PreProcessEffect;
pub use present::{PresentEffect, Tonemap};
pub use shadow::ShadowEffect;
pub use skybox::SimpleSkyboxEffect;
pub use taa::TaaEffect;

use crate::assets::{Material, MeshData, Vertex3d};
use crate::device::{RenderBackend, ResourceId, ResourceView, SamplerDesc, SamplerId};
use crate::effect::{EffectHelper, ShaderCompiler};
use crate::error::EngineError;
use glam::{Mat4, Vec4};

/// Effects that place geometry with world, view and projection matrices.
pub trait EffectTransform {
    fn set_world_matrix(&mut self, world: &Mat4);
    fn set_view_matrix(&mut self, view: &Mat4);
    fn set_proj_matrix(&mut self, proj: &Mat4);
}

/// Effects that shade with per-draw surface parameters.
pub trait EffectMaterial {
    /// `albedo` replaces the material's texture binding; `None` leaves the slot unbound.
    fn set_material(&mut self, material: &Material, albedo: Option<ResourceView>);
}

/// Sampler states shared by every effect.
#[derive(Clone, Copy, Debug)]
pub struct SamplerStates {
    pub linear_wrap: SamplerId,
    pub linear_clamp: SamplerId,
    pub point_clamp: SamplerId,
    pub shadow_comparison: SamplerId,
}

impl SamplerStates {
    pub fn new(backend: &mut dyn RenderBackend) -> Result<Self, EngineError> {
        Ok(Self {
            linear_wrap: backend.create_sampler(&SamplerDesc::LINEAR_WRAP)?,
            linear_clamp: backend.create_sampler(&SamplerDesc::LINEAR_CLAMP)?,
            point_clamp: backend.create_sampler(&SamplerDesc::POINT_CLAMP)?,
            shadow_comparison: backend.create_sampler(&SamplerDesc::SHADOW_COMPARISON)?,
        })
    }

    /// Binds every sampler the effect declares, by its WGSL name.
    pub(crate) fn bind(&self, effect: &mut EffectHelper) {
        effect.set_sampler_state_by_name("linear_wrap", Some(self.linear_wrap));
        effect.set_sampler_state_by_name("linear_clamp", Some(self.linear_clamp));
        effect.set_sampler_state_by_name("point_clamp", Some(self.point_clamp));
        effect.set_sampler_state_by_name("shadow_sampler", Some(self.shadow_comparison));
    }

    pub fn release(&self, backend: &mut dyn RenderBackend) {
        for sampler in [
            self.linear_wrap,
            self.linear_clamp,
            self.point_clamp,
            self.shadow_comparison,
        ] {
            backend.destroy(ResourceId::Sampler(sampler));
        }
    }
}

/// A shader to compile out of an effect's source file.
pub(crate) struct ShaderEntry<'a> {
    pub name: &'a str,
    pub entry_point: &'a str,
    pub defines: &'a [(&'a str, &'a str)],
}

impl<'a> ShaderEntry<'a> {
    pub const fn new(name: &'a str, entry_point: &'a str) -> Self {
        Self {
            name,
            entry_point,
            defines: &[],
        }
    }

    pub const fn with_defines(
        name: &'a str,
        entry_point: &'a str,
        defines: &'a [(&'a str, &'a str)],
    ) -> Self {
        Self {
            name,
            entry_point,
            defines,
        }
    }
}

/// Compiles and registers every entry, stopping at the first failure.
pub(crate) fn add_shaders(
    effect: &mut EffectHelper,
    compiler: &ShaderCompiler,
    backend: &mut dyn RenderBackend,
    source: &str,
    entries: &[ShaderEntry],
) -> Result<(), EngineError> {
    for entry in entries {
        let compiled = compiler.compile(entry.name, source, entry.entry_point, entry.defines)?;
        effect.add_shader(entry.name, &compiled, backend)?;
    }
    Ok(())
}

/// Draws the full-screen triangle every post pass uses.
pub(crate) fn draw_fullscreen(backend: &mut dyn RenderBackend) {
    backend.set_vertex_buffer(None, None);
    backend.set_index_buffer(None);
    backend.draw(3, 0);
}

/// Draws one uploaded sub-mesh with the [`Vertex3d`] layout.
pub(crate) fn draw_mesh(backend: &mut dyn RenderBackend, mesh: &MeshData) {
    backend.set_vertex_buffer(Some(mesh.vertex_buffer), Some(Vertex3d::LAYOUT));
    backend.set_index_buffer(Some(mesh.index_buffer));
    backend.draw_indexed(mesh.index_count, 0, 0);
}

// Named constant writes. A missing name means the variable was compiled out of every
// shader of the effect, which is not an error.

pub(crate) fn set_mat4(effect: &mut EffectHelper, name: &str, value: &Mat4) {
    if let Some(mut variable) = effect.get_constant_buffer_variable(name) {
        variable.set_mat4(value);
    }
}

pub(crate) fn set_vec4(effect: &mut EffectHelper, name: &str, value: Vec4) {
    if let Some(mut variable) = effect.get_constant_buffer_variable(name) {
        variable.set_vec4(value);
    }
}

pub(crate) fn set_floats(effect: &mut EffectHelper, name: &str, values: &[f32]) {
    if let Some(mut variable) = effect.get_constant_buffer_variable(name) {
        variable.set_float_vector(values);
    }
}

pub(crate) fn set_float(effect: &mut EffectHelper, name: &str, value: f32) {
    if let Some(mut variable) = effect.get_constant_buffer_variable(name) {
        variable.set_float(value);
    }
}

pub(crate) fn set_uint(effect: &mut EffectHelper, name: &str, value: u32) {
    if let Some(mut variable) = effect.get_constant_buffer_variable(name) {
        variable.set_uint(value);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::device::RecordingBackend;

    pub fn setup() -> (RecordingBackend, ShaderCompiler, SamplerStates) {
        let mut backend = RecordingBackend::new();
        let samplers = SamplerStates::new(&mut backend).unwrap();
        (backend, ShaderCompiler::new(), samplers)
    }
}
