//! # Umbra
//!
//! **A deferred renderer on wgpu, built around reflected effects.**
//!
//! Shaders are plain WGSL. Each [`EffectHelper`](effect::EffectHelper) reflects its
//! shaders' bindings into shared slot tables, so effects set constants, textures and
//! samplers by name and apply a named pass in one call. On top of that sit the
//! [`Renderer`](renderer::Renderer), cascaded shadow maps, image-based lighting, TAA and
//! an ECS [`SceneGraph`](scene::SceneGraph) with picking and editor selection.
//!
//! ## Quick Start
//!
//! ```no_run
//! use umbra::assets::{Material, ModelManager, TextureManager};
//! use umbra::camera::Camera;
//! use umbra::config::RenderConfig;
//! use umbra::device::WgpuBackend;
//! use umbra::renderer::Renderer;
//! use umbra::scene::{DirectionalLightComponent, EditingSystem, SceneGraph, StaticMeshComponent, Transform};
//! use umbra::{GpuContext, Vec3};
//!
//! # fn main() -> Result<(), umbra::EngineError> {
//! let mut backend = WgpuBackend::new(GpuContext::headless(1280, 720)?);
//! let mut models = ModelManager::new();
//! let textures = TextureManager::new(&mut backend)?;
//! let cube = models.create_cube(&mut backend, Material::default())?;
//!
//! let mut scene = SceneGraph::new();
//! let entity = scene.create_entity("cube");
//! scene.add_component(entity, Transform::new());
//! scene.add_component(entity, StaticMeshComponent::new(cube));
//! let sun = scene.create_entity("sun");
//! scene.add_component(sun, Transform::new().looking_at(Vec3::new(0.3, -1.0, 0.2)));
//! scene.add_component(sun, DirectionalLightComponent::default());
//!
//! let mut renderer = Renderer::new(&mut backend, RenderConfig::default(), 1280, 720)?;
//! let camera = Camera::new().at([0.0, 2.0, -5.0]).looking_at(Vec3::ZERO);
//! let mut editing = EditingSystem::new();
//! renderer.render_frame(&mut backend, &mut scene, &models, &textures, &mut editing, &camera)?;
//! # Ok(())
//! # }
//! ```
//!
//! Rendering goes through the [`RenderBackend`](device::RenderBackend) trait. The wgpu
//! implementation draws; [`RecordingBackend`](device::RecordingBackend) only records
//! commands, which is how the tests check pass order and bindings without a GPU.

mod arena;
pub mod assets;
pub mod camera;
pub mod collision;
pub mod config;
pub mod device;
pub mod effect;
pub mod effects;
pub mod error;
mod gpu;
pub mod input;
pub mod orbit_camera;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shadow;

pub use error::EngineError;
pub use gpu::GpuContext;

pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
