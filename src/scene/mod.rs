//! The ECS scene: entities on [`hecs`], their components, visibility and editor selection.
//!
//! ```
//! use umbra::scene::{SceneGraph, Transform, DirectionalLightComponent};
//! use glam::Vec3;
//!
//! let mut scene = SceneGraph::new();
//! let sun = scene.create_entity("sun");
//! scene.add_component(sun, Transform::new().looking_at(Vec3::new(0.2, -1.0, 0.3)));
//! scene.add_component(sun, DirectionalLightComponent::default());
//! assert!(scene.directional_light().is_some());
//! ```

pub mod components;
pub mod editing;
pub mod graph;

pub use components::{
    CameraComponent, DirectionalLightComponent, SkyboxComponent, StaticMeshComponent,
    TagComponent, Transform,
};
pub use editing::EditingSystem;
pub use graph::{ResolvedLight, SceneGraph};
pub use hecs::Entity;
