//! Editor selection state.

use super::components::{StaticMeshComponent, Transform};
use super::graph::SceneGraph;
use crate::assets::ModelManager;
use crate::collision::{Obb, Ray};
use hecs::Entity;

/// Tracks which entity the editor has selected.
///
/// Selection survives frames but not the entity: any query made after the entity is
/// destroyed reports no selection.
#[derive(Clone, Copy, Debug, Default)]
pub struct EditingSystem {
    selected: Option<Entity>,
}

impl EditingSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, entity: Option<Entity>) {
        self.selected = entity;
    }

    /// The selected entity, if it is still alive in `scene`.
    pub fn get_selected_entity(&mut self, scene: &SceneGraph) -> Option<Entity> {
        if self.selected.is_some_and(|entity| !scene.contains(entity)) {
            self.selected = None;
        }
        self.selected
    }

    pub fn reset_selected_entity(&mut self) {
        self.selected = None;
    }

    /// Selects whatever `ray` picks, or clears the selection on a miss.
    pub fn pick(&mut self, scene: &SceneGraph, ray: &Ray, models: &ModelManager) -> Option<Entity> {
        self.selected = scene.pick_entity(ray, models);
        self.selected
    }

    /// Destroys the selected entity. Returns false when nothing was selected.
    pub fn destroy_selected(&mut self, scene: &mut SceneGraph) -> bool {
        match self.selected.take() {
            Some(entity) => scene.destroy_entity(entity),
            None => false,
        }
    }

    /// World-space boxes of the selected entity's sub-meshes, for outlining.
    pub fn selected_bounds(&mut self, scene: &SceneGraph, models: &ModelManager) -> Vec<Obb> {
        let Some(entity) = self.get_selected_entity(scene) else {
            return Vec::new();
        };
        let (Some(transform), Some(mesh)) = (
            scene.get_component::<Transform>(entity),
            scene.get_component::<StaticMeshComponent>(entity),
        ) else {
            return Vec::new();
        };
        let Some(model) = models.get_model(mesh.model) else {
            return Vec::new();
        };
        let world = transform.matrix();
        model
            .meshes
            .iter()
            .map(|sub| Obb::from_aabb(&sub.aabb, &world))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Material;
    use crate::device::RecordingBackend;

    #[test]
    fn selection_clears_when_the_entity_dies() {
        let mut scene = SceneGraph::new();
        let mut editing = EditingSystem::new();
        let entity = scene.create_entity("selected");
        editing.select(Some(entity));
        assert_eq!(editing.get_selected_entity(&scene), Some(entity));

        scene.destroy_entity(entity);
        assert_eq!(editing.get_selected_entity(&scene), None);
    }

    #[test]
    fn destroy_selected_removes_the_entity() {
        let mut scene = SceneGraph::new();
        let mut editing = EditingSystem::new();
        let entity = scene.create_entity("doomed");
        assert!(!editing.destroy_selected(&mut scene));
        editing.select(Some(entity));
        assert!(editing.destroy_selected(&mut scene));
        assert!(!scene.contains(entity));
        assert_eq!(editing.get_selected_entity(&scene), None);
    }

    #[test]
    fn selected_bounds_follow_the_transform() {
        let mut backend = RecordingBackend::new();
        let mut models = ModelManager::new();
        let cube = models.create_cube(&mut backend, Material::default()).unwrap();
        let mut scene = SceneGraph::new();
        let entity = scene.create_entity("cube");
        scene.add_component(entity, Transform::from_position(glam::Vec3::X * 4.0));
        scene.add_component(entity, StaticMeshComponent::new(cube));

        let mut editing = EditingSystem::new();
        assert!(editing.selected_bounds(&scene, &models).is_empty());
        editing.select(Some(entity));
        let bounds = editing.selected_bounds(&scene, &models);
        assert_eq!(bounds.len(), 1);
        assert!(bounds[0].center.abs_diff_eq(glam::Vec3::X * 4.0, 1e-5));

        editing.reset_selected_entity();
        assert_eq!(editing.get_selected_entity(&scene), None);
    }
}
