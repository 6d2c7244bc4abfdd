//! The entity registry and its per-frame visibility pass.

use super::components::{
    CameraComponent, DirectionalLightComponent, SkyboxComponent, StaticMeshComponent,
    TagComponent, Transform,
};
use crate::assets::ModelManager;
use crate::camera::Camera;
use crate::collision::{Aabb, Frustum, Obb, Ray};
use glam::{Mat4, Vec3};
use hecs::{Component, Entity, World};

/// A directional light resolved to world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedLight {
    pub entity: Entity,
    /// Direction the light travels.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub cast_shadows: bool,
}

/// Entity-component storage plus the visible set of the last
/// [`frustum_culling`](Self::frustum_culling).
///
/// Culling has no spatial acceleration structure; it is linear in entities times
/// sub-meshes.
#[derive(Default)]
pub struct SceneGraph {
    world: World,
    entities_in_viewer: Vec<Entity>,
    skybox: Option<Entity>,
    scene_bounding_box: Aabb,
}

impl std::fmt::Debug for SceneGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneGraph")
            .field("entities", &self.world.len())
            .field("entities_in_viewer", &self.entities_in_viewer)
            .field("skybox", &self.skybox)
            .field("scene_bounding_box", &self.scene_bounding_box)
            .finish()
    }
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Spawns an entity with a default [`Transform`] and a [`TagComponent`].
    pub fn create_entity(&mut self, name: &str) -> Entity {
        self.world.spawn((Transform::default(), TagComponent::new(name)))
    }

    /// Destroys the entity and every component on it. Returns false for a dead entity.
    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        if self.world.despawn(entity).is_err() {
            return false;
        }
        self.entities_in_viewer.retain(|&e| e != entity);
        if self.skybox == Some(entity) {
            self.skybox = None;
        }
        true
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.world.contains(entity)
    }

    pub fn entity_count(&self) -> u32 {
        self.world.len()
    }

    /// Adds or replaces a component. Returns false for a dead entity.
    pub fn add_component<C: Component>(&mut self, entity: Entity, component: C) -> bool {
        self.world.insert_one(entity, component).is_ok()
    }

    pub fn remove_component<C: Component>(&mut self, entity: Entity) -> Option<C> {
        self.world.remove_one::<C>(entity).ok()
    }

    pub fn has_component<C: Component>(&self, entity: Entity) -> bool {
        self.world.satisfies::<&C>(entity).unwrap_or(false)
    }

    pub fn get_component<C: Component>(&self, entity: Entity) -> Option<hecs::Ref<'_, C>> {
        self.world.get::<&C>(entity).ok()
    }

    pub fn get_component_mut<C: Component>(&self, entity: Entity) -> Option<hecs::RefMut<'_, C>> {
        self.world.get::<&mut C>(entity).ok()
    }

    /// Runs `f` on every entity carrying a `C`.
    pub fn for_each<C: Component>(&mut self, mut f: impl FnMut(Entity, &mut C)) {
        for (entity, component) in self.world.query_mut::<&mut C>() {
            f(entity, component);
        }
    }

    /// First entity whose tag is `name`.
    pub fn find_by_name(&self, name: &str) -> Option<Entity> {
        self.world
            .query::<&TagComponent>()
            .iter()
            .find(|(_, tag)| tag.name == name)
            .map(|(entity, _)| entity)
    }

    /// The primary camera, or the first camera when none is marked primary.
    pub fn primary_camera(&self, aspect: f32) -> Option<(Entity, Camera)> {
        let mut query = self.world.query::<(&Transform, &CameraComponent)>();
        let mut first = None;
        for (entity, (transform, camera)) in query.iter() {
            let resolved = (entity, camera.camera(transform, aspect));
            if camera.primary {
                return Some(resolved);
            }
            first.get_or_insert(resolved);
        }
        first
    }

    /// The first directional light.
    pub fn directional_light(&self) -> Option<ResolvedLight> {
        let mut query = self
            .world
            .query::<(&Transform, &DirectionalLightComponent)>();
        query.iter().next().map(|(entity, (transform, light))| ResolvedLight {
            entity,
            direction: transform.forward().normalize_or(Vec3::NEG_Y),
            color: light.color,
            intensity: light.intensity,
            cast_shadows: light.cast_shadows,
        })
    }

    /// Recomputes the visible set, the skybox entity and the scene bounding box.
    ///
    /// Every sub-mesh's local box is carried into world space as an oriented box and
    /// tested against `frustum`. Meshes on camera or light entities are editor markers
    /// and stay out of the scene bounds; skybox entities are recorded but never culled or
    /// bounded. A mesh whose model no longer resolves is invisible.
    pub fn frustum_culling(&mut self, frustum: &Frustum, models: &ModelManager) {
        self.entities_in_viewer.clear();
        self.skybox = self
            .world
            .query::<&SkyboxComponent>()
            .iter()
            .next()
            .map(|(entity, _)| entity);

        let mut bounds = Aabb::EMPTY;
        let mut query = self.world.query::<(
            &Transform,
            &mut StaticMeshComponent,
            Option<&SkyboxComponent>,
            Option<&CameraComponent>,
            Option<&DirectionalLightComponent>,
        )>();
        for (entity, (transform, mesh, skybox, camera, light)) in query.iter() {
            mesh.submodel_in_frustum.clear();
            mesh.in_frustum = false;
            if skybox.is_some() {
                continue;
            }
            let Some(model) = models.get_model(mesh.model) else {
                continue;
            };

            let world = transform.matrix();
            mesh.submodel_in_frustum.extend(
                model
                    .meshes
                    .iter()
                    .map(|sub| frustum.intersects_obb(&Obb::from_aabb(&sub.aabb, &world))),
            );
            mesh.in_frustum = mesh.submodel_in_frustum.iter().any(|&visible| visible);
            if mesh.in_frustum {
                self.entities_in_viewer.push(entity);
            }
            if camera.is_none() && light.is_none() {
                bounds = bounds.merge(&model.aabb.transformed(&world));
            }
        }
        self.scene_bounding_box = bounds;
        log::debug!(
            "Frustum culling kept {} of {} entities",
            self.entities_in_viewer.len(),
            self.world.len()
        );
    }

    /// Visible entities of the last culling pass, in iteration order.
    pub fn entities_in_viewer(&self) -> &[Entity] {
        &self.entities_in_viewer
    }

    pub fn skybox_entity(&self) -> Option<Entity> {
        self.skybox
    }

    /// Union of the world boxes of every bounded mesh; empty before the first culling
    /// pass or when there are no meshes.
    pub fn scene_bounding_box(&self) -> Aabb {
        self.scene_bounding_box
    }

    /// The first visible entity whose visible sub-meshes `ray` hits.
    ///
    /// Entities are tested in [`entities_in_viewer`](Self::entities_in_viewer) order and
    /// the first hit wins, not the closest one.
    pub fn pick_entity(&self, ray: &Ray, models: &ModelManager) -> Option<Entity> {
        self.entities_in_viewer.iter().copied().find(|&entity| {
            let Ok(mut query) = self
                .world
                .query_one::<(&Transform, &StaticMeshComponent)>(entity)
            else {
                return false;
            };
            let Some((transform, mesh)) = query.get() else {
                return false;
            };
            let Some(model) = models.get_model(mesh.model) else {
                return false;
            };
            let world = transform.matrix();
            model
                .meshes
                .iter()
                .zip(&mesh.submodel_in_frustum)
                .filter(|(_, visible)| **visible)
                .any(|(sub, _)| Obb::from_aabb(&sub.aabb, &world).intersect_ray(ray).is_some())
        })
    }

    /// [`pick_entity`](Self::pick_entity) with a ray through pixel `(x, y)`.
    #[allow(clippy::too_many_arguments)]
    pub fn pick_entity_from_screen(
        &self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        view: Mat4,
        proj: Mat4,
        models: &ModelManager,
    ) -> Option<Entity> {
        let ray = Ray::from_screen(x, y, width, height, view, proj);
        self.pick_entity(&ray, models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{Material, ModelHandle};
    use crate::device::RecordingBackend;

    fn cube_scene() -> (SceneGraph, ModelManager, ModelHandle) {
        let mut backend = RecordingBackend::new();
        let mut models = ModelManager::new();
        let cube = models.create_cube(&mut backend, Material::default()).unwrap();
        (SceneGraph::new(), models, cube)
    }

    fn viewer() -> Camera {
        Camera::new()
            .at(Vec3::new(0.0, 0.0, -10.0))
            .looking_at(Vec3::ZERO)
            .with_aspect(1.0)
    }

    fn spawn_mesh(scene: &mut SceneGraph, name: &str, position: Vec3, model: ModelHandle) -> Entity {
        let entity = scene.create_entity(name);
        scene.add_component(entity, Transform::from_position(position));
        scene.add_component(entity, StaticMeshComponent::new(model));
        entity
    }

    #[test]
    fn culling_is_sound_for_inside_and_outside_boxes() {
        let (mut scene, models, cube) = cube_scene();
        let inside = spawn_mesh(&mut scene, "inside", Vec3::ZERO, cube);
        let behind = spawn_mesh(&mut scene, "behind", Vec3::new(0.0, 0.0, -50.0), cube);
        let beside = spawn_mesh(&mut scene, "beside", Vec3::new(500.0, 0.0, 0.0), cube);

        scene.frustum_culling(&viewer().frustum(), &models);
        assert!(scene.get_component::<StaticMeshComponent>(inside).unwrap().in_frustum);
        assert!(!scene.get_component::<StaticMeshComponent>(behind).unwrap().in_frustum);
        assert!(!scene.get_component::<StaticMeshComponent>(beside).unwrap().in_frustum);
        assert_eq!(scene.entities_in_viewer(), &[inside]);
    }

    #[test]
    fn round_trip_light_and_mesh() {
        let (mut scene, models, cube) = cube_scene();
        let light = scene.create_entity("sun");
        scene.add_component(light, DirectionalLightComponent::default());
        let transform = Transform::from_position(Vec3::new(1.0, 0.5, 2.0)).uniform_scale(2.0);
        let mesh = scene.create_entity("crate");
        scene.add_component(mesh, transform);
        scene.add_component(mesh, StaticMeshComponent::new(cube));

        scene.frustum_culling(&viewer().frustum(), &models);
        assert_eq!(scene.entities_in_viewer(), &[mesh]);
        let expected = models.get_model(cube).unwrap().aabb.transformed(&transform.matrix());
        assert_eq!(scene.scene_bounding_box(), expected);
        assert!(scene.directional_light().is_some());
    }

    #[test]
    fn marker_and_skybox_meshes_stay_out_of_the_bounds() {
        let (mut scene, models, cube) = cube_scene();
        spawn_mesh(&mut scene, "mesh", Vec3::ZERO, cube);
        let camera = spawn_mesh(&mut scene, "camera", Vec3::new(0.0, 0.0, 5.0), cube);
        scene.add_component(camera, CameraComponent::default());

        scene.frustum_culling(&viewer().frustum(), &models);
        let bounds = scene.scene_bounding_box();
        assert!(bounds.max.z < 2.0);
        assert_eq!(scene.entities_in_viewer().len(), 2);
        assert_eq!(scene.skybox_entity(), None);
    }

    #[test]
    fn pick_returns_the_first_visible_hit() {
        let (mut scene, models, cube) = cube_scene();
        let far = spawn_mesh(&mut scene, "far", Vec3::new(0.0, 0.0, 3.0), cube);
        let near = spawn_mesh(&mut scene, "near", Vec3::ZERO, cube);
        let camera = viewer();
        scene.frustum_culling(&camera.frustum(), &models);

        // Both are on the ray; list order wins over distance.
        let hit = scene.pick_entity_from_screen(
            50.0,
            50.0,
            100.0,
            100.0,
            camera.view(),
            camera.projection(),
            &models,
        );
        assert_eq!(hit, Some(far));
        assert_ne!(hit, Some(near));

        let miss = scene.pick_entity_from_screen(
            1.0,
            1.0,
            100.0,
            100.0,
            camera.view(),
            camera.projection(),
            &models,
        );
        assert_eq!(miss, None);
    }

    #[test]
    fn destroying_an_entity_drops_it_from_the_visible_set() {
        let (mut scene, models, cube) = cube_scene();
        let entity = spawn_mesh(&mut scene, "mesh", Vec3::ZERO, cube);
        scene.frustum_culling(&viewer().frustum(), &models);
        assert!(scene.destroy_entity(entity));
        assert!(scene.entities_in_viewer().is_empty());
        assert!(!scene.destroy_entity(entity));
        assert_eq!(scene.find_by_name("mesh"), None);
    }

    #[test]
    fn for_each_visits_every_tag() {
        let mut scene = SceneGraph::new();
        scene.create_entity("a");
        scene.create_entity("b");
        let mut names = Vec::new();
        scene.for_each::<TagComponent>(|_, tag| names.push(tag.name.clone()));
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }
}
