//! Models: CPU geometry, GPU meshes and the manager that owns them.
//!
//! # Vertex Layout
//!
//! [`Vertex3d`] is 32 bytes:
//!
//! | Attribute | Format    | Offset | Shader Location |
//! |-----------|-----------|--------|-----------------|
//! | position  | Float32x3 | 0      | 0               |
//! | normal    | Float32x3 | 12     | 1               |
//! | uv        | Float32x2 | 24     | 2               |
//!
//! # Winding
//!
//! World space is left-handed and front faces wind clockwise on screen. For a triangle
//! `a, b, c` that means `(b - a) x (c - a)` points out of the surface. Built-in primitives
//! follow this; STL files (right-handed, counter-clockwise) are mirrored on Z when loaded.

use super::{ModelHandle, TextureHandle};
use crate::arena::Arena;
use crate::collision::Aabb;
use crate::device::{BufferDesc, BufferId, BufferKind, RenderBackend, ResourceId, VertexLayout};
use crate::error::EngineError;
use glam::{Vec3, Vec4};
use std::collections::HashMap;
use std::path::Path;

/// A vertex with position, normal and texture coordinates.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex3d {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex3d {
    pub const ATTRIBUTES: [wgpu::VertexAttribute; 3] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];

    pub const LAYOUT: VertexLayout = VertexLayout {
        stride: std::mem::size_of::<Vertex3d>() as u64,
        attributes: &Self::ATTRIBUTES,
    };

    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// Indexed triangle geometry before upload.
#[derive(Clone, Debug, Default)]
pub struct MeshGeometry {
    pub vertices: Vec<Vertex3d>,
    pub indices: Vec<u32>,
}

impl MeshGeometry {
    pub fn new(vertices: Vec<Vertex3d>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from(v.position)))
    }

    /// Unit cube centered at the origin.
    pub fn cube() -> Self {
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        ];
        let mut geometry = Self::default();
        for (normal, u, v) in faces {
            let base = geometry.vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = (normal + u * su + v * sv) * 0.5;
                geometry.vertices.push(Vertex3d::new(
                    position.into(),
                    normal.into(),
                    [(su + 1.0) * 0.5, (1.0 - sv) * 0.5],
                ));
            }
            // u x v is the outward normal.
            geometry
                .indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        geometry
    }

    /// UV sphere of radius 0.5.
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let (segments, rings) = (segments.max(3), rings.max(2));
        let mut geometry = Self::default();
        for ring in 0..=rings {
            let phi = std::f32::consts::PI * ring as f32 / rings as f32;
            let (y, ring_radius) = (phi.cos(), phi.sin());
            for seg in 0..=segments {
                let theta = std::f32::consts::TAU * seg as f32 / segments as f32;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());
                geometry.vertices.push(Vertex3d::new(
                    (normal * 0.5).into(),
                    normal.into(),
                    [seg as f32 / segments as f32, ring as f32 / rings as f32],
                ));
            }
        }
        for ring in 0..rings {
            for seg in 0..segments {
                let current = ring * (segments + 1) + seg;
                let next = current + segments + 1;
                geometry.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }
        geometry
    }

    /// Square on the XZ plane facing +Y.
    pub fn plane(size: f32) -> Self {
        let half = size * 0.5;
        let up = [0.0, 1.0, 0.0];
        Self::new(
            vec![
                Vertex3d::new([-half, 0.0, -half], up, [0.0, 1.0]),
                Vertex3d::new([half, 0.0, -half], up, [1.0, 1.0]),
                Vertex3d::new([half, 0.0, half], up, [1.0, 0.0]),
                Vertex3d::new([-half, 0.0, half], up, [0.0, 0.0]),
            ],
            vec![0, 2, 1, 0, 3, 2],
        )
    }

    /// Parses binary or ASCII STL, mirroring it into left-handed space. The mirror flips
    /// handedness, so each triangle's winding is reversed to keep it front-facing.
    pub fn from_stl<R: std::io::Read + std::io::Seek>(reader: &mut R) -> Result<Self, EngineError> {
        let stl = stl_io::read_stl(reader)
            .map_err(|e| EngineError::Geometry(format!("STL parse error: {}", e)))?;

        let mut geometry = Self {
            vertices: Vec::with_capacity(stl.faces.len() * 3),
            indices: Vec::with_capacity(stl.faces.len() * 3),
        };
        for face in &stl.faces {
            let normal = [face.normal[0], face.normal[1], -face.normal[2]];
            let base = geometry.vertices.len() as u32;
            for &index in &face.vertices {
                let v = stl.vertices.get(index).ok_or_else(|| {
                    EngineError::Geometry(format!("STL face references vertex {}", index))
                })?;
                geometry
                    .vertices
                    .push(Vertex3d::new([v[0], v[1], -v[2]], normal, [0.0, 0.0]));
            }
            geometry.indices.extend_from_slice(&[base, base + 2, base + 1]);
        }
        if geometry.normals_missing() {
            geometry.recalculate_normals();
        }
        Ok(geometry)
    }

    fn normals_missing(&self) -> bool {
        self.vertices
            .iter()
            .any(|v| Vec3::from(v.normal).length_squared() < 1e-8)
    }

    /// Smooth normals from area-weighted face normals.
    pub fn recalculate_normals(&mut self) {
        let mut normals = vec![Vec3::ZERO; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let (Some(a), Some(b), Some(c)) = (
                self.vertices.get(i0),
                self.vertices.get(i1),
                self.vertices.get(i2),
            ) else {
                continue;
            };
            let (a, b, c) = (Vec3::from(a.position), Vec3::from(b.position), Vec3::from(c.position));
            let face = (b - a).cross(c - a);
            for i in [i0, i1, i2] {
                normals[i] += face;
            }
        }
        for (vertex, normal) in self.vertices.iter_mut().zip(normals) {
            vertex.normal = normal.normalize_or_zero().into();
        }
    }
}

/// Surface parameters of a sub-mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub albedo_texture: Option<TextureHandle>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
            albedo_texture: None,
        }
    }
}

/// One uploaded sub-mesh.
#[derive(Debug)]
pub struct MeshData {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub index_count: u32,
    pub material_index: usize,
    /// Model-space bounds.
    pub aabb: Aabb,
}

/// A loaded model: sub-meshes plus their materials.
#[derive(Debug)]
pub struct Model {
    pub name: String,
    pub meshes: Vec<MeshData>,
    pub materials: Vec<Material>,
    /// Model-space bounds of every sub-mesh.
    pub aabb: Aabb,
}

impl Model {
    pub fn material(&self, mesh: &MeshData) -> Option<&Material> {
        self.materials.get(mesh.material_index)
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        for mesh in self.meshes.drain(..) {
            backend.destroy(ResourceId::Buffer(mesh.vertex_buffer));
            backend.destroy(ResourceId::Buffer(mesh.index_buffer));
        }
    }
}

/// Owns every model, keyed by file path or primitive name.
#[derive(Debug, Default)]
pub struct ModelManager {
    models: Arena<Model>,
    by_name: HashMap<String, ModelHandle>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a model file, or returns the handle of the copy already loaded from `path`.
    pub fn create_from_file(
        &mut self,
        backend: &mut dyn RenderBackend,
        path: impl AsRef<Path>,
    ) -> Result<ModelHandle, EngineError> {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        if let Some(handle) = self.find(&name) {
            return Ok(handle);
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        let geometry = match ext.as_str() {
            "stl" => {
                let file = std::fs::File::open(path)?;
                MeshGeometry::from_stl(&mut std::io::BufReader::new(file))?
            }
            _ => {
                return Err(EngineError::Geometry(format!(
                    "unknown model format '{}' for {}",
                    ext,
                    path.display()
                )));
            }
        };
        log::info!(
            "Loaded model {} ({} triangles)",
            path.display(),
            geometry.indices.len() / 3
        );
        self.create_from_geometry(backend, &name, &[geometry], vec![Material::default()])
    }

    /// Uploads sub-meshes under `name`; `materials[i]` belongs to sub-mesh `i` (the last
    /// material is reused when there are fewer).
    pub fn create_from_geometry(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        meshes: &[MeshGeometry],
        mut materials: Vec<Material>,
    ) -> Result<ModelHandle, EngineError> {
        if let Some(handle) = self.find(name) {
            return Ok(handle);
        }
        if materials.is_empty() {
            materials.push(Material::default());
        }

        let mut model = Model {
            name: name.to_string(),
            meshes: Vec::with_capacity(meshes.len()),
            materials,
            aabb: Aabb::EMPTY,
        };
        for (i, geometry) in meshes.iter().enumerate() {
            match upload(backend, name, i, geometry) {
                Ok((vertex_buffer, index_buffer)) => {
                    let aabb = geometry.bounds();
                    model.aabb = model.aabb.merge(&aabb);
                    model.meshes.push(MeshData {
                        vertex_buffer,
                        index_buffer,
                        index_count: geometry.indices.len() as u32,
                        material_index: i.min(model.materials.len() - 1),
                        aabb,
                    });
                }
                Err(e) => {
                    model.release(backend);
                    return Err(e);
                }
            }
        }

        let handle = ModelHandle(self.models.insert(model));
        self.by_name.insert(name.to_string(), handle);
        Ok(handle)
    }

    pub fn create_cube(&mut self, backend: &mut dyn RenderBackend, material: Material) -> Result<ModelHandle, EngineError> {
        self.create_from_geometry(backend, "@cube", &[MeshGeometry::cube()], vec![material])
    }

    pub fn create_sphere(&mut self, backend: &mut dyn RenderBackend, material: Material) -> Result<ModelHandle, EngineError> {
        self.create_from_geometry(backend, "@sphere", &[MeshGeometry::sphere(48, 24)], vec![material])
    }

    pub fn create_plane(
        &mut self,
        backend: &mut dyn RenderBackend,
        size: f32,
        material: Material,
    ) -> Result<ModelHandle, EngineError> {
        let name = format!("@plane{}", size);
        self.create_from_geometry(backend, &name, &[MeshGeometry::plane(size)], vec![material])
    }

    pub fn find(&self, name: &str) -> Option<ModelHandle> {
        self.by_name
            .get(name)
            .copied()
            .filter(|h| self.models.contains(h.0))
    }

    pub fn get_model(&self, handle: ModelHandle) -> Option<&Model> {
        self.models.get(handle.0)
    }

    pub fn get_model_mut(&mut self, handle: ModelHandle) -> Option<&mut Model> {
        self.models.get_mut(handle.0)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Frees a model. Handles to it stop resolving.
    pub fn remove(&mut self, backend: &mut dyn RenderBackend, handle: ModelHandle) -> bool {
        match self.models.remove(handle.0) {
            Some(mut model) => {
                self.by_name.remove(&model.name);
                model.release(backend);
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        let handles: Vec<_> = self.by_name.values().copied().collect();
        for handle in handles {
            self.remove(backend, handle);
        }
    }
}

fn upload(
    backend: &mut dyn RenderBackend,
    name: &str,
    index: usize,
    geometry: &MeshGeometry,
) -> Result<(BufferId, BufferId), EngineError> {
    if geometry.vertices.is_empty() || geometry.indices.is_empty() {
        return Err(EngineError::Geometry(format!("model '{}' mesh {} is empty", name, index)));
    }
    let vertices: &[u8] = bytemuck::cast_slice(&geometry.vertices);
    let vertex_buffer = backend.create_buffer(
        &BufferDesc {
            label: format!("{} Vertices {}", name, index),
            size: vertices.len() as u64,
            kind: BufferKind::Vertex,
        },
        Some(vertices),
    )?;
    let indices: &[u8] = bytemuck::cast_slice(&geometry.indices);
    match backend.create_buffer(
        &BufferDesc {
            label: format!("{} Indices {}", name, index),
            size: indices.len() as u64,
            kind: BufferKind::Index,
        },
        Some(indices),
    ) {
        Ok(index_buffer) => Ok((vertex_buffer, index_buffer)),
        Err(e) => {
            backend.destroy(ResourceId::Buffer(vertex_buffer));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingBackend;

    fn assert_outward(geometry: &MeshGeometry) {
        let center = geometry.bounds().center();
        for tri in geometry.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(geometry.vertices[i as usize].position));
            let face = (b - a).cross(c - a);
            if face.length_squared() < 1e-10 {
                continue;
            }
            let centroid = (a + b + c) / 3.0;
            assert!(face.dot(centroid - center) > 0.0, "inward triangle {:?}", tri);
        }
    }

    #[test]
    fn primitives_wind_outward() {
        assert_outward(&MeshGeometry::cube());
        assert_outward(&MeshGeometry::sphere(16, 8));
        let plane = MeshGeometry::plane(2.0);
        for tri in plane.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(plane.vertices[i as usize].position));
            assert!((b - a).cross(c - a).y > 0.0);
        }
    }

    #[test]
    fn cube_normals_match_faces() {
        let cube = MeshGeometry::cube();
        assert_eq!(cube.vertices.len(), 24);
        for v in &cube.vertices {
            let p = Vec3::from(v.position);
            let n = Vec3::from(v.normal);
            assert!((p.dot(n) - 0.5).abs() < 1e-6);
        }
        assert_eq!(cube.bounds(), Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)));
    }

    #[test]
    fn stl_is_mirrored_into_left_handed_space() {
        let mut stl = Vec::new();
        let mesh = [stl_io::Triangle {
            normal: stl_io::Normal::new([0.0, 0.0, 1.0]),
            vertices: [
                stl_io::Vertex::new([0.0, 0.0, 1.0]),
                stl_io::Vertex::new([1.0, 0.0, 1.0]),
                stl_io::Vertex::new([0.0, 1.0, 1.0]),
            ],
        }];
        stl_io::write_stl(&mut stl, mesh.iter()).unwrap();
        let geometry = MeshGeometry::from_stl(&mut std::io::Cursor::new(stl)).unwrap();
        assert_eq!(geometry.vertices[0].position, [0.0, 0.0, -1.0]);
        assert_eq!(geometry.vertices[0].normal, [0.0, 0.0, -1.0]);
        let [a, b, c] = [0, 1, 2].map(|i| Vec3::from(geometry.vertices[geometry.indices[i] as usize].position));
        assert!((b - a).cross(c - a).z < 0.0);
    }

    #[test]
    fn models_are_deduplicated_and_handles_go_stale() {
        let mut backend = RecordingBackend::new();
        let mut models = ModelManager::new();
        let cube = models.create_cube(&mut backend, Material::default()).unwrap();
        assert_eq!(models.create_cube(&mut backend, Material::default()).unwrap(), cube);
        assert_eq!(models.len(), 1);

        let model = models.get_model(cube).unwrap();
        assert_eq!(model.meshes[0].index_count, 36);
        assert_eq!(model.aabb, model.meshes[0].aabb);

        assert!(models.remove(&mut backend, cube));
        assert!(models.get_model(cube).is_none());
        let again = models.create_cube(&mut backend, Material::default()).unwrap();
        assert_ne!(again, cube);
    }

    #[test]
    fn unknown_files_are_rejected() {
        let mut backend = RecordingBackend::new();
        let mut models = ModelManager::new();
        assert!(matches!(
            models.create_from_file(&mut backend, "mesh.fbx"),
            Err(EngineError::Geometry(_))
        ));
        assert!(matches!(
            models.create_from_file(&mut backend, "definitely/missing.stl"),
            Err(EngineError::Io(_))
        ));
    }
}
