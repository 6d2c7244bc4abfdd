//! Wireframe overlays: bounding boxes, frusta and light directions drawn as line lists.
//!
//! Lines are batched on the CPU during the frame and uploaded in one go by
//! [`GizmosWireEffect::draw`]; the vertex buffer only ever grows.

use super::{ShaderEntry, add_shaders, set_mat4};
use crate::collision::{Aabb, Obb};
use crate::device::{
    BufferDesc, BufferId, BufferKind, DepthStencilState, RasterizerState, RenderBackend,
    ResourceId, VertexLayout,
};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;
use glam::{Mat4, Vec3, Vec4};

const SOURCE: &str = include_str!("../shaders/gizmos.wgsl");

const INITIAL_VERTICES: usize = 4096;

/// Vertex of a gizmo line.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GizmoVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl GizmoVertex {
    pub const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x4];

    pub const LAYOUT: VertexLayout = VertexLayout {
        stride: std::mem::size_of::<GizmoVertex>() as u64,
        attributes: &Self::ATTRIBUTES,
    };
}

/// Edges of [`Aabb::corners`]: corners that differ in exactly one index bit.
const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (2, 3),
    (4, 5),
    (6, 7),
    (0, 2),
    (1, 3),
    (4, 6),
    (5, 7),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

/// Edges of a frustum given as a near ring followed by a far ring.
const FRUSTUM_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (4, 5),
    (5, 6),
    (6, 7),
    (7, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

#[derive(Debug)]
pub struct GizmosWireEffect {
    effect: EffectHelper,
    vertices: Vec<GizmoVertex>,
    buffer: Option<BufferId>,
    capacity: usize,
}

impl GizmosWireEffect {
    pub fn new(backend: &mut dyn RenderBackend, compiler: &ShaderCompiler) -> Result<Self, EngineError> {
        let mut effect = EffectHelper::new();
        add_shaders(
            &mut effect,
            compiler,
            backend,
            SOURCE,
            &[
                ShaderEntry::new("gizmos.vs_wire", "vs_wire"),
                ShaderEntry::new("gizmos.ps_wire", "ps_wire"),
            ],
        )?;
        effect.add_effect_pass("Wire", &EffectPassDesc::graphics("gizmos.vs_wire", "gizmos.ps_wire"))?;
        if let Some(pass) = effect.get_effect_pass("Wire") {
            pass.set_topology(wgpu::PrimitiveTopology::LineList);
            pass.set_rasterizer_state(RasterizerState {
                cull_mode: None,
                ..Default::default()
            });
            // Occluded by the scene but never occluding it
            pass.set_depth_stencil_state(DepthStencilState {
                depth_write: false,
                ..DepthStencilState::REVERSED_Z
            });
            pass.set_blend_state(Some(wgpu::BlendState::ALPHA_BLENDING));
        }
        Ok(Self {
            effect,
            vertices: Vec::new(),
            buffer: None,
            capacity: 0,
        })
    }

    pub fn set_view_proj(&mut self, view_proj: &Mat4) {
        set_mat4(&mut self.effect, "view_proj", view_proj);
    }

    pub fn add_line(&mut self, from: Vec3, to: Vec3, color: Vec4) {
        let color = color.to_array();
        self.vertices.push(GizmoVertex {
            position: from.to_array(),
            color,
        });
        self.vertices.push(GizmoVertex {
            position: to.to_array(),
            color,
        });
    }

    pub fn add_aabb(&mut self, aabb: &Aabb, color: Vec4) {
        if aabb.is_empty() {
            return;
        }
        self.add_edges(&aabb.corners(), &BOX_EDGES, color);
    }

    pub fn add_obb(&mut self, obb: &Obb, color: Vec4) {
        self.add_edges(&obb.corners(), &BOX_EDGES, color);
    }

    /// Frustum from its corners: the near ring then the far ring, each wound the same way.
    pub fn add_frustum(&mut self, corners: &[Vec3; 8], color: Vec4) {
        self.add_edges(corners, &FRUSTUM_EDGES, color);
    }

    /// Frustum of a view-projection matrix, for camera or light volumes.
    pub fn add_frustum_from_matrix(&mut self, view_proj: &Mat4, color: Vec4) {
        let inverse = view_proj.inverse();
        let ring = [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)];
        let corners: [Vec3; 8] = std::array::from_fn(|i| {
            let (x, y) = ring[i % 4];
            let z = if i < 4 { 0.0 } else { 1.0 };
            inverse.project_point3(Vec3::new(x, y, z))
        });
        self.add_frustum(&corners, color);
    }

    /// An arrow from `origin` along the direction light travels.
    pub fn add_light_direction(&mut self, origin: Vec3, direction: Vec3, length: f32, color: Vec4) {
        let direction = direction.normalize_or(Vec3::NEG_Y);
        let tip = origin + direction * length;
        self.add_line(origin, tip, color);

        let side = if direction.y.abs() > 0.99 { Vec3::X } else { Vec3::Y };
        let side = direction.cross(side).normalize();
        let back = tip - direction * length * 0.15;
        self.add_line(tip, back + side * length * 0.08, color);
        self.add_line(tip, back - side * length * 0.08, color);
    }

    fn add_edges(&mut self, corners: &[Vec3; 8], edges: &[(usize, usize)], color: Vec4) {
        for &(a, b) in edges {
            self.add_line(corners[a], corners[b], color);
        }
    }

    pub fn line_count(&self) -> usize {
        self.vertices.len() / 2
    }

    pub fn vertices(&self) -> &[GizmoVertex] {
        &self.vertices
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    /// Uploads and draws every batched line into the bound targets, then clears the batch.
    pub fn draw(&mut self, backend: &mut dyn RenderBackend) -> Result<(), EngineError> {
        if self.vertices.is_empty() {
            return Ok(());
        }
        if self.buffer.is_none() || self.capacity < self.vertices.len() {
            if let Some(old) = self.buffer.take() {
                backend.destroy(ResourceId::Buffer(old));
            }
            let capacity = self.vertices.len().next_power_of_two().max(INITIAL_VERTICES);
            let desc = BufferDesc {
                label: "gizmo_vertices".to_string(),
                size: (capacity * std::mem::size_of::<GizmoVertex>()) as u64,
                kind: BufferKind::Vertex,
            };
            self.buffer = Some(backend.create_buffer(&desc, None)?);
            self.capacity = capacity;
        }
        let Some(buffer) = self.buffer else {
            return Ok(());
        };
        backend.update_buffer(buffer, 0, bytemuck::cast_slice(&self.vertices));
        if self.effect.apply_pass("Wire", backend) {
            backend.set_vertex_buffer(Some(buffer), Some(GizmoVertex::LAYOUT));
            backend.set_index_buffer(None);
            backend.draw(self.vertices.len() as u32, 0);
        }
        self.vertices.clear();
        Ok(())
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy(ResourceId::Buffer(buffer));
        }
        self.capacity = 0;
        self.effect.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, RecordingBackend};

    fn gizmos() -> (RecordingBackend, GizmosWireEffect) {
        let mut backend = RecordingBackend::new();
        let gizmos = GizmosWireEffect::new(&mut backend, &ShaderCompiler::new()).unwrap();
        (backend, gizmos)
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(GizmoVertex::LAYOUT.stride, 28);
    }

    #[test]
    fn box_edges_have_unit_length_on_a_unit_box() {
        let (_, mut gizmos) = gizmos();
        gizmos.add_aabb(&Aabb::new(Vec3::ZERO, Vec3::ONE), Vec4::ONE);
        assert_eq!(gizmos.line_count(), 12);
        for line in gizmos.vertices().chunks(2) {
            let a = Vec3::from_array(line[0].position);
            let b = Vec3::from_array(line[1].position);
            assert!((a.distance(b) - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn empty_boxes_draw_nothing() {
        let (_, mut gizmos) = gizmos();
        gizmos.add_aabb(&Aabb::EMPTY, Vec4::ONE);
        assert_eq!(gizmos.line_count(), 0);
    }

    #[test]
    fn frustum_from_identity_is_the_ndc_box() {
        let (_, mut gizmos) = gizmos();
        gizmos.add_frustum_from_matrix(&Mat4::IDENTITY, Vec4::ONE);
        assert_eq!(gizmos.line_count(), 12);
        for vertex in gizmos.vertices() {
            let [x, y, z] = vertex.position;
            assert_eq!(x.abs(), 1.0);
            assert_eq!(y.abs(), 1.0);
            assert!(z == 0.0 || z == 1.0);
        }
    }

    #[test]
    fn draw_uploads_once_and_clears() {
        let (mut backend, mut gizmos) = gizmos();
        gizmos.add_line(Vec3::ZERO, Vec3::X, Vec4::ONE);
        gizmos.add_light_direction(Vec3::ZERO, Vec3::NEG_Y, 2.0, Vec4::ONE);
        assert_eq!(gizmos.line_count(), 4);
        backend.take_commands();

        gizmos.draw(&mut backend).unwrap();
        assert!(backend.commands().contains(&Command::Draw {
            vertex_count: 8,
            start_vertex: 0,
        }));
        assert_eq!(gizmos.line_count(), 0);

        backend.take_commands();
        gizmos.draw(&mut backend).unwrap();
        assert!(backend.commands().is_empty());
    }
}
