//! Bounding volumes, frustums and rays used for culling, shadow fitting and picking.
//!
//! All volumes work in whatever space their inputs are in; the engine uses left-handed
//! world/view spaces (+Z forward), matching the projection helpers in [`crate::camera`].
//!
//! - [`Aabb`]: axis-aligned box, the currency of the shadow cascade fitter
//! - [`Obb`]: oriented box, produced by transforming a mesh AABB into world space
//! - [`Frustum`]: six planes extracted from a view-projection matrix
//! - [`Ray`]: picking ray built by unprojecting a screen position

use glam::{Mat3, Mat4, Vec3, Vec4};

/// An axis-aligned bounding box stored as min/max corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// An inverted box that any merge replaces.
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Smallest box containing every point.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |mut acc, p| {
            acc.min = acc.min.min(p);
            acc.max = acc.max.max(p);
            acc
        })
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// The eight corners, indexed by bits: bit 0 selects `min.x`, bit 1 selects `min.y`,
    /// bit 2 selects `max.z`.
    ///
    /// The ordering is what [`AABB_TRIANGLES`] tessellates.
    pub fn corners(&self) -> [Vec3; 8] {
        std::array::from_fn(|i| {
            Vec3::new(
                if i & 1 != 0 { self.min.x } else { self.max.x },
                if i & 2 != 0 { self.min.y } else { self.max.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            )
        })
    }

    /// Bounding box of this box after an affine transform.
    pub fn transformed(&self, matrix: &Mat4) -> Aabb {
        Aabb::from_points(self.corners().map(|c| matrix.transform_point3(c)))
    }
}

/// Index triples splitting the faces of [`Aabb::corners`] into 12 triangles.
pub const AABB_TRIANGLES: [[usize; 3]; 12] = [
    [0, 1, 2],
    [1, 2, 3],
    [4, 5, 6],
    [5, 6, 7],
    [0, 2, 4],
    [2, 4, 6],
    [1, 3, 5],
    [3, 5, 7],
    [0, 1, 4],
    [1, 4, 5],
    [2, 3, 6],
    [3, 6, 7],
];

/// An oriented bounding box: center, half extents along three orthonormal axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Obb {
    pub center: Vec3,
    pub extents: Vec3,
    /// Columns are the box's local X, Y and Z axes in world space.
    pub orientation: Mat3,
}

impl Obb {
    /// Transforms a local-space AABB by an affine matrix (scale is folded into extents).
    pub fn from_aabb(aabb: &Aabb, matrix: &Mat4) -> Self {
        let axes = [
            matrix.x_axis.truncate(),
            matrix.y_axis.truncate(),
            matrix.z_axis.truncate(),
        ];
        let scale = Vec3::new(axes[0].length(), axes[1].length(), axes[2].length());
        let orientation = Mat3::from_cols(
            axes[0].normalize_or(Vec3::X),
            axes[1].normalize_or(Vec3::Y),
            axes[2].normalize_or(Vec3::Z),
        );
        Self {
            center: matrix.transform_point3(aabb.center()),
            extents: aabb.extents() * scale,
            orientation,
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let local = Aabb::from_center_extents(Vec3::ZERO, self.extents).corners();
        local.map(|c| self.center + self.orientation * c)
    }

    /// Distance along `ray` to the first intersection with the box, if any.
    pub fn intersect_ray(&self, ray: &Ray) -> Option<f32> {
        // Rotate the ray into box space; the orientation is orthonormal so its transpose
        // is its inverse and distances are preserved.
        let inv = self.orientation.transpose();
        let local = Ray {
            origin: inv * (ray.origin - self.center),
            direction: inv * ray.direction,
        };
        local.intersect_aabb(-self.extents, self.extents)
    }
}

/// A plane `dot(normal, p) + d = 0` with the normal pointing inside the volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_vec4(v: Vec4) -> Self {
        let len = v.truncate().length();
        if len > 0.0 {
            Self {
                normal: v.truncate() / len,
                d: v.w / len,
            }
        } else {
            Self {
                normal: Vec3::ZERO,
                d: 0.0,
            }
        }
    }

    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }
}

/// A view frustum as six inward-facing planes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extracts the planes of a D3D-style clip volume (`-w <= x,y <= w`, `0 <= z <= w`).
    ///
    /// Works for both conventional and reversed depth because the two depth planes are
    /// extracted symmetrically.
    pub fn from_matrix(view_proj: &Mat4) -> Self {
        let m = view_proj.transpose();
        let (r0, r1, r2, r3) = (m.x_axis, m.y_axis, m.z_axis, m.w_axis);
        Self {
            planes: [
                Plane::from_vec4(r3 + r0),
                Plane::from_vec4(r3 - r0),
                Plane::from_vec4(r3 + r1),
                Plane::from_vec4(r3 - r1),
                Plane::from_vec4(r2),
                Plane::from_vec4(r3 - r2),
            ],
        }
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(p) >= 0.0)
    }

    /// Conservative box test: `false` only when the box is fully outside one plane.
    pub fn intersects_obb(&self, obb: &Obb) -> bool {
        let axes = [
            obb.orientation.x_axis * obb.extents.x,
            obb.orientation.y_axis * obb.extents.y,
            obb.orientation.z_axis * obb.extents.z,
        ];
        self.planes.iter().all(|plane| {
            let radius: f32 = axes.iter().map(|a| plane.normal.dot(*a).abs()).sum();
            plane.signed_distance(obb.center) >= -radius
        })
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let extents = aabb.extents();
        let center = aabb.center();
        self.planes.iter().all(|plane| {
            let radius = extents.dot(plane.normal.abs());
            plane.signed_distance(center) >= -radius
        })
    }
}

/// A ray in 3D space, used for picking.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    /// Normalized direction.
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Builds a picking ray through a pixel by unprojecting it with the inverse
    /// view-projection matrix.
    ///
    /// Depth 0 and 1 are both unprojected, so the ray is correct for reversed-Z
    /// projections too (its origin then lies on the far plane side, and the direction
    /// is flipped to keep pointing away from the eye).
    pub fn from_screen(
        screen_x: f32,
        screen_y: f32,
        screen_width: f32,
        screen_height: f32,
        view_matrix: Mat4,
        projection_matrix: Mat4,
    ) -> Self {
        let ndc_x = (2.0 * screen_x / screen_width) - 1.0;
        let ndc_y = 1.0 - (2.0 * screen_y / screen_height);

        let inv_view_proj = (projection_matrix * view_matrix).inverse();
        let a = inv_view_proj.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
        let b = inv_view_proj.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));

        let eye = view_matrix.inverse().w_axis.truncate();
        let (near_point, far_point) = if a.distance_squared(eye) <= b.distance_squared(eye) {
            (a, b)
        } else {
            (b, a)
        };

        Self {
            origin: near_point,
            direction: (far_point - near_point).normalize_or_zero(),
        }
    }

    #[inline]
    pub fn point_at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Slab test against an axis-aligned box. Returns the nearest non-negative hit distance.
    pub fn intersect_aabb(&self, min: Vec3, max: Vec3) -> Option<f32> {
        let mut t_min = f32::NEG_INFINITY;
        let mut t_max = f32::INFINITY;

        for i in 0..3 {
            let origin = self.origin[i];
            let dir = self.direction[i];

            if dir.abs() < f32::EPSILON {
                if origin < min[i] || origin > max[i] {
                    return None;
                }
            } else {
                let inv_dir = 1.0 / dir;
                let mut t1 = (min[i] - origin) * inv_dir;
                let mut t2 = (max[i] - origin) * inv_dir;
                if t1 > t2 {
                    std::mem::swap(&mut t1, &mut t2);
                }
                t_min = t_min.max(t1);
                t_max = t_max.min(t2);
                if t_min > t_max {
                    return None;
                }
            }
        }

        if t_min >= 0.0 {
            Some(t_min)
        } else if t_max >= 0.0 {
            Some(t_max)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn camera_frustum() -> Frustum {
        let view = Mat4::look_to_lh(Vec3::ZERO, Vec3::Z, Vec3::Y);
        let proj = Mat4::perspective_lh(60f32.to_radians(), 1.0, 100.0, 0.1);
        Frustum::from_matrix(&(proj * view))
    }

    #[test]
    fn corners_follow_bit_order() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(2.0));
        let c = aabb.corners();
        assert_eq!(c[0], Vec3::new(2.0, 2.0, -1.0));
        assert_eq!(c[3], Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(c[7], Vec3::new(-1.0, -1.0, 2.0));
    }

    #[test]
    fn aabb_triangles_lie_on_faces() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let corners = aabb.corners();
        for tri in AABB_TRIANGLES {
            let pts = tri.map(|i| corners[i]);
            // A face triangle shares one constant coordinate.
            let shared = (0..3).any(|axis| pts.iter().all(|p| p[axis] == pts[0][axis]));
            assert!(shared, "triangle {:?} is not on a face", tri);
        }
    }

    #[test]
    fn reversed_z_frustum_culls_boxes() {
        let frustum = camera_frustum();
        let inside = Obb::from_aabb(
            &Aabb::from_center_extents(Vec3::ZERO, Vec3::splat(0.5)),
            &Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0)),
        );
        let behind = Obb::from_aabb(
            &Aabb::from_center_extents(Vec3::ZERO, Vec3::splat(0.5)),
            &Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0)),
        );
        let beyond_far = Obb::from_aabb(
            &Aabb::from_center_extents(Vec3::ZERO, Vec3::splat(0.5)),
            &Mat4::from_translation(Vec3::new(0.0, 0.0, 150.0)),
        );
        assert!(frustum.intersects_obb(&inside));
        assert!(!frustum.intersects_obb(&behind));
        assert!(!frustum.intersects_obb(&beyond_far));
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, 50.0)));
    }

    #[test]
    fn obb_keeps_rotation_and_scale() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 1.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            Vec3::new(5.0, 0.0, 0.0),
        );
        let obb = Obb::from_aabb(&Aabb::from_center_extents(Vec3::ZERO, Vec3::ONE), &m);
        assert!((obb.extents - Vec3::new(2.0, 1.0, 1.0)).length() < 1e-5);
        assert!((obb.center - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);

        let ray = Ray::new(Vec3::new(5.0, 0.0, -10.0), Vec3::Z);
        // Local X (extent 2) now points along world -Z.
        let hit = obb.intersect_ray(&ray).expect("ray should hit");
        assert!((hit - 8.0).abs() < 1e-4);
    }

    #[test]
    fn screen_ray_points_into_the_scene() {
        let view = Mat4::look_to_lh(Vec3::ZERO, Vec3::Z, Vec3::Y);
        let proj = Mat4::perspective_lh(60f32.to_radians(), 1.0, 100.0, 0.1);
        let ray = Ray::from_screen(50.0, 50.0, 100.0, 100.0, view, proj);
        assert!(ray.direction.dot(Vec3::Z) > 0.999);
        assert!(ray.origin.z < 1.0);
    }
}
