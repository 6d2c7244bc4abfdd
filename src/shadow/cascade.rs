//! Light-space fitting math for cascades.

use crate::collision::{AABB_TRIANGLES, Aabb};
use glam::{Mat4, Vec3, Vec4};

/// Near/far used by [`NearFarFit::ZeroOne`](crate::config::NearFarFit::ZeroOne).
pub const ZERO_ONE_NEAR: f32 = 0.1;
pub const ZERO_ONE_FAR: f32 = 10000.0;

/// Minimum light-space depth range of a cascade.
pub const MIN_DEPTH_RANGE: f32 = 1e-3;

/// One side of a light-space box footprint.
#[derive(Clone, Copy, Debug)]
enum Side {
    MinX(f32),
    MaxX(f32),
    MinY(f32),
    MaxY(f32),
}

impl Side {
    fn distance(self, p: Vec3) -> f32 {
        match self {
            Side::MinX(x) => p.x - x,
            Side::MaxX(x) => x - p.x,
            Side::MinY(y) => p.y - y,
            Side::MaxY(y) => y - p.y,
        }
    }
}

/// Splits a triangle by a side, keeping the part inside it.
fn clip_triangle(triangle: [Vec3; 3], side: Side, out: &mut Vec<[Vec3; 3]>) {
    let d = triangle.map(|p| side.distance(p));
    let inside: Vec<usize> = (0..3).filter(|&i| d[i] >= 0.0).collect();
    let cut = |a: usize, b: usize| {
        let t = d[a] / (d[a] - d[b]);
        triangle[a].lerp(triangle[b], t)
    };

    match inside.len() {
        0 => {}
        3 => out.push(triangle),
        1 => {
            let a = inside[0];
            let (b, c) = ((a + 1) % 3, (a + 2) % 3);
            out.push([triangle[a], cut(a, b), cut(a, c)]);
        }
        _ => {
            let outside = (0..3).find(|i| d[*i] < 0.0).unwrap_or(0);
            let (a, b) = ((outside + 1) % 3, (outside + 2) % 3);
            let ab = cut(b, outside);
            let aa = cut(a, outside);
            out.push([triangle[a], triangle[b], ab]);
            out.push([triangle[a], ab, aa]);
        }
    }
}

/// Light-space depth range of the scene box restricted to the XY footprint
/// `[min, max]` of a cascade.
///
/// Each of the scene box's 12 triangles is clipped against the four side planes of the
/// footprint; the near and far planes are the Z extremes of what survives. Returns `None`
/// when the scene lies entirely outside the footprint.
pub fn compute_near_far(min: Vec3, max: Vec3, scene_light_space: &[Vec3; 8]) -> Option<(f32, f32)> {
    let sides = [
        Side::MinX(min.x),
        Side::MaxX(max.x),
        Side::MinY(min.y),
        Side::MaxY(max.y),
    ];
    let mut near = f32::MAX;
    let mut far = f32::MIN;
    let mut current = Vec::with_capacity(16);
    let mut next = Vec::with_capacity(16);

    for [a, b, c] in AABB_TRIANGLES {
        current.clear();
        current.push([scene_light_space[a], scene_light_space[b], scene_light_space[c]]);
        for side in sides {
            next.clear();
            for triangle in &current {
                clip_triangle(*triangle, side, &mut next);
            }
            std::mem::swap(&mut current, &mut next);
            if current.is_empty() {
                break;
            }
        }
        for point in current.iter().flatten() {
            near = near.min(point.z);
            far = far.max(point.z);
        }
    }

    (near <= far).then_some((near, far))
}

/// Pads a light-space box so its XY size no longer depends on camera orientation.
///
/// `corners` are the light-space corners of the cascade's sub-frustum in near
/// left-top, right-top, right-bottom, left-bottom order followed by the far plane. The
/// footprint becomes `max(sub-frustum diagonal, far-plane diagonal)` wide.
pub fn fix_footprint_size(min: &mut Vec3, max: &mut Vec3, corners: &[Vec3; 8]) {
    let diagonal = (corners[7] - corners[1])
        .length()
        .max((corners[7] - corners[5]).length());
    let size = *max - *min;
    let border = Vec3::new(
        (diagonal - size.x).max(0.0) * 0.5,
        (diagonal - size.y).max(0.0) * 0.5,
        0.0,
    );
    *max += border;
    *min -= border;
}

/// Grows a box by the PCF kernel's share of the shadow map on each side.
pub fn pad_for_kernel(min: &mut Vec3, max: &mut Vec3, pcf_kernel_size: u32, shadow_size: u32) {
    let scale = pcf_kernel_size as f32 / shadow_size.max(1) as f32;
    let border = (*max - *min) * 0.5 * Vec3::new(scale, scale, 0.0);
    *max += border;
    *min -= border;
}

/// Snaps the XY extents of a box to whole texels of its own size.
pub fn snap_to_texels(min: &mut Vec3, max: &mut Vec3, shadow_size: u32) {
    let texel = (*max - *min) / shadow_size.max(1) as f32;
    for axis in 0..2 {
        if texel[axis] > 0.0 {
            min[axis] = (min[axis] / texel[axis]).floor() * texel[axis];
            max[axis] = (max[axis] / texel[axis]).floor() * texel[axis];
        }
    }
}

/// Keeps a depth range usable as a projection: near strictly below far.
pub fn widen_degenerate(near: f32, far: f32) -> (f32, f32) {
    if far - near < MIN_DEPTH_RANGE {
        let mid = (near + far) * 0.5;
        (mid - MIN_DEPTH_RANGE, mid + MIN_DEPTH_RANGE)
    } else {
        (near, far)
    }
}

/// Scale and offset taking light view space to shadow texture coordinates (`xy`) and
/// map depth (`z`) through an orthographic projection.
pub fn texture_scale_offset(proj: &Mat4) -> (Vec4, Vec4) {
    let scale = Vec4::new(0.5 * proj.x_axis.x, -0.5 * proj.y_axis.y, proj.z_axis.z, 1.0);
    let offset = Vec4::new(
        0.5 * proj.w_axis.x + 0.5,
        -0.5 * proj.w_axis.y + 0.5,
        proj.w_axis.z,
        0.0,
    );
    (scale, offset)
}

/// Light-space corners of `scene` under `light_view`, in [`Aabb::corners`] order.
pub fn scene_in_light_space(scene: &Aabb, light_view: &Mat4) -> [Vec3; 8] {
    scene.corners().map(|c| light_view.transform_point3(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_scene() -> [Vec3; 8] {
        Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)).corners()
    }

    #[test]
    fn footprint_covering_scene_keeps_full_depth() {
        let scene = unit_scene();
        let (near, far) =
            compute_near_far(Vec3::splat(-5.0), Vec3::splat(5.0), &scene).unwrap();
        assert_eq!((near, far), (-1.0, 1.0));
    }

    #[test]
    fn disjoint_footprint_yields_nothing() {
        let scene = unit_scene();
        let result = compute_near_far(Vec3::new(3.0, 3.0, 0.0), Vec3::new(4.0, 4.0, 0.0), &scene);
        assert!(result.is_none());
    }

    #[test]
    fn clipped_range_stays_inside_scene_range() {
        // A box rotated in light space so the clip actually trims depth.
        let rotation = Mat4::from_rotation_y(0.7) * Mat4::from_rotation_x(0.4);
        let scene = scene_in_light_space(
            &Aabb::new(Vec3::new(-4.0, -1.0, -2.0), Vec3::new(4.0, 1.0, 6.0)),
            &rotation,
        );
        let scene_aabb = Aabb::from_points(scene);
        let footprints = [
            (Vec3::new(-1.0, -0.5, 0.0), Vec3::new(1.0, 0.5, 0.0)),
            (Vec3::new(2.0, -3.0, 0.0), Vec3::new(6.0, 3.0, 0.0)),
            (Vec3::new(-10.0, -10.0, 0.0), Vec3::new(10.0, 10.0, 0.0)),
        ];
        for (min, max) in footprints {
            let (near, far) = compute_near_far(min, max, &scene).unwrap();
            assert!(near <= far);
            assert!(near >= scene_aabb.min.z - 1e-4, "{} < {}", near, scene_aabb.min.z);
            assert!(far <= scene_aabb.max.z + 1e-4, "{} > {}", far, scene_aabb.max.z);
        }
        let (narrow_near, narrow_far) = compute_near_far(footprints[0].0, footprints[0].1, &scene).unwrap();
        assert!(narrow_far - narrow_near < scene_aabb.max.z - scene_aabb.min.z);
    }

    #[test]
    fn clip_splits_into_two_when_one_vertex_is_outside() {
        let mut out = Vec::new();
        let triangle = [Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0)];
        clip_triangle(triangle, Side::MinX(0.0), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().flatten().all(|p| p.x >= -1e-6));
    }

    #[test]
    fn snapping_is_stable_under_sub_texel_motion() {
        let (mut a_min, mut a_max) = (Vec3::new(0.01, 0.01, 0.0), Vec3::new(10.01, 10.01, 5.0));
        let (mut b_min, mut b_max) = (Vec3::new(0.015, 0.015, 0.0), Vec3::new(10.015, 10.015, 5.0));
        snap_to_texels(&mut a_min, &mut a_max, 1000);
        snap_to_texels(&mut b_min, &mut b_max, 1000);
        assert!((a_min - b_min).abs().max_element() < 1e-5);
        assert_eq!(a_min.z, 0.0);
    }

    #[test]
    fn degenerate_range_is_widened() {
        let (near, far) = widen_degenerate(2.0, 2.0);
        assert!(near < far);
        assert_eq!(widen_degenerate(1.0, 3.0), (1.0, 3.0));
    }

    #[test]
    fn scale_offset_matches_projection() {
        let proj = Mat4::orthographic_lh(-2.0, 6.0, -1.0, 3.0, 1.0, 11.0);
        let (scale, offset) = texture_scale_offset(&proj);
        let p = Vec4::new(-2.0, 3.0, 6.0, 1.0);
        let uvz = p * scale + offset;
        assert!((uvz.x - 0.0).abs() < 1e-5 && (uvz.y - 0.0).abs() < 1e-5);
        assert!((uvz.z - 0.5).abs() < 1e-5);
    }
}
