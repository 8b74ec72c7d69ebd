// Cascaded shadow map projection math
//
// Splits the camera frustum into SHADOWMAP_CASCADE_COUNT sub-frustums
// along the view axis and fits a light-space orthographic projection
// around each. The splits mix a logarithmic and a uniform distribution
// so near cascades get most of the resolution.
//
// Based on the usual Sascha Willems cascade fitting scheme.
use cgmath::{
    EuclideanSpace, InnerSpace, Matrix4, Point3, SquareMatrix, Vector3, Vector4,
};

use crate::SHADOWMAP_CASCADE_COUNT;

const CASCADE_SPLIT_LAMBDA: f32 = 0.95;
const NEAR_CLIP: f32 = 0.001;
const FAR_CLIP: f32 = 500.0;

/// Per-frame output of the cascade computer.
///
/// The view-proj array feeds the shadow pass (one matrix per cascade,
/// selected through the per-cascade push constant) and the split depths
/// feed the scene fragment shaders so they can pick which cascade to
/// sample.
#[derive(Debug, Copy, Clone)]
pub struct CascadeSet {
    pub cs_view_proj: [Matrix4<f32>; SHADOWMAP_CASCADE_COUNT],
    pub cs_split_depths: [f32; SHADOWMAP_CASCADE_COUNT],
}

impl CascadeSet {
    pub fn identity() -> Self {
        Self {
            cs_view_proj: [Matrix4::identity(); SHADOWMAP_CASCADE_COUNT],
            cs_split_depths: [0.0; SHADOWMAP_CASCADE_COUNT],
        }
    }
}

/// Normalized split positions along the clip range.
///
/// d_i = lambda * log_i + (1 - lambda) * uniform_i, remapped into
/// [0, 1] over the clip range. Strictly increasing for any lambda in
/// [0, 1] since both distributions are.
fn split_positions() -> [f32; SHADOWMAP_CASCADE_COUNT] {
    let clip_range = FAR_CLIP - NEAR_CLIP;
    let min_z = NEAR_CLIP;
    let max_z = NEAR_CLIP + clip_range;
    let range = max_z - min_z;
    let ratio = max_z / min_z;

    let mut splits = [0.0; SHADOWMAP_CASCADE_COUNT];
    for i in 0..SHADOWMAP_CASCADE_COUNT {
        let p = (i + 1) as f32 / SHADOWMAP_CASCADE_COUNT as f32;
        let log = min_z * ratio.powf(p);
        let uniform = min_z + range * p;
        let d = CASCADE_SPLIT_LAMBDA * (log - uniform) + uniform;
        splits[i] = (d - NEAR_CLIP) / clip_range;
    }
    splits
}

/// The eight NDC corners of a frustum.
///
///         4 --- 5     Y
///       /     / |     /\  Z
///     0 --- 1   |     | /
///     |     |   6     .--> X
///     |     | /
///     3 --- 2
fn ndc_corners() -> [Vector3<f32>; 8] {
    [
        Vector3::new(-1.0, 1.0, -1.0),
        Vector3::new(1.0, 1.0, -1.0),
        Vector3::new(1.0, -1.0, -1.0),
        Vector3::new(-1.0, -1.0, -1.0),
        Vector3::new(-1.0, 1.0, 1.0),
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(1.0, -1.0, 1.0),
        Vector3::new(-1.0, -1.0, 1.0),
    ]
}

fn unproject_corners(inv_cam: &Matrix4<f32>) -> [Vector3<f32>; 8] {
    let mut corners = ndc_corners();
    for c in corners.iter_mut() {
        let inv = inv_cam * Vector4::new(c.x, c.y, c.z, 1.0);
        *c = Vector3::new(inv.x, inv.y, inv.z) * (1.0 / inv.w);
    }
    corners
}

/// World-space corners of the sub-frustum between two normalized split
/// positions, interpolated along the four frustum edges.
fn sub_frustum_corners(
    world_corners: &[Vector3<f32>; 8],
    last_split: f32,
    split: f32,
) -> [Vector3<f32>; 8] {
    let mut corners = *world_corners;
    for i in 0..4 {
        let dist = corners[i + 4] - corners[i];
        corners[i + 4] = corners[i] + dist * split;
        corners[i] += dist * last_split;
    }
    corners
}

/// Build the light-space view-proj matrix for one set of sub-frustum
/// corners.
///
/// The corners are wrapped in a bounding sphere and the sphere radius
/// snapped up to 1/16 units, which keeps the ortho window from crawling
/// by sub-texel amounts as the camera rotates (shadow shimmering).
fn fit_light_matrix(corners: &[Vector3<f32>; 8], light_dir: Vector3<f32>) -> Matrix4<f32> {
    let mut center = Vector3::new(0.0, 0.0, 0.0);
    for c in corners.iter() {
        center += *c;
    }
    center *= 1.0 / 8.0;

    let mut radius: f32 = 0.0;
    for c in corners.iter() {
        radius = radius.max((c - center).magnitude());
    }

    let snapped = (radius * 16.0).ceil() / 16.0;
    let max_extents = Vector3::new(snapped, snapped, snapped);
    let min_extents = -max_extents;

    let eye = center - light_dir * (-min_extents.z);
    let view = Matrix4::look_at(
        Point3::from_vec(eye),
        Point3::from_vec(center),
        Vector3::new(0.0, -1.0, 0.0),
    );

    // The near plane has to reach well behind the sphere so casters
    // between the light and the cascade still land in the map.
    let proj = cgmath::ortho(
        min_extents.x,
        max_extents.x,
        min_extents.y,
        max_extents.y,
        -50.0,
        max_extents.z - min_extents.z,
    );

    proj * view
}

/// Recompute the full cascade set from the camera and light direction.
///
/// `light_dir` must be a unit vector pointing from the light toward the
/// scene. Split depths come back in view-space units, strictly
/// increasing inside (near, far).
pub fn compute(
    camera_projection: &Matrix4<f32>,
    camera_view: &Matrix4<f32>,
    light_dir: Vector3<f32>,
) -> CascadeSet {
    let clip_range = FAR_CLIP - NEAR_CLIP;
    let splits = split_positions();

    let inv_cam = (camera_projection * camera_view)
        .invert()
        .expect("camera matrix is not invertible");
    let world_corners = unproject_corners(&inv_cam);

    let mut out = CascadeSet::identity();
    let mut last_split = 0.0;
    for i in 0..SHADOWMAP_CASCADE_COUNT {
        let corners = sub_frustum_corners(&world_corners, last_split, splits[i]);
        out.cs_view_proj[i] = fit_light_matrix(&corners, light_dir);
        out.cs_split_depths[i] = NEAR_CLIP + splits[i] * clip_range;
        last_split = splits[i];
    }

    out
}

/// Extract the six frustum planes of a view-proj matrix, one vec4 per
/// plane in (normal.xyz, d) form. Consumed by the tessellation control
/// shader for patch culling.
pub fn frustum_planes(view_proj: &Matrix4<f32>) -> [Vector4<f32>; 6] {
    // rows of the matrix; cgmath stores columns
    let row = |r: usize| {
        Vector4::new(
            view_proj[0][r],
            view_proj[1][r],
            view_proj[2][r],
            view_proj[3][r],
        )
    };
    let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

    let mut planes = [
        r3 + r0, // left
        r3 - r0, // right
        r3 + r1, // bottom
        r3 - r1, // top
        r3 + r2, // near
        r3 - r2, // far
    ];

    for p in planes.iter_mut() {
        let len = Vector3::new(p.x, p.y, p.z).magnitude();
        if len > 0.0 {
            *p /= len;
        }
    }

    planes
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{perspective, Deg};

    fn test_camera() -> (Matrix4<f32>, Matrix4<f32>) {
        let proj = perspective(Deg(60.0), 16.0 / 9.0, NEAR_CLIP, FAR_CLIP);
        let view = Matrix4::look_at(
            Point3::new(10.0, 5.0, -3.0),
            Point3::new(0.0, 0.0, 12.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        (proj, view)
    }

    #[test]
    fn split_depths_strictly_increase_within_clip_range() {
        let (proj, view) = test_camera();
        let set = compute(&proj, &view, Vector3::new(0.3, -0.8, 0.2).normalize());

        let mut prev = NEAR_CLIP;
        for d in set.cs_split_depths.iter() {
            assert!(*d > prev, "split depths must strictly increase");
            assert!(*d <= FAR_CLIP + 1.0e-3);
            prev = *d;
        }
        // last split lands on the far plane
        assert!((set.cs_split_depths[SHADOWMAP_CASCADE_COUNT - 1] - FAR_CLIP).abs() < 1.0e-2);
    }

    #[test]
    fn cascades_enclose_their_sub_frustums() {
        let (proj, view) = test_camera();
        let light_dir = Vector3::new(0.4, -0.7, 0.59).normalize();
        let set = compute(&proj, &view, light_dir);

        let inv_cam = (proj * view).invert().unwrap();
        let world_corners = unproject_corners(&inv_cam);
        let splits = split_positions();

        let mut last_split = 0.0;
        for i in 0..SHADOWMAP_CASCADE_COUNT {
            let corners = sub_frustum_corners(&world_corners, last_split, splits[i]);
            for c in corners.iter() {
                let clip = set.cs_view_proj[i] * Vector4::new(c.x, c.y, c.z, 1.0);
                let ndc = Vector3::new(clip.x, clip.y, clip.z) * (1.0 / clip.w);
                assert!(ndc.x.abs() <= 1.0 + 1.0e-3, "x out of cascade {}: {:?}", i, ndc);
                assert!(ndc.y.abs() <= 1.0 + 1.0e-3, "y out of cascade {}: {:?}", i, ndc);
                assert!(ndc.z.abs() <= 1.0 + 1.0e-3, "z out of cascade {}: {:?}", i, ndc);
            }
            last_split = splits[i];
        }
    }

    #[test]
    fn frustum_planes_keep_interior_points_positive() {
        let proj = perspective(Deg(90.0), 1.0, 0.1, 100.0);
        let view = Matrix4::look_at(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, -1.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let planes = frustum_planes(&(proj * view));

        // a point well inside the frustum is on the positive side of
        // every plane
        let p = Vector4::new(0.0, 0.0, -10.0, 1.0);
        for plane in planes.iter() {
            assert!(plane.dot(p) > 0.0, "interior point behind plane {:?}", plane);
        }
    }
}
