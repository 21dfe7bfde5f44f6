//! Frustum plane extraction from view and projection matrices.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Smallest plane-normal length used as a divisor during normalization.
pub const PLANE_EPSILON: f32 = 1e-6;

/// A plane `dot(normal, p) + distance = 0`; the inside half-space is `>= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    /// Build a unit plane from raw `(a, b, c, d)` coefficients.
    ///
    /// A degenerate projection can yield a near-zero normal; the divisor is
    /// clamped to [`PLANE_EPSILON`] so the result stays finite.
    pub fn from_coefficients(coefficients: Vec4) -> Self {
        let length = coefficients.xyz().length().max(PLANE_EPSILON);
        Self {
            normal: coefficients.xyz() / length,
            distance: coefficients.w / length,
        }
    }

    #[inline]
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.distance]
    }
}

/// Which boundary of the view volume a plane is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneSide {
    Near,
    Far,
    Left,
    Right,
    Top,
    Bottom,
}

impl PlaneSide {
    pub const ALL: [PlaneSide; 6] = [
        PlaneSide::Near,
        PlaneSide::Far,
        PlaneSide::Left,
        PlaneSide::Right,
        PlaneSide::Top,
        PlaneSide::Bottom,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Six unit-normalized world-space planes, ordered as [`PlaneSide::ALL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumPlanes {
    planes: [Plane; 6],
}

impl FrustumPlanes {
    /// Extract planes from a combined `projection * view` matrix.
    ///
    /// Uses the row-combination method for a 0..1 clip depth range
    /// (wgpu/D3D): near is row 2 alone, far is row 3 minus row 2.
    pub fn from_view_projection(m: Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [
            Plane::from_coefficients(r2),
            Plane::from_coefficients(r3 - r2),
            Plane::from_coefficients(r3 + r0),
            Plane::from_coefficients(r3 - r0),
            Plane::from_coefficients(r3 - r1),
            Plane::from_coefficients(r3 + r1),
        ];
        Self { planes }
    }

    pub fn from_planes(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    pub fn plane(&self, side: PlaneSide) -> Plane {
        self.planes[side.index()]
    }

    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.signed_distance(point) >= 0.0)
    }

    /// `vec4(normal, distance)` per plane, for upload.
    pub fn to_gpu(&self) -> [[f32; 4]; 6] {
        self.planes.map(|p| p.to_array())
    }
}

/// Reshape a perspective projection so its far plane sits at `max_distance`.
///
/// The near distance is recovered from the two depth coefficients, then both
/// are patched for the new far distance. Works for left- and right-handed
/// 0..1 depth perspectives, including infinite-far ones. Anything else
/// (orthographic, reversed infinite, `max_distance <= near`) is returned
/// unchanged.
pub fn reshape_depth(projection: Mat4, max_distance: f32) -> Mat4 {
    // -1 for right-handed, +1 for left-handed, 0 when there is no perspective divide.
    let w = projection.z_axis.w;
    let zz = projection.z_axis.z;
    if w.abs() < PLANE_EPSILON || zz.abs() < PLANE_EPSILON {
        tracing::debug!("projection is not a reshapeable perspective; using it as given");
        return projection;
    }

    let near = -w * projection.w_axis.z / zz;
    if !(near > 0.0 && max_distance > near) {
        tracing::debug!(near, max_distance, "max view distance not beyond near plane");
        return projection;
    }

    let r = max_distance / (w * (max_distance - near));
    let mut reshaped = projection;
    reshaped.z_axis.z = r;
    reshaped.w_axis.z = -w * r * near;
    reshaped
}

/// Produces the culling frustum each frame, or holds it while frozen.
#[derive(Debug, Clone)]
pub struct FrustumExtractor {
    max_view_distance: f32,
    planes: Option<FrustumPlanes>,
}

impl FrustumExtractor {
    pub fn new(max_view_distance: f32) -> Self {
        Self {
            max_view_distance,
            planes: None,
        }
    }

    pub fn max_view_distance(&self) -> f32 {
        self.max_view_distance
    }

    /// Planes from the most recent update, if any.
    pub fn planes(&self) -> Option<&FrustumPlanes> {
        self.planes.as_ref()
    }

    /// Compute this frame's planes.
    ///
    /// With `freeze` set the previous planes are returned untouched so the
    /// culling result can be inspected while the camera moves away. Freezing
    /// before any planes exist computes them once.
    pub fn update(&mut self, view: Mat4, projection: Mat4, freeze: bool) -> FrustumPlanes {
        if freeze {
            if let Some(planes) = self.planes {
                tracing::trace!("frustum frozen; reusing previous planes");
                return planes;
            }
        }

        let adjusted = reshape_depth(projection, self.max_view_distance);
        let planes = FrustumPlanes::from_view_projection(adjusted * view);
        self.planes = Some(planes);
        planes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    fn camera() -> (Mat4, Mat4) {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        (view, proj)
    }

    #[test]
    fn planes_have_unit_normals() {
        let (view, proj) = camera();
        let planes = FrustumExtractor::new(100.0).update(view, proj, false);
        for plane in planes.planes() {
            assert!((plane.normal.length() - 1.0).abs() < EPS);
        }
    }

    #[test]
    fn point_in_front_is_inside_near_plane() {
        let (view, proj) = camera();
        let planes = FrustumExtractor::new(100.0).update(view, proj, false);
        let near = planes.plane(PlaneSide::Near);
        assert!(near.signed_distance(Vec3::ZERO) >= 0.0);
        // Behind the camera.
        assert!(near.signed_distance(Vec3::new(0.0, 2.0, 20.0)) < 0.0);
        assert!(planes.contains_point(Vec3::ZERO));
    }

    #[test]
    fn far_plane_follows_max_view_distance() {
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
        let planes = FrustumExtractor::new(50.0).update(view, proj, false);
        let far = planes.plane(PlaneSide::Far);
        assert!(far.signed_distance(Vec3::new(0.0, 0.0, -49.0)) > 0.0);
        assert!(far.signed_distance(Vec3::new(0.0, 0.0, -51.0)) < 0.0);
        assert!(far.signed_distance(Vec3::new(0.0, 0.0, -50.0)).abs() < 0.05);
    }

    #[test]
    fn reshape_matches_direct_projection() {
        let fov = 45f32.to_radians();
        let long = Mat4::perspective_rh(fov, 1.5, 0.5, 1000.0);
        let short = Mat4::perspective_rh(fov, 1.5, 0.5, 40.0);
        let reshaped = reshape_depth(long, 40.0);
        assert!(reshaped.abs_diff_eq(short, 1e-4));

        let long_lh = Mat4::perspective_lh(fov, 1.5, 0.5, 1000.0);
        let short_lh = Mat4::perspective_lh(fov, 1.5, 0.5, 40.0);
        assert!(reshape_depth(long_lh, 40.0).abs_diff_eq(short_lh, 1e-4));
    }

    #[test]
    fn reshape_gives_infinite_projection_a_far_plane() {
        let fov = 45f32.to_radians();
        let infinite = Mat4::perspective_infinite_rh(fov, 1.0, 0.1);
        let finite = Mat4::perspective_rh(fov, 1.0, 0.1, 25.0);
        assert!(reshape_depth(infinite, 25.0).abs_diff_eq(finite, 1e-4));
    }

    #[test]
    fn orthographic_is_left_alone() {
        let ortho = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        assert_eq!(reshape_depth(ortho, 5.0), ortho);
    }

    #[test]
    fn freeze_reuses_previous_planes() {
        let (view, proj) = camera();
        let mut extractor = FrustumExtractor::new(100.0);
        let first = extractor.update(view, proj, false);

        let moved = Mat4::look_at_rh(Vec3::new(50.0, 0.0, 0.0), Vec3::X * 100.0, Vec3::Y);
        let frozen = extractor.update(moved, proj, true);
        assert_eq!(first, frozen);

        let thawed = extractor.update(moved, proj, false);
        assert_ne!(first, thawed);
    }

    #[test]
    fn freeze_without_history_computes_once() {
        let (view, proj) = camera();
        let mut extractor = FrustumExtractor::new(100.0);
        assert!(extractor.planes().is_none());
        let planes = extractor.update(view, proj, true);
        assert_eq!(extractor.planes(), Some(&planes));
    }

    #[test]
    fn degenerate_matrix_stays_finite() {
        let planes = FrustumExtractor::new(100.0).update(Mat4::ZERO, Mat4::ZERO, false);
        for plane in planes.planes() {
            assert!(plane.normal.is_finite());
            assert!(plane.distance.is_finite());
        }
    }

    #[test]
    fn gpu_layout_is_normal_then_distance() {
        let plane = Plane::from_coefficients(Vec4::new(0.0, 3.0, 4.0, 10.0));
        assert_eq!(plane.to_array(), [0.0, 0.6, 0.8, 2.0]);
    }
}
