//! CPU reference of the culling compute kernel.
//!
//! Mirrors `cs_cull` in the wgpu backend lane for lane: same workgroup size,
//! same positive-vertex test, same atomic append. The software device runs
//! it; tests use it to pin down kernel semantics without a GPU.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;

use crate::bounds::InstanceBounds;

/// Lanes per workgroup.
pub const WORKGROUP_SIZE: u32 = 64;

/// Workgroups needed to give every instance a lane.
pub fn workgroup_count(instances: u32) -> u32 {
    instances.div_ceil(WORKGROUP_SIZE)
}

/// The AABB corner furthest along `normal`.
#[inline]
pub fn positive_vertex(normal: Vec3, min: Vec3, max: Vec3) -> Vec3 {
    Vec3::select(normal.cmpge(Vec3::ZERO), max, min)
}

/// Positive-vertex test against all six planes.
///
/// Visible only if the positive vertex is on the inside of every plane; one
/// failing plane is enough to cull.
pub fn aabb_visible(planes: &[[f32; 4]; 6], bounds: &InstanceBounds) -> bool {
    let (min, max) = (bounds.min(), bounds.max());
    planes.iter().all(|p| {
        let normal = Vec3::new(p[0], p[1], p[2]);
        normal.dot(positive_vertex(normal, min, max)) + p[3] >= 0.0
    })
}

/// Device-side buffers one dispatch reads and writes.
pub struct KernelBindings<'a> {
    pub planes: &'a [[f32; 4]; 6],
    pub bounds: &'a [InstanceBounds],
    pub instance_count: u32,
    /// `IndirectDrawArgs::instance_count` of the scratch args buffer.
    pub visible_count: &'a AtomicU32,
    pub visible: &'a [AtomicU32],
}

impl KernelBindings<'_> {
    fn run_lane(&self, lane: u32) {
        if lane >= self.instance_count {
            return;
        }
        if !aabb_visible(self.planes, &self.bounds[lane as usize]) {
            return;
        }
        let slot = self.visible_count.fetch_add(1, Ordering::Relaxed);
        self.visible[slot as usize].store(lane, Ordering::Relaxed);
    }

    fn run_group(&self, group: u32) {
        let first = group * WORKGROUP_SIZE;
        for lane in first..first + WORKGROUP_SIZE {
            self.run_lane(lane);
        }
    }
}

/// Run `workgroups` groups of the kernel, spread over the available cores.
///
/// Groups race on the shared counter exactly as on a GPU, so the order of
/// the visible list differs between runs.
pub fn dispatch(workgroups: u32, bindings: &KernelBindings<'_>) {
    if workgroups == 0 {
        return;
    }
    debug_assert!(bindings.instance_count as usize <= bindings.bounds.len());
    debug_assert!(bindings.instance_count as usize <= bindings.visible.len());

    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
        .min(workgroups);

    if threads <= 1 {
        for group in 0..workgroups {
            bindings.run_group(group);
        }
        return;
    }

    std::thread::scope(|scope| {
        for worker in 0..threads {
            scope.spawn(move || {
                let mut group = worker;
                while group < workgroups {
                    bindings.run_group(group);
                    group += threads;
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Aabb, CullingParams, InstanceTransformUpdater};
    use crate::frustum::{FrustumExtractor, PlaneSide};
    use glam::Mat4;
    use std::collections::HashSet;

    /// Axis-aligned box frustum: |x|, |y|, |z| <= 10.
    fn box_planes() -> [[f32; 4]; 6] {
        [
            [0.0, 0.0, 1.0, 10.0],
            [0.0, 0.0, -1.0, 10.0],
            [1.0, 0.0, 0.0, 10.0],
            [-1.0, 0.0, 0.0, 10.0],
            [0.0, -1.0, 0.0, 10.0],
            [0.0, 1.0, 0.0, 10.0],
        ]
    }

    fn run(planes: &[[f32; 4]; 6], bounds: &[InstanceBounds]) -> (u32, Vec<u32>) {
        let count = AtomicU32::new(0);
        let visible: Vec<AtomicU32> = (0..bounds.len()).map(|_| AtomicU32::new(u32::MAX)).collect();
        let bindings = KernelBindings {
            planes,
            bounds,
            instance_count: bounds.len() as u32,
            visible_count: &count,
            visible: &visible,
        };
        dispatch(workgroup_count(bounds.len() as u32), &bindings);
        let n = count.load(Ordering::Relaxed);
        let list = visible[..n as usize]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();
        (n, list)
    }

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroup_count(0), 0);
        assert_eq!(workgroup_count(1), 1);
        assert_eq!(workgroup_count(64), 1);
        assert_eq!(workgroup_count(65), 2);
        assert_eq!(workgroup_count(1000), 16);
    }

    #[test]
    fn positive_vertex_follows_normal_sign() {
        let p = positive_vertex(Vec3::new(1.0, -1.0, 0.0), Vec3::splat(-1.0), Vec3::splat(2.0));
        assert_eq!(p, Vec3::new(2.0, -1.0, 2.0));
    }

    #[test]
    fn failing_any_single_plane_culls() {
        let planes = box_planes();
        let inside = InstanceBounds::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert!(aabb_visible(&planes, &inside));

        for i in 0..6 {
            let mut flipped = planes;
            // Push plane i so the box lies entirely outside it.
            flipped[i][3] = -100.0;
            assert!(!aabb_visible(&flipped, &inside), "plane {i} should cull");
        }
    }

    #[test]
    fn straddling_box_stays_visible() {
        let b = InstanceBounds::new(Vec3::new(9.0, 0.0, 0.0), Vec3::new(11.0, 1.0, 1.0));
        assert!(aabb_visible(&box_planes(), &b));
    }

    #[test]
    fn two_of_three_visible() {
        let bounds = [
            InstanceBounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
            InstanceBounds::new(Vec3::new(20.0, 0.0, 0.0), Vec3::new(22.0, 1.0, 1.0)),
            InstanceBounds::new(Vec3::splat(3.0), Vec3::splat(4.0)),
        ];
        let (count, list) = run(&box_planes(), &bounds);
        assert_eq!(count, 2);
        let set: HashSet<u32> = list.into_iter().collect();
        assert_eq!(set, HashSet::from([0, 2]));
    }

    #[test]
    fn lanes_past_instance_count_do_nothing() {
        let bounds = vec![InstanceBounds::new(Vec3::ZERO, Vec3::ONE); 70];
        let count = AtomicU32::new(0);
        let visible: Vec<AtomicU32> = (0..70).map(|_| AtomicU32::new(0)).collect();
        let bindings = KernelBindings {
            planes: &box_planes(),
            bounds: &bounds,
            instance_count: 5,
            visible_count: &count,
            visible: &visible,
        };
        dispatch(2, &bindings);
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn large_dispatch_produces_each_index_once() {
        let updater = InstanceTransformUpdater::new(Aabb::UNIT_CUBE);
        let mut params = CullingParams::with_capacity(1000);
        let transforms: Vec<Mat4> = (0..1000)
            .map(|i| Mat4::from_translation(Vec3::new((i % 40) as f32 - 20.0, 0.0, 0.0)))
            .collect();
        updater.update(&mut params, &transforms).unwrap();

        let (count, list) = run(&box_planes(), params.bounds());
        let set: HashSet<u32> = list.iter().copied().collect();
        assert_eq!(set.len(), list.len());
        // x in [-10.5, 10.5] touches the box: offsets -10..=10 of every 40.
        assert_eq!(count, 25 * 21);
    }

    #[test]
    fn camera_frustum_agrees_with_kernel() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
        let planes = FrustumExtractor::new(100.0).update(view, proj, false);
        let gpu = planes.to_gpu();

        let origin = InstanceBounds::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let behind = InstanceBounds::new(Vec3::new(0.0, 0.0, 20.0), Vec3::new(1.0, 1.0, 21.0));
        assert!(aabb_visible(&gpu, &origin));
        assert!(!aabb_visible(&gpu, &behind));
        assert!(planes.plane(PlaneSide::Near).signed_distance(Vec3::new(0.5, 0.5, 20.5)) < 0.0);
    }
}
