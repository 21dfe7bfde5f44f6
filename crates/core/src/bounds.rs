use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::CullError;

/// Axis-aligned bounding box as a min and max corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// The unit cube centred on the origin.
    pub const UNIT_CUBE: Self = Self {
        min: Vec3::splat(-0.5),
        max: Vec3::splat(0.5),
    };

    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Tight bound of all eight corners moved through `transform`.
    ///
    /// Not used for culling; it exists to measure how far the two-corner
    /// bound used by [`InstanceTransformUpdater`] is from the real extent.
    pub fn transformed_tight(&self, transform: &Mat4) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for corner in self.corners() {
            let p = transform.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }
}

/// Per-instance world-space bounds as laid out on the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceBounds {
    pub min: [f32; 4],
    pub max: [f32; 4],
}

impl InstanceBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.extend(1.0).to_array(),
            max: max.extend(1.0).to_array(),
        }
    }

    pub fn min(&self) -> Vec3 {
        Vec3::new(self.min[0], self.min[1], self.min[2])
    }

    pub fn max(&self) -> Vec3 {
        Vec3::new(self.max[0], self.max[1], self.max[2])
    }
}

/// Host mirror of the device culling-parameter buffer.
///
/// Sized once at construction; every frame overwrites the first
/// `instance_count` entries and the count itself.
#[derive(Debug, Clone)]
pub struct CullingParams {
    bounds: Vec<InstanceBounds>,
    instance_count: u32,
}

impl CullingParams {
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            bounds: vec![InstanceBounds::default(); capacity as usize],
            instance_count: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.bounds.len() as u32
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Bounds of the live instances only.
    pub fn bounds(&self) -> &[InstanceBounds] {
        &self.bounds[..self.instance_count as usize]
    }
}

/// Turns animated world transforms into per-instance world-space bounds.
#[derive(Debug, Clone)]
pub struct InstanceTransformUpdater {
    template: Aabb,
}

impl InstanceTransformUpdater {
    pub fn new(template: Aabb) -> Self {
        Self { template }
    }

    pub fn template(&self) -> Aabb {
        self.template
    }

    /// Bounds for one instance: the template's min and max corners moved
    /// through `world`.
    ///
    /// Only the two diagonal corners are transformed. Under rotation the
    /// pair is not an axis-aligned bound of the rotated object and can be
    /// tighter than its real extent, or even have `min > max` on an axis.
    pub fn instance_bounds(&self, world: &Mat4) -> InstanceBounds {
        InstanceBounds::new(
            world.transform_point3(self.template.min),
            world.transform_point3(self.template.max),
        )
    }

    /// Overwrite `params` with bounds for every transform.
    ///
    /// Fails without touching `params` when there are more transforms than
    /// the buffer can hold.
    pub fn update(&self, params: &mut CullingParams, transforms: &[Mat4]) -> Result<(), CullError> {
        if transforms.len() > params.bounds.len() {
            return Err(CullError::CapacityExceeded {
                requested: transforms.len(),
                capacity: params.capacity(),
            });
        }

        for (slot, world) in params.bounds.iter_mut().zip(transforms) {
            *slot = self.instance_bounds(world);
        }
        params.instance_count = transforms.len() as u32;
        tracing::trace!(instances = params.instance_count, "culling params updated");
        Ok(())
    }
}
