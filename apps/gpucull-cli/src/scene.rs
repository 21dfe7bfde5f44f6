//! Tiny demo scene: an orbiting camera over a grid of spinning cubes.

use glam::{Mat4, Quat, Vec3};
use gpucull_core::{InstanceShading, PointLight};

/// Camera circling the origin at a fixed height.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub radius: f32,
    pub height: f32,
    pub fov_y: f32,
    pub aspect: f32,
    /// Radians per frame.
    pub speed: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            radius: 30.0,
            height: 8.0,
            fov_y: 60f32.to_radians(),
            aspect: 16.0 / 9.0,
            speed: 0.02,
        }
    }
}

impl OrbitCamera {
    pub fn position(&self, frame: u64) -> Vec3 {
        let angle = frame as f32 * self.speed;
        Vec3::new(self.radius * angle.cos(), self.height, self.radius * angle.sin())
    }

    pub fn view(&self, frame: u64) -> Mat4 {
        Mat4::look_at_rh(self.position(frame), Vec3::ZERO, Vec3::Y)
    }

    /// Far plane well past the culling distance so reshaping matters.
    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, 0.1, 1000.0)
    }
}

/// Square grid of cubes on the XZ plane, each spinning about Y.
#[derive(Debug, Clone)]
pub struct InstanceGrid {
    count: usize,
    spacing: f32,
    shading: Vec<InstanceShading>,
    transforms: Vec<Mat4>,
}

impl InstanceGrid {
    pub fn new(count: usize, spacing: f32) -> Self {
        let shading = (0..count)
            .map(|i| {
                let t = i as f32 / count.max(1) as f32;
                InstanceShading {
                    base_color: [0.2 + 0.8 * t, 0.6, 1.0 - 0.8 * t, 1.0],
                    params: [8.0 + 56.0 * t, 0.0, 0.0, 0.0],
                }
            })
            .collect();
        Self {
            count,
            spacing,
            shading,
            transforms: vec![Mat4::IDENTITY; count],
        }
    }

    fn side(&self) -> usize {
        (self.count as f32).sqrt().ceil().max(1.0) as usize
    }

    fn base_position(&self, index: usize) -> Vec3 {
        let side = self.side();
        let half = (side as f32 - 1.0) * self.spacing * 0.5;
        Vec3::new(
            (index % side) as f32 * self.spacing - half,
            0.0,
            (index / side) as f32 * self.spacing - half,
        )
    }

    /// Recompute every transform for `frame`.
    pub fn animate(&mut self, frame: u64) -> &[Mat4] {
        for index in 0..self.count {
            let spin = Quat::from_rotation_y(frame as f32 * 0.03 + index as f32 * 0.1);
            let bob = Vec3::Y * ((frame as f32 * 0.05 + index as f32).sin() * 0.25);
            self.transforms[index] =
                Mat4::from_rotation_translation(spin, self.base_position(index) + bob);
        }
        &self.transforms
    }

    pub fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }

    pub fn shading(&self) -> &[InstanceShading] {
        &self.shading
    }
}

pub fn lights() -> Vec<PointLight> {
    vec![
        PointLight {
            position: Vec3::new(10.0, 12.0, 10.0),
            color: Vec3::new(1.0, 0.95, 0.9),
        },
        PointLight {
            position: Vec3::new(-15.0, 6.0, -5.0),
            color: Vec3::new(0.3, 0.4, 0.9),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_centred() {
        let grid = InstanceGrid::new(9, 2.0);
        assert_eq!(grid.base_position(0), Vec3::new(-2.0, 0.0, -2.0));
        assert_eq!(grid.base_position(4), Vec3::ZERO);
        assert_eq!(grid.base_position(8), Vec3::new(2.0, 0.0, 2.0));
    }

    #[test]
    fn animate_fills_every_transform() {
        let mut grid = InstanceGrid::new(10, 3.0);
        let transforms = grid.animate(5).to_vec();
        assert_eq!(transforms.len(), 10);
        assert_eq!(grid.shading().len(), 10);
        assert!(transforms.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn orbit_keeps_radius() {
        let camera = OrbitCamera::default();
        for frame in [0, 17, 300] {
            let p = camera.position(frame);
            assert!((Vec3::new(p.x, 0.0, p.z).length() - camera.radius).abs() < 1e-3);
        }
    }
}
