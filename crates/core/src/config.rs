use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::error::CullError;

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] CullError),
}

/// Construction-time settings for a culling pipeline.
///
/// Every device buffer is sized once from these values; nothing grows later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of instances a frame may submit.
    pub instance_capacity: u32,
    /// Number of overlapped statistics queries (N).
    pub query_ring_capacity: usize,
    /// Far distance the culling frustum is reshaped to.
    pub max_view_distance: f32,
    pub index_count_per_instance: u32,
    /// Hardware primitives one instance of the mesh produces.
    pub primitives_per_instance: u32,
    /// Object-space bounds shared by every instance.
    pub bounds_template: Aabb,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instance_capacity: 4096,
            query_ring_capacity: 8,
            max_view_distance: 200.0,
            index_count_per_instance: 36,
            primitives_per_instance: 12,
            bounds_template: Aabb::UNIT_CUBE,
        }
    }
}

impl PipelineConfig {
    pub fn with_capacity(instance_capacity: u32) -> Self {
        Self {
            instance_capacity,
            ..Self::default()
        }
    }

    /// Load a config from a YAML file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml(&text)?;
        tracing::debug!(path = %path.as_ref().display(), ?config, "loaded pipeline config");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CullError> {
        if self.instance_capacity == 0 {
            return Err(CullError::InvalidConfig("instance_capacity must be > 0".into()));
        }
        if self.query_ring_capacity == 0 {
            return Err(CullError::InvalidConfig(
                "query_ring_capacity must be > 0".into(),
            ));
        }
        if !(self.max_view_distance.is_finite() && self.max_view_distance > 0.0) {
            return Err(CullError::InvalidConfig(format!(
                "max_view_distance must be finite and > 0, got {}",
                self.max_view_distance
            )));
        }
        if self.index_count_per_instance == 0 || self.primitives_per_instance == 0 {
            return Err(CullError::InvalidConfig(
                "index_count_per_instance and primitives_per_instance must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.primitives_per_instance, 12);
        assert_eq!(config.bounds_template.min, Vec3::splat(-0.5));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml("instance_capacity: 64\nquery_ring_capacity: 3\n")
            .unwrap();
        assert_eq!(config.instance_capacity, 64);
        assert_eq!(config.query_ring_capacity, 3);
        assert_eq!(config.max_view_distance, 200.0);
    }

    #[test]
    fn yaml_bounds_template() {
        let config = PipelineConfig::from_yaml(
            "bounds_template:\n  min: [-1.0, 0.0, -1.0]\n  max: [1.0, 2.0, 1.0]\n",
        )
        .unwrap();
        assert_eq!(config.bounds_template.max, Vec3::new(1.0, 2.0, 1.0));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = PipelineConfig::from_yaml("instance_capacity: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(CullError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_view_distance() {
        let mut config = PipelineConfig::default();
        config.max_view_distance = -1.0;
        assert!(config.validate().is_err());
        config.max_view_distance = f32::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_yaml_is_a_yaml_error() {
        let err = PipelineConfig::from_yaml("instance_capacity: [").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
