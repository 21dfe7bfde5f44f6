//! GPU-driven frustum culling: plane extraction, per-instance bounds, the
//! culling kernel, staged indirect-draw arguments and a non-blocking
//! telemetry query ring.
//!
//! # Invariants
//! - The host never reads culling results back on the frame path.
//! - Each frame's draw consumes only the publish buffers written by that
//!   frame's copies, after that frame's dispatch.
//! - Telemetry polling never blocks; results lag the draw that produced them.

pub mod bounds;
pub mod config;
pub mod device;
pub mod error;
pub mod frustum;
pub mod indirect;
pub mod kernel;
pub mod pipeline;
pub mod software;
pub mod telemetry;

pub use bounds::{Aabb, CullingParams, InstanceBounds, InstanceTransformUpdater};
pub use config::{ConfigError, PipelineConfig};
pub use device::{
    CommandStream, CullDevice, DeviceCommand, FrameUpload, InstanceShading, MAX_LIGHTS,
    PipelineStatistics, PointLight, PublishedFrame, QueryFetch, QuerySource,
};
pub use error::CullError;
pub use frustum::{FrustumExtractor, FrustumPlanes, Plane, PlaneSide};
pub use indirect::{IndirectArgsStage, IndirectDrawArgs};
pub use pipeline::{CullingPipeline, FrameInputs, FrameReport};
pub use software::SoftwareDevice;
pub use telemetry::TelemetryRing;
