use glam::{Mat4, Vec3};
use serde::Serialize;

use crate::bounds::{CullingParams, InstanceTransformUpdater};
use crate::config::PipelineConfig;
use crate::device::{CommandStream, CullDevice, FrameUpload, InstanceShading, PointLight, PublishedFrame};
use crate::error::CullError;
use crate::frustum::{FrustumExtractor, FrustumPlanes};
use crate::indirect::IndirectArgsStage;
use crate::telemetry::TelemetryRing;

/// What the caller hands over each frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInputs<'a> {
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec3,
    /// Keep culling against the last computed frustum.
    pub freeze_frustum: bool,
    /// World transform of each instance; the slice length is the instance count.
    pub transforms: &'a [Mat4],
    /// Per-instance shading; missing entries use [`InstanceShading::default`].
    pub shading: &'a [InstanceShading],
    pub lights: &'a [PointLight],
}

/// Summary of one submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub query_slot: usize,
    pub workgroups: u32,
    pub instances_submitted: u32,
    pub frustum_frozen: bool,
}

/// Per-frame orchestrator: frustum → bounds → cull → publish → draw → query.
///
/// Owns the device and every host-side stage. All device buffers are sized
/// once from the config; nothing is reallocated per frame.
pub struct CullingPipeline<D: CullDevice> {
    config: PipelineConfig,
    device: D,
    frustum: FrustumExtractor,
    params: CullingParams,
    updater: InstanceTransformUpdater,
    stage: IndirectArgsStage,
    telemetry: TelemetryRing,
}

impl<D: CullDevice> CullingPipeline<D> {
    pub fn new(config: PipelineConfig, device: D) -> Result<Self, CullError> {
        config.validate()?;
        if device.query_slots() != config.query_ring_capacity {
            return Err(CullError::InvalidConfig(format!(
                "query ring capacity {} does not match the device's {} slots",
                config.query_ring_capacity,
                device.query_slots()
            )));
        }
        if device.instance_capacity() < config.instance_capacity {
            return Err(CullError::InvalidConfig(format!(
                "instance capacity {} exceeds the device's {}",
                config.instance_capacity,
                device.instance_capacity()
            )));
        }
        let telemetry =
            TelemetryRing::new(config.query_ring_capacity, config.primitives_per_instance)?;
        tracing::info!(
            capacity = config.instance_capacity,
            ring = config.query_ring_capacity,
            max_view_distance = config.max_view_distance,
            "culling pipeline ready"
        );
        Ok(Self {
            frustum: FrustumExtractor::new(config.max_view_distance),
            params: CullingParams::with_capacity(config.instance_capacity),
            updater: InstanceTransformUpdater::new(config.bounds_template),
            stage: IndirectArgsStage::new(config.index_count_per_instance),
            telemetry,
            config,
            device,
        })
    }

    /// Cull and draw one frame.
    ///
    /// On error nothing is submitted and the frame counters are unchanged;
    /// the next call starts a fresh frame.
    pub fn render_frame(&mut self, inputs: &FrameInputs<'_>) -> Result<FrameReport, CullError> {
        let frame = self.telemetry.cur_frame();
        let _span = tracing::info_span!("render_frame", frame).entered();

        if inputs.transforms.len() > self.config.instance_capacity as usize {
            return Err(CullError::CapacityExceeded {
                requested: inputs.transforms.len(),
                capacity: self.config.instance_capacity,
            });
        }

        let frozen = inputs.freeze_frustum && self.frustum.planes().is_some();
        let planes = self
            .frustum
            .update(inputs.view, inputs.projection, inputs.freeze_frustum);
        self.updater.update(&mut self.params, inputs.transforms)?;

        let upload = FrameUpload {
            planes: &planes,
            params: &self.params,
            view_projection: inputs.projection * inputs.view,
            camera_position: inputs.camera_position,
            transforms: inputs.transforms,
            shading: inputs.shading,
            lights: inputs.lights,
        };
        if let Err(err) = self.device.upload(&upload) {
            if err.is_transient() {
                tracing::warn!(%err, "frame skipped");
            }
            return Err(err);
        }

        let instances = self.params.instance_count();
        let mut stream = CommandStream::new(frame);
        let workgroups = self.stage.encode(&mut stream, instances);
        let query_slot = self.telemetry.encode_draw(&mut stream);
        self.device.submit(stream)?;
        self.telemetry.frame_submitted();

        tracing::debug!(instances, workgroups, query_slot, frozen, "frame submitted");
        Ok(FrameReport {
            frame,
            query_slot,
            workgroups,
            instances_submitted: instances,
            frustum_frozen: frozen,
        })
    }

    /// Read whatever telemetry is ready without waiting.
    pub fn poll_telemetry(&mut self) -> Result<Option<u32>, CullError> {
        self.telemetry.poll(&mut self.device)
    }

    /// Wait for the device to go idle, then poll. Not for per-frame use.
    pub fn drain_telemetry(&mut self) -> Result<Option<u32>, CullError> {
        self.device.wait_idle()?;
        self.telemetry.poll(&mut self.device)
    }

    /// Latest approximate count of instances the device rendered.
    pub fn rendered_instances(&self) -> Option<u32> {
        self.telemetry.rendered_instances()
    }

    /// Blocking readback of the publish buffers, for debugging.
    pub fn read_published(&mut self) -> Result<PublishedFrame, CullError> {
        self.device.read_published()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryRing {
        &self.telemetry
    }

    pub fn frustum(&self) -> Option<&FrustumPlanes> {
        self.frustum.planes()
    }

    pub fn params(&self) -> &CullingParams {
        &self.params
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}
