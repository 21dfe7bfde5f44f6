//! The seam between the host-side pipeline and an execution device.
//!
//! The pipeline records one [`CommandStream`] per frame; a [`CullDevice`]
//! executes it asynchronously. Nothing on this interface blocks except
//! [`CullDevice::wait_idle`] and the debug readback.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::bounds::CullingParams;
use crate::error::CullError;
use crate::frustum::FrustumPlanes;
use crate::indirect::IndirectDrawArgs;

/// One step of a frame's device work, executed in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Overwrite the scratch args buffer (instance count back to zero).
    ResetDrawArgs(IndirectDrawArgs),
    DispatchCull { workgroups: u32 },
    /// Copy scratch args into the indirect-argument buffer.
    PublishDrawArgs,
    /// Copy the scratch visibility list into the read-only shading buffer.
    PublishVisibility,
    BeginQuery { slot: usize },
    DrawIndexedIndirect,
    EndQuery { slot: usize },
}

/// Ordered device work for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStream {
    frame: u64,
    commands: Vec<DeviceCommand>,
}

impl CommandStream {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            commands: Vec::with_capacity(8),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn push(&mut self, command: DeviceCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    /// Check the reset → dispatch → publish → draw ordering and query
    /// bracketing. Devices call this before executing anything.
    pub fn validate(&self) -> Result<(), CullError> {
        let fail = |reason| {
            Err(CullError::CommandOrder {
                frame: self.frame,
                reason,
            })
        };

        let mut reset = false;
        let mut dispatched = false;
        let mut args_published = false;
        let mut visibility_published = false;
        let mut open_query: Option<usize> = None;

        for command in &self.commands {
            match *command {
                DeviceCommand::ResetDrawArgs(_) => {
                    reset = true;
                    dispatched = false;
                    args_published = false;
                    visibility_published = false;
                }
                DeviceCommand::DispatchCull { .. } => {
                    if !reset {
                        return fail("dispatch before the scratch args were reset");
                    }
                    dispatched = true;
                    args_published = false;
                    visibility_published = false;
                }
                DeviceCommand::PublishDrawArgs => {
                    if !dispatched {
                        return fail("args published before any dispatch");
                    }
                    args_published = true;
                }
                DeviceCommand::PublishVisibility => {
                    if !dispatched {
                        return fail("visibility published before any dispatch");
                    }
                    visibility_published = true;
                }
                DeviceCommand::BeginQuery { slot } => {
                    if open_query.is_some() {
                        return fail("query begun while another is open");
                    }
                    open_query = Some(slot);
                }
                DeviceCommand::DrawIndexedIndirect => {
                    if !(args_published && visibility_published) {
                        return fail("draw issued before this frame's publish copies");
                    }
                }
                DeviceCommand::EndQuery { slot } => {
                    if open_query != Some(slot) {
                        return fail("query ended without a matching begin");
                    }
                    open_query = None;
                }
            }
        }

        if open_query.is_some() {
            return fail("query left open at end of stream");
        }
        Ok(())
    }
}

/// Hardware counters collected between a query's begin and end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    /// Primitives that entered the clipping stage.
    pub primitives: u64,
}

/// Outcome of a non-blocking query read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFetch {
    Ready(PipelineStatistics),
    /// The device has not finished the bracketed work yet.
    NotReady,
    /// The result can never be read (readback failed or was discarded).
    Lost,
}

/// Something that can be asked, without waiting, for a query slot's result.
pub trait QuerySource {
    fn try_fetch_query(&mut self, slot: usize) -> Result<QueryFetch, CullError>;
}

/// Per-instance shading inputs. Opaque to culling.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceShading {
    pub base_color: [f32; 4],
    /// x = shininess; the rest is free for the shader.
    pub params: [f32; 4],
}

impl Default for InstanceShading {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8, 1.0],
            params: [32.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Lights beyond this many are ignored by shading.
pub const MAX_LIGHTS: usize = 4;

/// A point light, consumed by shading only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
}

/// Everything a device needs uploaded before a frame's stream runs.
#[derive(Debug, Clone, Copy)]
pub struct FrameUpload<'a> {
    pub planes: &'a FrustumPlanes,
    pub params: &'a CullingParams,
    pub view_projection: Mat4,
    pub camera_position: Vec3,
    pub transforms: &'a [Mat4],
    pub shading: &'a [InstanceShading],
    pub lights: &'a [PointLight],
}

/// Debug snapshot of the publish buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFrame {
    pub args: IndirectDrawArgs,
    /// First `args.instance_count` entries of the visibility list, in
    /// whatever order the kernel appended them.
    pub visible: Vec<u32>,
}

/// An execution device for the culling pipeline.
pub trait CullDevice: QuerySource {
    /// Instances the device buffers were sized for.
    fn instance_capacity(&self) -> u32;

    /// Number of query slots the device owns.
    fn query_slots(&self) -> usize;

    /// Write this frame's culling and shading inputs.
    ///
    /// A [`CullError::TransientMap`] here means the frame must be skipped.
    fn upload(&mut self, frame: &FrameUpload<'_>) -> Result<(), CullError>;

    /// Queue a frame's commands. Returns once queued, not once executed.
    fn submit(&mut self, stream: CommandStream) -> Result<(), CullError>;

    /// Block until every submitted stream has finished.
    ///
    /// Forces a full host/device sync; for shutdown and tests only.
    fn wait_idle(&mut self) -> Result<(), CullError>;

    /// Read back the publish buffers. Blocking, debug only.
    fn read_published(&mut self) -> Result<PublishedFrame, CullError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame() -> CommandStream {
        let mut s = CommandStream::new(3);
        s.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)));
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        s.push(DeviceCommand::PublishDrawArgs);
        s.push(DeviceCommand::PublishVisibility);
        s.push(DeviceCommand::BeginQuery { slot: 3 });
        s.push(DeviceCommand::DrawIndexedIndirect);
        s.push(DeviceCommand::EndQuery { slot: 3 });
        s
    }

    #[test]
    fn well_ordered_stream_validates() {
        assert!(full_frame().validate().is_ok());
    }

    #[test]
    fn draw_without_publish_is_rejected() {
        let mut s = CommandStream::new(0);
        s.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)));
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        s.push(DeviceCommand::PublishDrawArgs);
        s.push(DeviceCommand::DrawIndexedIndirect);
        let err = s.validate().unwrap_err();
        assert!(matches!(err, CullError::CommandOrder { frame: 0, .. }));
    }

    #[test]
    fn publish_before_dispatch_is_stale() {
        let mut s = CommandStream::new(1);
        s.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)));
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        s.push(DeviceCommand::PublishDrawArgs);
        s.push(DeviceCommand::PublishVisibility);
        // A second dispatch invalidates the earlier copies.
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        s.push(DeviceCommand::DrawIndexedIndirect);
        assert!(s.validate().is_err());
    }

    #[test]
    fn reset_after_dispatch_invalidates_earlier_cull() {
        let mut s = CommandStream::new(2);
        s.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)));
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        s.push(DeviceCommand::PublishDrawArgs);
        s.push(DeviceCommand::PublishVisibility);
        s.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)));
        s.push(DeviceCommand::PublishDrawArgs);
        s.push(DeviceCommand::DrawIndexedIndirect);
        let err = s.validate().unwrap_err();
        assert!(matches!(err, CullError::CommandOrder { frame: 2, .. }));
    }

    #[test]
    fn dispatch_requires_reset() {
        let mut s = CommandStream::new(0);
        s.push(DeviceCommand::DispatchCull { workgroups: 1 });
        assert!(s.validate().is_err());
    }

    #[test]
    fn mismatched_query_bracket_is_rejected() {
        let mut s = full_frame();
        s.push(DeviceCommand::BeginQuery { slot: 4 });
        assert!(s.validate().is_err());

        let mut s = CommandStream::new(0);
        s.push(DeviceCommand::EndQuery { slot: 0 });
        assert!(s.validate().is_err());
    }
}
