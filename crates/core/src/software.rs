//! CPU device that executes command streams with the reference kernel.
//!
//! Buffers are plain host memory, the kernel runs on worker threads, and
//! query results only become readable a configurable number of submissions
//! after the frame that produced them.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::bounds::InstanceBounds;
use crate::config::PipelineConfig;
use crate::device::{
    CommandStream, CullDevice, DeviceCommand, FrameUpload, PipelineStatistics, PublishedFrame,
    QueryFetch, QuerySource,
};
use crate::error::CullError;
use crate::indirect::IndirectDrawArgs;
use crate::kernel::{self, KernelBindings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuerySlot {
    Empty,
    /// Written by submission number `issued_at` (1-based).
    Written {
        issued_at: u64,
        stats: PipelineStatistics,
    },
    Discarded,
}

#[derive(Debug)]
pub struct SoftwareDevice {
    capacity: u32,
    completion_latency: u64,
    planes: [[f32; 4]; 6],
    bounds: Vec<InstanceBounds>,
    instance_count: u32,
    scratch_args: IndirectDrawArgs,
    scratch_count: AtomicU32,
    scratch_visible: Vec<AtomicU32>,
    publish_args: IndirectDrawArgs,
    publish_visible: Vec<u32>,
    queries: Vec<QuerySlot>,
    submissions: u64,
    idle_through: u64,
    fail_next_upload: bool,
}

impl SoftwareDevice {
    /// A device sized for `config` whose query results become readable
    /// `completion_latency` submissions after the frame that wrote them.
    ///
    /// A latency of zero makes every result readable as soon as its frame
    /// has been submitted.
    pub fn new(config: &PipelineConfig, completion_latency: u32) -> Result<Self, CullError> {
        config.validate()?;
        let capacity = config.instance_capacity;
        tracing::debug!(
            capacity,
            ring = config.query_ring_capacity,
            completion_latency,
            "software device created"
        );
        Ok(Self {
            capacity,
            completion_latency: u64::from(completion_latency),
            planes: [[0.0; 4]; 6],
            bounds: vec![InstanceBounds::default(); capacity as usize],
            instance_count: 0,
            scratch_args: IndirectDrawArgs::default(),
            scratch_count: AtomicU32::new(0),
            scratch_visible: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            publish_args: IndirectDrawArgs::default(),
            publish_visible: vec![0; capacity as usize],
            queries: vec![QuerySlot::Empty; config.query_ring_capacity],
            submissions: 0,
            idle_through: 0,
            fail_next_upload: false,
        })
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Make the next [`upload`](CullDevice::upload) fail as if the staging
    /// buffer could not be mapped.
    pub fn fail_next_upload(&mut self) {
        self.fail_next_upload = true;
    }

    /// Throw away whatever result `slot` holds, so reading it reports
    /// [`QueryFetch::Lost`] until the slot is written again.
    pub fn discard_query(&mut self, slot: usize) {
        if let Some(q) = self.queries.get_mut(slot) {
            *q = QuerySlot::Discarded;
        }
    }

    fn check_slots(&self, stream: &CommandStream) -> Result<(), CullError> {
        for command in stream.commands() {
            if let DeviceCommand::BeginQuery { slot } | DeviceCommand::EndQuery { slot } = *command
            {
                if slot >= self.queries.len() {
                    return Err(CullError::Device(format!(
                        "query slot {slot} out of range ({} slots)",
                        self.queries.len()
                    )));
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, workgroups: u32) {
        let bindings = KernelBindings {
            planes: &self.planes,
            bounds: &self.bounds,
            instance_count: self.instance_count,
            visible_count: &self.scratch_count,
            visible: &self.scratch_visible,
        };
        kernel::dispatch(workgroups, &bindings);
    }

    fn draw_primitives(&self) -> u64 {
        let args = &self.publish_args;
        u64::from(args.instance_count) * u64::from(args.index_count_per_instance / 3)
    }
}

impl QuerySource for SoftwareDevice {
    fn try_fetch_query(&mut self, slot: usize) -> Result<QueryFetch, CullError> {
        let state = self.queries.get(slot).copied().ok_or_else(|| {
            CullError::Device(format!("query slot {slot} out of range"))
        })?;
        Ok(match state {
            QuerySlot::Empty => QueryFetch::NotReady,
            QuerySlot::Discarded => QueryFetch::Lost,
            QuerySlot::Written { issued_at, stats } => {
                let completed = self.submissions - issued_at >= self.completion_latency
                    || self.idle_through >= issued_at;
                if completed {
                    QueryFetch::Ready(stats)
                } else {
                    QueryFetch::NotReady
                }
            }
        })
    }
}

impl CullDevice for SoftwareDevice {
    fn instance_capacity(&self) -> u32 {
        self.capacity
    }

    fn query_slots(&self) -> usize {
        self.queries.len()
    }

    fn upload(&mut self, frame: &FrameUpload<'_>) -> Result<(), CullError> {
        if std::mem::take(&mut self.fail_next_upload) {
            return Err(CullError::TransientMap {
                buffer: "culling_params",
            });
        }
        let count = frame.params.instance_count();
        if count > self.capacity {
            return Err(CullError::CapacityExceeded {
                requested: count as usize,
                capacity: self.capacity,
            });
        }
        self.planes = frame.planes.to_gpu();
        self.bounds[..count as usize].copy_from_slice(frame.params.bounds());
        self.instance_count = count;
        Ok(())
    }

    fn submit(&mut self, stream: CommandStream) -> Result<(), CullError> {
        stream.validate()?;
        self.check_slots(&stream)?;
        self.submissions += 1;

        let mut open: Option<(usize, u64)> = None;
        for command in stream.commands() {
            match *command {
                DeviceCommand::ResetDrawArgs(args) => {
                    self.scratch_args = args;
                    self.scratch_count.store(args.instance_count, Ordering::Relaxed);
                }
                DeviceCommand::DispatchCull { workgroups } => self.dispatch(workgroups),
                DeviceCommand::PublishDrawArgs => {
                    self.publish_args = IndirectDrawArgs {
                        instance_count: self.scratch_count.load(Ordering::Relaxed),
                        ..self.scratch_args
                    };
                }
                DeviceCommand::PublishVisibility => {
                    for (dst, src) in self.publish_visible.iter_mut().zip(&self.scratch_visible) {
                        *dst = src.load(Ordering::Relaxed);
                    }
                }
                DeviceCommand::BeginQuery { slot } => open = Some((slot, 0)),
                DeviceCommand::DrawIndexedIndirect => {
                    let primitives = self.draw_primitives();
                    if let Some((_, total)) = open.as_mut() {
                        *total += primitives;
                    }
                }
                DeviceCommand::EndQuery { slot } => {
                    let primitives = open.take().map_or(0, |(_, total)| total);
                    self.queries[slot] = QuerySlot::Written {
                        issued_at: self.submissions,
                        stats: PipelineStatistics { primitives },
                    };
                }
            }
        }

        tracing::trace!(
            frame = stream.frame(),
            visible = self.publish_args.instance_count,
            "software frame executed"
        );
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), CullError> {
        self.idle_through = self.submissions;
        Ok(())
    }

    fn read_published(&mut self) -> Result<PublishedFrame, CullError> {
        let n = self.publish_args.instance_count as usize;
        Ok(PublishedFrame {
            args: self.publish_args,
            visible: self.publish_visible[..n].to_vec(),
        })
    }
}
