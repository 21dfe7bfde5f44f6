//! Ring of overlapped pipeline-statistics queries.
//!
//! # Invariants
//! - `last_completed_frame <= cur_frame`, and both only ever grow.
//! - Frame `f` uses slot `f % capacity`.
//! - Slots are read oldest first; a not-ready slot stops the poll.

use crate::device::{CommandStream, DeviceCommand, QueryFetch, QuerySource};
use crate::error::CullError;

/// Host-side bookkeeping for a fixed ring of statistics queries.
///
/// The query objects themselves live on the device and are created once;
/// this type only decides which slot a frame uses and which slot to read
/// next. If more than `capacity` frames are in flight, the oldest results
/// have already been overwritten on the device and are counted as lost.
#[derive(Debug, Clone)]
pub struct TelemetryRing {
    capacity: usize,
    primitives_per_instance: u32,
    cur_frame: u64,
    last_completed_frame: u64,
    rendered_instances: Option<u32>,
    recovered_frames: u64,
    lost_frames: u64,
}

impl TelemetryRing {
    pub fn new(capacity: usize, primitives_per_instance: u32) -> Result<Self, CullError> {
        if capacity == 0 || primitives_per_instance == 0 {
            return Err(CullError::InvalidConfig(
                "telemetry ring needs a capacity and primitives per instance".into(),
            ));
        }
        Ok(Self {
            capacity,
            primitives_per_instance,
            cur_frame: 0,
            last_completed_frame: 0,
            rendered_instances: None,
            recovered_frames: 0,
            lost_frames: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cur_frame(&self) -> u64 {
        self.cur_frame
    }

    pub fn last_completed_frame(&self) -> u64 {
        self.last_completed_frame
    }

    /// Frames submitted but not yet polled (may exceed capacity).
    pub fn in_flight(&self) -> u64 {
        self.cur_frame - self.last_completed_frame
    }

    /// Latest approximate rendered-instance count, once any poll succeeded.
    pub fn rendered_instances(&self) -> Option<u32> {
        self.rendered_instances
    }

    pub fn recovered_frames(&self) -> u64 {
        self.recovered_frames
    }

    /// Frames whose results were overwritten or unreadable.
    pub fn lost_frames(&self) -> u64 {
        self.lost_frames
    }

    pub fn slot_for(&self, frame: u64) -> usize {
        (frame % self.capacity as u64) as usize
    }

    /// Slot the next submitted frame will use.
    pub fn current_slot(&self) -> usize {
        self.slot_for(self.cur_frame)
    }

    /// Bracket the indirect draw with this frame's query.
    pub fn encode_draw(&self, stream: &mut CommandStream) -> usize {
        let slot = self.current_slot();
        stream.push(DeviceCommand::BeginQuery { slot });
        stream.push(DeviceCommand::DrawIndexedIndirect);
        stream.push(DeviceCommand::EndQuery { slot });
        slot
    }

    /// Record that the frame encoded by [`encode_draw`](Self::encode_draw)
    /// reached the device.
    pub fn frame_submitted(&mut self) {
        self.cur_frame += 1;
    }

    /// Collect every result that is ready, oldest first, without waiting.
    ///
    /// Returns the newest count recovered by this call, if any.
    pub fn poll<S>(&mut self, source: &mut S) -> Result<Option<u32>, CullError>
    where
        S: QuerySource + ?Sized,
    {
        let oldest_recoverable = self.cur_frame.saturating_sub(self.capacity as u64);
        if self.last_completed_frame < oldest_recoverable {
            let dropped = oldest_recoverable - self.last_completed_frame;
            tracing::debug!(
                dropped,
                from = self.last_completed_frame,
                to = oldest_recoverable,
                "query ring overrun; stale telemetry discarded"
            );
            self.lost_frames += dropped;
            self.last_completed_frame = oldest_recoverable;
        }

        let mut newest = None;
        while self.last_completed_frame < self.cur_frame {
            let frame = self.last_completed_frame;
            match source.try_fetch_query(self.slot_for(frame))? {
                QueryFetch::Ready(stats) => {
                    let instances = stats.primitives / u64::from(self.primitives_per_instance);
                    let instances = u32::try_from(instances).unwrap_or(u32::MAX);
                    tracing::trace!(frame, instances, "query result ready");
                    newest = Some(instances);
                    self.rendered_instances = Some(instances);
                    self.recovered_frames += 1;
                    self.last_completed_frame += 1;
                }
                QueryFetch::NotReady => break,
                QueryFetch::Lost => {
                    tracing::debug!(frame, "query result lost");
                    self.lost_frames += 1;
                    self.last_completed_frame += 1;
                }
            }
        }
        Ok(newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PipelineStatistics;
    use std::collections::HashMap;

    /// Query results keyed by slot, written by "frame" like a device would.
    #[derive(Default)]
    struct FakeQueries {
        capacity: usize,
        slots: HashMap<usize, (u64, bool, QueryFetch)>,
        fetches: Vec<usize>,
    }

    impl FakeQueries {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                ..Self::default()
            }
        }

        /// Frame `frame` drew `instances`; result not ready until `complete`.
        fn issue(&mut self, frame: u64, instances: u64) {
            let slot = (frame % self.capacity as u64) as usize;
            let fetch = QueryFetch::Ready(PipelineStatistics {
                primitives: instances * 12,
            });
            self.slots.insert(slot, (frame, false, fetch));
        }

        fn complete_through(&mut self, frame: u64) {
            for (issued, done, _) in self.slots.values_mut() {
                if *issued <= frame {
                    *done = true;
                }
            }
        }
    }

    impl QuerySource for FakeQueries {
        fn try_fetch_query(&mut self, slot: usize) -> Result<QueryFetch, CullError> {
            self.fetches.push(slot);
            Ok(match self.slots.get(&slot) {
                Some((_, true, fetch)) => *fetch,
                _ => QueryFetch::NotReady,
            })
        }
    }

    fn submit(ring: &mut TelemetryRing, device: &mut FakeQueries, instances: u64) {
        let mut stream = CommandStream::new(ring.cur_frame());
        ring.encode_draw(&mut stream);
        device.issue(ring.cur_frame(), instances);
        ring.frame_submitted();
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(TelemetryRing::new(0, 12).is_err());
        assert!(TelemetryRing::new(4, 0).is_err());
    }

    #[test]
    fn encode_draw_brackets_with_current_slot() {
        let mut ring = TelemetryRing::new(3, 12).unwrap();
        for _ in 0..4 {
            ring.frame_submitted();
        }
        let mut stream = CommandStream::new(4);
        assert_eq!(ring.encode_draw(&mut stream), 1);
        assert_eq!(
            stream.commands(),
            &[
                DeviceCommand::BeginQuery { slot: 1 },
                DeviceCommand::DrawIndexedIndirect,
                DeviceCommand::EndQuery { slot: 1 },
            ]
        );
    }

    #[test]
    fn not_ready_stops_the_poll() {
        let mut ring = TelemetryRing::new(4, 12).unwrap();
        let mut dev = FakeQueries::new(4);
        submit(&mut ring, &mut dev, 5);
        submit(&mut ring, &mut dev, 6);

        assert_eq!(ring.poll(&mut dev).unwrap(), None);
        assert_eq!(ring.last_completed_frame(), 0);
        // Only the oldest slot was asked; newer ones are never skipped to.
        assert_eq!(dev.fetches, vec![0]);

        dev.complete_through(0);
        assert_eq!(ring.poll(&mut dev).unwrap(), Some(5));
        assert_eq!(ring.last_completed_frame(), 1);

        dev.complete_through(1);
        assert_eq!(ring.poll(&mut dev).unwrap(), Some(6));
        assert_eq!(ring.rendered_instances(), Some(6));
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn counters_are_monotonic_and_bounded() {
        let mut ring = TelemetryRing::new(3, 12).unwrap();
        let mut dev = FakeQueries::new(3);
        let mut last = 0;
        for frame in 0..50u64 {
            submit(&mut ring, &mut dev, frame);
            if frame % 3 == 0 {
                dev.complete_through(frame.saturating_sub(2));
            }
            if frame % 2 == 0 {
                ring.poll(&mut dev).unwrap();
            }
            assert!(ring.last_completed_frame() >= last);
            assert!(ring.last_completed_frame() <= ring.cur_frame());
            last = ring.last_completed_frame();
        }
    }

    #[test]
    fn overrun_loses_oldest_frame() {
        let capacity = 4;
        let mut ring = TelemetryRing::new(capacity, 12).unwrap();
        let mut dev = FakeQueries::new(capacity);
        for frame in 0..=capacity as u64 {
            submit(&mut ring, &mut dev, 10 + frame);
        }
        dev.complete_through(u64::MAX);

        assert_eq!(ring.poll(&mut dev).unwrap(), Some(14));
        assert_eq!(ring.lost_frames(), 1);
        assert_eq!(ring.recovered_frames(), capacity as u64);
        assert_eq!(ring.last_completed_frame(), ring.cur_frame());
        // Frame 0's slot was reread as frame 4; frame 0 is gone for good.
        assert_eq!(dev.fetches, vec![1, 2, 3, 0]);
    }

    #[test]
    fn lost_slot_is_skipped_not_retried() {
        let mut ring = TelemetryRing::new(2, 12).unwrap();
        let mut dev = FakeQueries::new(2);
        submit(&mut ring, &mut dev, 1);
        submit(&mut ring, &mut dev, 2);
        dev.slots.insert(0, (0, true, QueryFetch::Lost));
        dev.complete_through(1);

        assert_eq!(ring.poll(&mut dev).unwrap(), Some(2));
        assert_eq!(ring.lost_frames(), 1);
        assert_eq!(ring.recovered_frames(), 1);
    }

    #[test]
    fn poll_with_nothing_in_flight_is_a_no_op() {
        let mut ring = TelemetryRing::new(2, 12).unwrap();
        let mut dev = FakeQueries::new(2);
        assert_eq!(ring.poll(&mut dev).unwrap(), None);
        assert!(dev.fetches.is_empty());
        assert_eq!(ring.rendered_instances(), None);
    }
}
