use bytemuck::{Pod, Zeroable};

use crate::device::{CommandStream, DeviceCommand};
use crate::kernel;

/// Indexed indirect-draw arguments in the order the device reads them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawArgs {
    pub index_count_per_instance: u32,
    /// Zeroed before culling, then bumped once per visible instance.
    pub instance_count: u32,
    pub start_index_location: u32,
    pub base_vertex_location: i32,
    pub start_instance_location: u32,
}

impl IndirectDrawArgs {
    /// Arguments for a frame that has not been culled yet.
    pub fn reset(index_count_per_instance: u32) -> Self {
        Self {
            index_count_per_instance,
            ..Self::default()
        }
    }

    /// Byte offset of `instance_count`, the field the kernel increments.
    pub const INSTANCE_COUNT_OFFSET: u64 = 4;
}

/// Stages the culling output into buffers the draw may consume.
///
/// The kernel writes a scratch args buffer and a scratch visibility list.
/// Neither can be bound as an indirect-argument source or a read-only
/// shading input while it is a random-write target, so each frame ends with
/// explicit device copies into the publish buffers. Every device gets the
/// same two-phase stream, even ones that would allow a single buffer.
#[derive(Debug, Clone)]
pub struct IndirectArgsStage {
    index_count_per_instance: u32,
}

impl IndirectArgsStage {
    pub fn new(index_count_per_instance: u32) -> Self {
        Self {
            index_count_per_instance,
        }
    }

    pub fn index_count_per_instance(&self) -> u32 {
        self.index_count_per_instance
    }

    /// Append reset → dispatch → publish copies for `instance_count`
    /// instances. Returns the workgroup count dispatched.
    pub fn encode(&self, stream: &mut CommandStream, instance_count: u32) -> u32 {
        let workgroups = kernel::workgroup_count(instance_count);
        stream.push(DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(
            self.index_count_per_instance,
        )));
        stream.push(DeviceCommand::DispatchCull { workgroups });
        stream.push(DeviceCommand::PublishDrawArgs);
        stream.push(DeviceCommand::PublishVisibility);
        workgroups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_indexed_indirect() {
        assert_eq!(std::mem::size_of::<IndirectDrawArgs>(), 20);
        let args = IndirectDrawArgs {
            instance_count: 7,
            ..IndirectDrawArgs::reset(36)
        };
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&args));
        assert_eq!(words[0], 36);
        assert_eq!(words[IndirectDrawArgs::INSTANCE_COUNT_OFFSET as usize / 4], 7);
    }

    #[test]
    fn reset_zeroes_instance_count() {
        let args = IndirectDrawArgs::reset(36);
        assert_eq!(args.instance_count, 0);
        assert_eq!(args.index_count_per_instance, 36);
        assert_eq!(args.start_instance_location, 0);
    }

    #[test]
    fn encode_orders_reset_dispatch_publish() {
        let stage = IndirectArgsStage::new(36);
        let mut stream = CommandStream::new(0);
        let groups = stage.encode(&mut stream, 130);
        assert_eq!(groups, 3);
        assert_eq!(
            stream.commands(),
            &[
                DeviceCommand::ResetDrawArgs(IndirectDrawArgs::reset(36)),
                DeviceCommand::DispatchCull { workgroups: 3 },
                DeviceCommand::PublishDrawArgs,
                DeviceCommand::PublishVisibility,
            ]
        );
    }
}
