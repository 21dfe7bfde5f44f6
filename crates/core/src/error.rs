/// Errors from the culling pipeline.
///
/// Every failing operation surfaces exactly one of these. The core never
/// retries; whether to skip a frame or tear the pipeline down is up to the
/// caller.
#[derive(Debug, thiserror::Error)]
pub enum CullError {
    /// A buffer, kernel or query object could not be created during setup.
    #[error("initialization failed while creating {resource}: {reason}")]
    Initialization { resource: String, reason: String },
    /// The per-frame upload could not get a host-writable view of a buffer.
    #[error("could not map {buffer} for writing; frame update aborted")]
    TransientMap { buffer: &'static str },
    #[error("{requested} instances exceed the configured capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A frame's command stream violates the dispatch → publish → draw order.
    #[error("command stream for frame {frame} out of order: {reason}")]
    CommandOrder { frame: u64, reason: &'static str },
    #[error("device error: {0}")]
    Device(String),
}

impl CullError {
    pub fn init(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self::Initialization {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that only invalidate the current frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientMap { .. } | Self::CapacityExceeded { .. })
    }
}
