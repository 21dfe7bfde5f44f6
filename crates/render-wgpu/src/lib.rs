//! wgpu backend for the culling pipeline.
//!
//! Runs the culling kernel as a compute pass, publishes its output with
//! buffer copies, draws instanced cubes with `draw_indexed_indirect` into an
//! offscreen target, and reads pipeline-statistics queries back through
//! per-slot mapped buffers.
//!
//! # Invariants
//! - The frame path never waits on the GPU; only debug readback and
//!   `wait_idle` block.
//! - A readback slot still pending when its query slot is reused is
//!   unmapped first, discarding that stale result.

mod context;
mod gpu;
mod shaders;

pub use context::{HeadlessContext, REQUIRED_FEATURES};
pub use gpu::{COLOR_FORMAT, WgpuCullDevice};
pub use shaders::{CULL_SHADER, DRAW_SHADER};
