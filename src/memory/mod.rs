//! Device memory buffers and pinned host memory.

pub mod buffer;
pub mod pinned;

pub use buffer::DeviceBuffer;
pub use pinned::{released_count, PinnedBuffer};
