//! Native runtime service boundary.
//!
//! The vendor driver/runtime is an external collaborator reached only through
//! the [`NativeRuntime`] trait. Implementations translate every native status
//! into the uniform fault type; raw status integers never cross this seam as
//! control flow. [`sim::SimRuntime`] is the in-process implementation used
//! for CPU-only builds and tests.

pub mod sim;

use crate::error::Result;

/// Handle value naming the runtime's default execution queue.
pub const DEFAULT_STREAM: u64 = 0;

/// Host function enqueued onto a stream; runs on a runtime-managed thread.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// Kind of a code fragment fed to a link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Device binary for a single architecture.
    Binary,
    /// Bundled multi-architecture image.
    Bundle,
    /// Archive of objects.
    Archive,
    /// Relocatable object.
    Object,
    /// Textual source accepted by the runtime's JIT.
    Source,
}

/// Recognized just-in-time option keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionKey {
    MaxRegisters,
    ThreadsPerBlock,
    RecordWallTime,
    InfoLogBufferSize,
    ErrorLogBufferSize,
    OptimizationLevel,
    TargetArchitecture,
    FallbackStrategy,
    GenerateDebugInfo,
    GenerateLineInfo,
    VerboseLogging,
    CacheMode,
}

/// Output fields populated by the runtime after an options handle is used.
#[derive(Debug, Clone, Default)]
pub struct OptionsOutput {
    pub info_log: String,
    pub error_log: String,
    pub wall_time_ms: f32,
    pub threads_per_block: Option<u32>,
}

/// Opaque service exposing the native driver/runtime operations the core
/// depends on. All addresses and handles are integer-sized tokens owned by
/// exactly one [`crate::handle::HandleBox`] on the host side.
pub trait NativeRuntime: Send + Sync {
    // --- memory ---

    fn mem_alloc(&self, device: usize, bytes: u64) -> Result<u64>;
    fn mem_free(&self, device: usize, addr: u64) -> Result<()>;
    fn memcpy_host_to_device(&self, device: usize, dst: u64, src: &[u8]) -> Result<()>;
    fn memcpy_device_to_host(&self, device: usize, src: u64, dst: &mut [u8]) -> Result<()>;
    fn memcpy_device_to_device(
        &self,
        dst_device: usize,
        dst: u64,
        src_device: usize,
        src: u64,
        bytes: u64,
    ) -> Result<()>;
    /// Repeat `value` (low `elem_size` bytes) `count` times starting at `addr`.
    fn mem_fill(&self, device: usize, addr: u64, elem_size: u32, value: u32, count: u64)
        -> Result<()>;

    // --- pinned host memory ---

    /// Page-lock and register `bytes` of host memory at `host_addr`; returns
    /// the device-visible alias address.
    fn register_host_memory(&self, host_addr: u64, bytes: u64) -> Result<u64>;
    fn unregister_host_memory(&self, host_addr: u64) -> Result<()>;

    // --- streams ---

    fn stream_create(&self, device: usize, flags: u32, priority: i32) -> Result<u64>;
    fn stream_destroy(&self, device: usize, stream: u64) -> Result<()>;
    /// `true` when all previously enqueued work has completed.
    fn stream_query(&self, device: usize, stream: u64) -> Result<bool>;
    fn stream_synchronize(&self, device: usize, stream: u64) -> Result<()>;
    fn stream_add_callback(&self, device: usize, stream: u64, callback: HostCallback)
        -> Result<()>;
    fn stream_wait_event(&self, device: usize, stream: u64, event: u64) -> Result<()>;

    // --- events ---

    fn event_create(&self, device: usize, flags: u32) -> Result<u64>;
    fn event_destroy(&self, event: u64) -> Result<()>;
    /// Record the event on `stream` (`DEFAULT_STREAM` for the default queue).
    fn event_record(&self, device: usize, event: u64, stream: u64) -> Result<()>;
    /// `true` when the recorded point in time has occurred.
    fn event_query(&self, event: u64) -> Result<bool>;
    fn event_synchronize(&self, event: u64) -> Result<()>;
    fn event_elapsed_ms(&self, event: u64, since: u64) -> Result<f32>;

    // --- code modules ---

    fn module_load(&self, device: usize, image: &[u8], options: u64) -> Result<u64>;
    fn module_unload(&self, module: u64) -> Result<()>;
    fn module_get_function(&self, module: u64, name: &str) -> Result<u64>;
    /// Returns `(address, byte length)` of a named global.
    fn module_get_global(&self, module: u64, name: &str) -> Result<(u64, u64)>;
    fn module_get_texture(&self, module: u64, name: &str) -> Result<u64>;
    fn module_get_surface(&self, module: u64, name: &str) -> Result<u64>;

    // --- link sessions ---

    fn link_create(&self, device: usize, options: u64) -> Result<u64>;
    fn link_add_data(
        &self,
        session: u64,
        kind: FragmentKind,
        data: &[u8],
        name: &str,
        options: u64,
    ) -> Result<()>;
    fn link_complete(&self, session: u64) -> Result<Vec<u8>>;
    fn link_destroy(&self, session: u64) -> Result<()>;

    // --- jit options ---

    fn options_create(&self, pairs: &[(OptionKey, u64)]) -> Result<u64>;
    fn options_destroy(&self, handle: u64) -> Result<()>;
    fn options_output(&self, handle: u64) -> Result<OptionsOutput>;

    // --- launch ---

    #[allow(clippy::too_many_arguments)]
    fn launch_kernel(
        &self,
        device: usize,
        function: u64,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_bytes: u32,
        stream: u64,
        params: &[u64],
    ) -> Result<()>;
}
