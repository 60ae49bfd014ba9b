//! Host-side control layer for a discrete compute accelerator.
//!
//! Provides typed, bound-checked device buffers with zero-copy views,
//! page-locked host buffers with background registration reclaim, execution
//! queues with completion markers and host callbacks, code module loading
//! with an incremental linker and JIT options, and kernel launch parameter
//! marshaling. All native work flows through the [`runtime::NativeRuntime`]
//! seam; [`runtime::sim::SimRuntime`] is the in-process implementation for
//! CPU-only builds and tests.
//!
//! Resources holding native handles (buffers, streams, events, modules, link
//! sessions) require explicit release; release is idempotent and safe under
//! concurrent callers. Pinned registrations are the one exception, reclaimed
//! in the background on drop.

pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod handle;
pub mod memory;
pub mod module;
pub mod policy;
pub mod runtime;

pub use config::CoreConfig;
pub use context::Context;
pub use error::{Error, Result, Status};
pub use exec::{Dim3, Event, KernelParam, LaunchConfig, LaunchParameterSet, Stream};
pub use memory::{DeviceBuffer, PinnedBuffer};
pub use module::{Function, JitOptions, Linker, Module, ModuleCache};
