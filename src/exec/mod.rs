//! Execution queues, completion markers and kernel launches.
//!
//! Device work is asynchronous by default: enqueue calls return immediately
//! and only `synchronize`/blocking waits park the calling thread. Host
//! callbacks enqueued on a queue run on a runtime-managed thread on which
//! further device operations are forbidden; the guard here enforces that.

pub mod event;
pub mod launch;
pub mod stream;

pub use event::{Event, EventFlag, MarkerState};
pub use launch::{Dim3, KernelParam, LaunchConfig, LaunchParameterSet};
pub use stream::{QueueState, Stream, StreamFlag};

use std::cell::Cell;

use crate::error::{Error, Result};

thread_local! {
    static IN_DEVICE_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Fails with `NotPermitted` when called from a runtime-managed completion
/// callback. Every operation that reaches the native runtime checks this
/// first; the restriction is a hard platform constraint, not a convenience
/// rule.
pub(crate) fn deny_callback_context(op: &'static str) -> Result<()> {
    if IN_DEVICE_CALLBACK.with(Cell::get) {
        Err(Error::NotPermitted(format!(
            "{op} attempted from a device completion callback"
        )))
    } else {
        Ok(())
    }
}

/// Marks the current thread as a callback context for its lifetime.
///
/// Entered by runtime implementations around each host callback they run.
pub(crate) struct CallbackScope {
    _private: (),
}

impl CallbackScope {
    pub(crate) fn enter() -> Self {
        IN_DEVICE_CALLBACK.with(|f| f.set(true));
        Self { _private: () }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_DEVICE_CALLBACK.with(|f| f.set(false));
    }
}
