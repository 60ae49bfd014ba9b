//! Execution queues.
//!
//! A stream is an ordered, independent queue of device operations. Enqueued
//! work executes FIFO relative to other work on the same stream; cross-stream
//! ordering exists only where [`Stream::wait_event`] inserts a dependency.

use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::exec::deny_callback_context;
use crate::exec::event::Event;
use crate::handle::{HandleBox, NULL_HANDLE};

/// Stream creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum StreamFlag {
    /// Synchronizes with the default stream.
    #[default]
    Default = 0,
    /// Runs independently of the default stream.
    NonBlocking = 1,
}

/// Result of a non-blocking completion probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// All previously enqueued work has completed.
    Ready,
    /// Work is still in flight.
    Pending,
}

/// An ordered queue of device operations.
///
/// Must be explicitly [`close`](Stream::close)d; closing does not wait for
/// in-flight work.
pub struct Stream {
    ctx: Context,
    device: usize,
    handle: HandleBox,
}

impl Stream {
    /// Create a stream with default flags and the configured default
    /// priority.
    pub fn create(ctx: &Context, device: usize) -> Result<Self> {
        let priority = ctx.config().exec.default_stream_priority;
        Self::with_flags(ctx, device, StreamFlag::Default, priority)
    }

    /// Create a stream with explicit flags and priority. Lower priority
    /// values run sooner on runtimes that honor priorities.
    pub fn with_flags(
        ctx: &Context,
        device: usize,
        flag: StreamFlag,
        priority: i32,
    ) -> Result<Self> {
        deny_callback_context("stream creation")?;
        let raw = ctx.runtime().stream_create(device, flag as u32, priority)?;
        debug!(device, ?flag, priority, "Created stream");
        Ok(Self {
            ctx: ctx.clone(),
            device,
            handle: HandleBox::new(raw),
        })
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub(crate) fn raw(&self) -> Result<u64> {
        self.handle.get()
    }

    /// Enqueue a host callback behind all work currently on this stream.
    ///
    /// The callback runs on a runtime-managed thread; device operations are
    /// forbidden inside it and fail with `NotPermitted`.
    pub fn add_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        deny_callback_context("callback enqueue")?;
        self.ctx
            .runtime()
            .stream_add_callback(self.device, self.raw()?, Box::new(callback))
    }

    /// Make all future work on this stream wait until `marker` has occurred.
    pub fn wait_event(&self, marker: &Event) -> Result<()> {
        deny_callback_context("stream wait")?;
        self.ctx
            .runtime()
            .stream_wait_event(self.device, self.raw()?, marker.raw()?)
    }

    /// Probe completion without blocking.
    pub fn query(&self) -> Result<QueueState> {
        deny_callback_context("stream query")?;
        let ready = self.ctx.runtime().stream_query(self.device, self.raw()?)?;
        Ok(if ready {
            QueueState::Ready
        } else {
            QueueState::Pending
        })
    }

    /// Park the calling thread until all previously enqueued work completes.
    pub fn synchronize(&self) -> Result<()> {
        deny_callback_context("stream synchronize")?;
        self.ctx
            .runtime()
            .stream_synchronize(self.device, self.raw()?)
    }

    /// Release the stream handle.
    ///
    /// Does not wait for pending work; already-dispatched work runs to
    /// completion independently. Idempotent and safe from any thread.
    pub fn close(&self) -> Result<()> {
        let raw = self.handle.take();
        if raw != NULL_HANDLE {
            self.ctx.runtime().stream_destroy(self.device, raw)?;
            debug!(device = self.device, "Closed stream");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("handle", &self.handle.peek())
            .finish()
    }
}
