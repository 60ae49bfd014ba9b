//! Completion markers.
//!
//! An event marks a point in time on a queue: record it, poll or wait on it,
//! or measure the wall time elapsed between two recorded events.

use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::exec::deny_callback_context;
use crate::exec::stream::Stream;
use crate::handle::{HandleBox, NULL_HANDLE};
use crate::runtime::DEFAULT_STREAM;

/// Event creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum EventFlag {
    #[default]
    Default = 0,
    /// `synchronize` yields the thread instead of spinning.
    BlockingSync = 1,
    /// Skip timing bookkeeping; such events cannot feed `elapsed_ms`.
    DisableTiming = 2,
}

/// Result of a non-blocking occurrence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Occurred,
    Pending,
}

/// A recordable point-in-time completion signal.
///
/// Must be explicitly [`close`](Event::close)d.
pub struct Event {
    ctx: Context,
    device: usize,
    handle: HandleBox,
}

impl Event {
    pub fn create(ctx: &Context, device: usize) -> Result<Self> {
        Self::with_flags(ctx, device, EventFlag::Default)
    }

    pub fn with_flags(ctx: &Context, device: usize, flag: EventFlag) -> Result<Self> {
        deny_callback_context("event creation")?;
        let raw = ctx.runtime().event_create(device, flag as u32)?;
        debug!(device, ?flag, "Created event");
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

    /// Record this event behind all work currently on `stream` (the default
    /// queue when `None`).
    pub fn record(&self, stream: Option<&Stream>) -> Result<()> {
        deny_callback_context("event record")?;
        let stream_raw = match stream {
            Some(s) => s.raw()?,
            None => DEFAULT_STREAM,
        };
        self.ctx
            .runtime()
            .event_record(self.device, self.raw()?, stream_raw)
    }

    /// Probe occurrence without blocking.
    pub fn query(&self) -> Result<MarkerState> {
        deny_callback_context("event query")?;
        let occurred = self.ctx.runtime().event_query(self.raw()?)?;
        Ok(if occurred {
            MarkerState::Occurred
        } else {
            MarkerState::Pending
        })
    }

    /// Park the calling thread until this event has occurred.
    pub fn synchronize(&self) -> Result<()> {
        deny_callback_context("event synchronize")?;
        self.ctx.runtime().event_synchronize(self.raw()?)
    }

    /// Milliseconds elapsed between `since` and this event. Both must have
    /// been recorded and have occurred.
    pub fn elapsed_ms(&self, since: &Event) -> Result<f32> {
        deny_callback_context("event timing")?;
        self.ctx
            .runtime()
            .event_elapsed_ms(self.raw()?, since.raw()?)
    }

    /// Release the event handle. Idempotent; does not wait for occurrence.
    pub fn close(&self) -> Result<()> {
        let raw = self.handle.take();
        if raw != NULL_HANDLE {
            self.ctx.runtime().event_destroy(raw)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device)
            .field("handle", &self.handle.peek())
            .finish()
    }
}
