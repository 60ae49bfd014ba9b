//! Page-locked host buffers registered with the device runtime.
//!
//! Registration release is the one implicit lifecycle in this crate: when a
//! [`PinnedBuffer`] is dropped its registration is handed to a single
//! process-wide reclaim worker, which unregisters it best-effort. Programs
//! must not rely on timely release, only eventual release; deterministic
//! teardown paths should call [`PinnedBuffer::unregister`] instead.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock};

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::NativeRuntime;

/// Total registrations released so far, process-wide. Diagnostic only.
static RELEASED: AtomicU64 = AtomicU64::new(0);

static RECLAIM_TX: OnceLock<Mutex<Sender<ReclaimRequest>>> = OnceLock::new();

struct ReclaimRequest {
    runtime: Arc<dyn NativeRuntime>,
    host_addr: u64,
}

/// Number of pinned registrations released so far (explicitly or via the
/// reclaim worker). Monotonic; diagnostic only.
pub fn released_count() -> u64 {
    RELEASED.load(Ordering::SeqCst)
}

fn reclaim_tx() -> &'static Mutex<Sender<ReclaimRequest>> {
    RECLAIM_TX.get_or_init(|| {
        let (tx, rx) = mpsc::channel::<ReclaimRequest>();

        // One worker for the whole process, started once, never stopped.
        // Failures here are swallowed: this is a best-effort finalizer, not a
        // guaranteed-delivery channel.
        std::thread::Builder::new()
            .name("pinned-reclaim".into())
            .spawn(move || {
                for req in rx {
                    match req.runtime.unregister_host_memory(req.host_addr) {
                        Ok(()) => {
                            RELEASED.fetch_add(1, Ordering::SeqCst);
                            debug!(host_addr = req.host_addr, "Reclaimed pinned registration");
                        }
                        Err(err) => {
                            warn!(host_addr = req.host_addr, %err, "Pinned unregister failed")
                        }
                    }
                }
            })
            .expect("failed to spawn pinned-reclaim thread");

        Mutex::new(tx)
    })
}

/// A page-locked host buffer with a device-visible registration.
///
/// Elements are interpreted little-endian, matching the device byte order.
/// The host storage is owned by the caller; the registration is released by
/// the reclaim worker once the buffer is dropped.
pub struct PinnedBuffer {
    /// 8-byte aligned backing words so typed views stay aligned. The heap
    /// block never moves while registered.
    words: Box<[u64]>,
    byte_len: usize,
    device_addr: u64,
    registration: Option<(Arc<dyn NativeRuntime>, u64)>,
}

impl PinnedBuffer {
    /// Page-lock and register `byte_len` bytes of host memory.
    pub fn allocate(ctx: &Context, byte_len: usize) -> Result<Self> {
        if byte_len > i32::MAX as usize {
            return Err(Error::invalid_argument(format!(
                "pinned length {byte_len} exceeds {}",
                i32::MAX
            )));
        }

        let words = vec![0u64; byte_len.div_ceil(8)].into_boxed_slice();

        // Nothing to page-lock for an empty buffer; the dangling placeholder
        // pointer of an empty allocation must not reach the runtime.
        if byte_len == 0 {
            return Ok(Self {
                words,
                byte_len,
                device_addr: 0,
                registration: None,
            });
        }

        let host_addr = words.as_ptr() as u64;
        let runtime = ctx.runtime().clone();
        let device_addr = runtime.register_host_memory(host_addr, byte_len as u64)?;
        debug!(byte_len, host_addr, "Registered pinned buffer");

        Ok(Self {
            words,
            byte_len,
            device_addr,
            registration: Some((runtime, host_addr)),
        })
    }

    pub fn len(&self) -> usize {
        self.byte_len
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len == 0
    }

    /// Device-visible alias address of this buffer.
    pub fn device_address(&self) -> u64 {
        self.device_addr
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.byte_len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.byte_len]
    }

    /// View the contents as a slice of `T` (little-endian elements).
    ///
    /// Fails with `InvalidArgument` when the buffer length is not a multiple
    /// of the element size.
    pub fn as_typed<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| Error::invalid_argument(format!("pinned buffer reinterpret: {e}")))
    }

    pub fn as_typed_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|e| Error::invalid_argument(format!("pinned buffer reinterpret: {e}")))
    }

    /// Unregister now, instead of waiting for the reclaim worker.
    ///
    /// Escape hatch for deterministic-teardown paths.
    pub fn unregister(mut self) -> Result<()> {
        if let Some((runtime, host_addr)) = self.registration.take() {
            runtime.unregister_host_memory(host_addr)?;
            RELEASED.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Deref for PinnedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl DerefMut for PinnedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_bytes_mut()
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if let Some((runtime, host_addr)) = self.registration.take() {
            let tx = reclaim_tx().lock().unwrap_or_else(|e| e.into_inner());
            let _ = tx.send(ReclaimRequest { runtime, host_addr });
        }
    }
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("byte_len", &self.byte_len)
            .field("device_addr", &self.device_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::SimRuntime;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_allocate_and_typed_access() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt.clone());

        let mut buf = PinnedBuffer::allocate(&ctx, 64).unwrap();
        assert_eq!(buf.len(), 64);
        assert_ne!(buf.device_address(), 0);

        buf.as_typed_mut::<u32>().unwrap()[0] = 0x0403_0201;
        assert_eq!(&buf.as_bytes()[..4], &[1, 2, 3, 4]);

        buf.unregister().unwrap();
        assert_eq!(rt.registered_count(), 0);
    }

    #[test]
    fn test_typed_access_requires_exact_multiple() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt);

        let buf = PinnedBuffer::allocate(&ctx, 10).unwrap();
        assert!(buf.as_typed::<u32>().is_err());
        buf.unregister().unwrap();
    }

    #[test]
    fn test_zero_length_buffers_skip_registration() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt.clone());

        // Empty boxed slices share a placeholder address; neither allocation
        // may register it.
        let first = PinnedBuffer::allocate(&ctx, 0).unwrap();
        let second = PinnedBuffer::allocate(&ctx, 0).unwrap();
        assert!(first.is_empty());
        assert!(second.as_bytes().is_empty());
        assert_eq!(rt.registered_count(), 0);

        first.unregister().unwrap();
        drop(second);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt);
        assert!(matches!(
            PinnedBuffer::allocate(&ctx, i32::MAX as usize + 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_drop_reclaims_eventually() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt.clone());

        let before = released_count();
        let buf = PinnedBuffer::allocate(&ctx, 128).unwrap();
        assert_eq!(rt.registered_count(), 1);

        drop(buf);

        assert!(wait_until(Duration::from_secs(5), || rt.registered_count() == 0));
        assert!(released_count() >= before + 1);
    }
}
