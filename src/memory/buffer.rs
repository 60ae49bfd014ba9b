//! Device memory regions and zero-copy views.
//!
//! A [`DeviceBuffer`] is either a root allocation or a sub-view of one. Views
//! share the root through an `Arc`; the root carries a generation counter
//! bumped on release, and every buffer remembers the generation it was born
//! under. Accessors compare the two, so a view over a released root fails
//! lazily with `InvalidState` at access time rather than forcing a validity
//! sweep on every release.
//!
//! Host transfers whose source/sink is not a plain slice are staged through a
//! bounded pinned scratch region, one native transfer per chunk.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::exec::deny_callback_context;
use crate::handle::{HandleBox, NULL_HANDLE};

struct RootAllocation {
    ctx: Context,
    device: usize,
    base: HandleBox,
    /// Bumped once when the root is released; views born under an older
    /// generation are retroactively invalid.
    generation: AtomicU64,
}

/// A region of memory on a specific device, or a zero-copy view into one.
///
/// Buffers must be explicitly [`close`](DeviceBuffer::close)d; closing a
/// non-root view never frees device memory.
pub struct DeviceBuffer {
    root: Arc<RootAllocation>,
    offset: u64,
    len: u64,
    born_generation: u64,
    is_root: bool,
    released: AtomicBool,
}

fn range_check(length: u64, from: u64, to: u64) -> Result<()> {
    if from > to {
        return Err(Error::invalid_argument(format!(
            "fromOffset({from}) > toOffset({to})"
        )));
    }
    if to > length {
        return Err(Error::out_of_range(format!(
            "toOffset {to} exceeds length {length}"
        )));
    }
    Ok(())
}

impl DeviceBuffer {
    /// Allocate a new root region of `byte_len` bytes on `device`.
    pub fn allocate(ctx: &Context, device: usize, byte_len: u64) -> Result<Self> {
        deny_callback_context("device allocation")?;
        if byte_len == 0 {
            return Err(Error::invalid_argument("byte length must be positive"));
        }

        let base = ctx.runtime().mem_alloc(device, byte_len)?;
        debug!(device, byte_len, "Allocated device buffer");

        Ok(Self {
            root: Arc::new(RootAllocation {
                ctx: ctx.clone(),
                device,
                base: HandleBox::new(base),
                generation: AtomicU64::new(0),
            }),
            offset: 0,
            len: byte_len,
            born_generation: 0,
            is_root: true,
            released: AtomicBool::new(false),
        })
    }

    /// Length of this buffer/view in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device the underlying region lives on.
    pub fn device(&self) -> usize {
        self.root.device
    }

    /// Whether closing this buffer frees the underlying allocation.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Whether two buffers share the same underlying allocation.
    pub fn shares_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Effective device address of this buffer/view.
    ///
    /// Fails with `InvalidState` once this buffer, or the root it was sliced
    /// from, has been released.
    pub fn address(&self) -> Result<u64> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::InvalidState("buffer closed"));
        }
        if self.root.generation.load(Ordering::Acquire) != self.born_generation {
            // Root released after this view was created; mark the view so
            // later accesses short-circuit.
            self.released.store(true, Ordering::Release);
            return Err(Error::InvalidState("root buffer released"));
        }
        let base = self
            .root
            .base
            .get()
            .map_err(|_| Error::InvalidState("root buffer released"))?;
        Ok(base + self.offset)
    }

    /// Sub-view spanning `from..to` within this buffer.
    ///
    /// A full-range view (`0..len`) aliases this buffer rather than
    /// duplicating it: it shares the same allocation, address and rootness.
    pub fn slice(&self, from: u64, to: u64) -> Result<DeviceBuffer> {
        // Address check first: slicing a released buffer is invalid.
        self.address()?;
        range_check(self.len, from, to)?;

        Ok(DeviceBuffer {
            root: self.root.clone(),
            offset: self.offset + from,
            len: to - from,
            born_generation: self.born_generation,
            is_root: self.is_root && from == 0 && to == self.len,
            released: AtomicBool::new(false),
        })
    }

    /// View beginning at `from` and extending to the end of this buffer.
    pub fn at_offset(&self, from: u64) -> Result<DeviceBuffer> {
        self.slice(from, self.len)
    }

    /// Release the device memory backing this buffer.
    ///
    /// Idempotent and safe under concurrent calls; closing a non-root view
    /// only invalidates the view. Does not wait for in-flight device work.
    pub fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.is_root {
            return Ok(());
        }

        let base = self.root.base.take();
        if base != NULL_HANDLE {
            self.root.generation.fetch_add(1, Ordering::AcqRel);
            self.root.ctx.runtime().mem_free(self.root.device, base)?;
            debug!(device = self.root.device, "Freed device buffer");
        }
        Ok(())
    }

    fn length_check(&self, byte_count: u64) -> Result<()> {
        if byte_count > self.len {
            return Err(Error::out_of_range(format!(
                "transfer of {byte_count} bytes exceeds buffer length {}",
                self.len
            )));
        }
        Ok(())
    }

    /// Copy typed elements from a host slice into this buffer.
    ///
    /// Elements are read from `source[from_index..to_index]` and stored in
    /// the same order starting at the beginning of this buffer; create a
    /// sub-view to copy elsewhere.
    pub fn copy_from<T: Pod>(&self, source: &[T], from_index: usize, to_index: usize) -> Result<()> {
        deny_callback_context("host to device copy")?;
        range_check(source.len() as u64, from_index as u64, to_index as u64)?;

        let elem = std::mem::size_of::<T>() as u64;
        self.length_check((to_index - from_index) as u64 * elem)?;

        let bytes: &[u8] = bytemuck::cast_slice(&source[from_index..to_index]);
        self.root
            .ctx
            .runtime()
            .memcpy_host_to_device(self.root.device, self.address()?, bytes)
    }

    /// Copy this buffer's data into a typed host slice.
    pub fn copy_to<T: Pod>(
        &self,
        target: &mut [T],
        from_index: usize,
        to_index: usize,
    ) -> Result<()> {
        deny_callback_context("device to host copy")?;
        range_check(target.len() as u64, from_index as u64, to_index as u64)?;

        let elem = std::mem::size_of::<T>() as u64;
        self.length_check((to_index - from_index) as u64 * elem)?;

        let addr = self.address()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut target[from_index..to_index]);
        self.root
            .ctx
            .runtime()
            .memcpy_device_to_host(self.root.device, addr, bytes)
    }

    /// Copy an entire host slice into this buffer.
    pub fn copy_from_slice<T: Pod>(&self, source: &[T]) -> Result<()> {
        self.copy_from(source, 0, source.len())
    }

    /// Fill an entire host slice from this buffer.
    pub fn copy_to_slice<T: Pod>(&self, target: &mut [T]) -> Result<()> {
        let len = target.len();
        self.copy_to(target, 0, len)
    }

    /// Copy `source[from_offset..to_offset]` (device memory, possibly on
    /// another device) into the beginning of this buffer.
    pub fn copy_from_device(
        &self,
        source: &DeviceBuffer,
        from_offset: u64,
        to_offset: u64,
    ) -> Result<()> {
        deny_callback_context("device to device copy")?;
        range_check(source.len, from_offset, to_offset)?;

        let byte_count = to_offset - from_offset;
        self.length_check(byte_count)?;

        // source.address() already includes the view's own offset.
        let src = source.address()? + from_offset;
        self.root.ctx.runtime().memcpy_device_to_device(
            self.root.device,
            self.address()?,
            source.root.device,
            src,
            byte_count,
        )
    }

    /// Store `count` repetitions of `value` (low `elem_size` bytes) at the
    /// beginning of this buffer. `elem_size` must be 1, 2 or 4.
    pub fn fill(&self, value: u32, elem_size: u32, count: u64) -> Result<()> {
        deny_callback_context("device fill")?;
        if !matches!(elem_size, 1 | 2 | 4) {
            return Err(Error::invalid_argument(format!(
                "unsupported fill element size {elem_size}"
            )));
        }
        let byte_count = count.checked_mul(elem_size as u64).ok_or_else(|| {
            Error::out_of_range(format!(
                "fill of {count} elements of {elem_size} bytes overflows"
            ))
        })?;
        self.length_check(byte_count)?;

        self.root.ctx.runtime().mem_fill(
            self.root.device,
            self.address()?,
            elem_size,
            value,
            count,
        )
    }

    /// Copy `byte_count` bytes from an arbitrary host source into this
    /// buffer, staging through a bounded pinned scratch region.
    ///
    /// Used when the host side is not directly addressable as a slice. The
    /// scratch registration is released on every exit path; native transfer
    /// calls can fail mid-loop.
    pub fn copy_from_reader<R: Read>(&self, source: &mut R, byte_count: u64) -> Result<()> {
        deny_callback_context("host to device copy")?;
        self.length_check(byte_count)?;
        if byte_count == 0 {
            return Ok(());
        }

        let base = self.address()?;
        let chunk = self.root.ctx.config().chunk_bytes(byte_count);
        let mut scratch = StagingScratch::new(&self.root.ctx, chunk)?;

        let mut start = 0u64;
        while start < byte_count {
            let n = ((byte_count - start) as usize).min(chunk);
            source.read_exact(&mut scratch.bytes_mut()[..n])?;
            self.root
                .ctx
                .runtime()
                .memcpy_host_to_device(self.root.device, base + start, &scratch.bytes()[..n])?;
            start += n as u64;
        }
        Ok(())
    }

    /// Copy `byte_count` bytes from this buffer into an arbitrary host sink,
    /// staging through a bounded pinned scratch region.
    pub fn copy_to_writer<W: Write>(&self, target: &mut W, byte_count: u64) -> Result<()> {
        deny_callback_context("device to host copy")?;
        self.length_check(byte_count)?;
        if byte_count == 0 {
            return Ok(());
        }

        let base = self.address()?;
        let chunk = self.root.ctx.config().chunk_bytes(byte_count);
        let mut scratch = StagingScratch::new(&self.root.ctx, chunk)?;

        let mut start = 0u64;
        while start < byte_count {
            let n = ((byte_count - start) as usize).min(chunk);
            self.root
                .ctx
                .runtime()
                .memcpy_device_to_host(self.root.device, base + start, &mut scratch.bytes_mut()[..n])?;
            target.write_all(&scratch.bytes()[..n])?;
            start += n as u64;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.root.device)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("is_root", &self.is_root)
            .finish()
    }
}

/// Pinned scratch region for staged transfers. The host registration is
/// released when the guard drops, on success and fault paths alike.
struct StagingScratch {
    ctx: Context,
    storage: Box<[u8]>,
    host_addr: u64,
}

impl StagingScratch {
    fn new(ctx: &Context, bytes: usize) -> Result<Self> {
        let storage = vec![0u8; bytes].into_boxed_slice();
        let host_addr = storage.as_ptr() as u64;
        ctx.runtime().register_host_memory(host_addr, bytes as u64)?;
        Ok(Self {
            ctx: ctx.clone(),
            storage,
            host_addr,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.storage
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }
}

impl Drop for StagingScratch {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.runtime().unregister_host_memory(self.host_addr) {
            warn!(host_addr = self.host_addr, %err, "scratch unregister failed");
        }
    }
}
