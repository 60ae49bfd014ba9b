//! Kernel launch parameter marshaling.
//!
//! Parameters are reduced to machine-word slots before the native call:
//! integral values widen, floating-point values pass by raw bit pattern, and
//! device buffers pass their current address. A [`LaunchParameterSet`] tracks
//! unset slots in a bitmask and refuses to marshal until every slot has been
//! explicitly set, null included.

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::exec::deny_callback_context;
use crate::exec::stream::Stream;
use crate::memory::DeviceBuffer;
use crate::module::Function;
use crate::runtime::DEFAULT_STREAM;

/// Grid or block dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ONE: Dim3 = Dim3 { x: 1, y: 1, z: 1 };

    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    fn as_tuple(self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }

    fn volume_is_zero(self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Dim3::new(x, 1, 1)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Dim3::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Dim3::new(x, y, z)
    }
}

/// Geometry of one launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_bytes: u32,
}

impl LaunchConfig {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_bytes: 0,
        }
    }

    pub fn with_shared_bytes(mut self, bytes: u32) -> Self {
        self.shared_bytes = bytes;
        self
    }
}

/// One kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum KernelParam<'a> {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Passes the buffer's current device address.
    Buffer(&'a DeviceBuffer),
    /// Passes the zero address.
    Null,
}

impl KernelParam<'_> {
    fn to_word(&self) -> Result<u64> {
        Ok(match *self {
            KernelParam::I8(v) => v as i64 as u64,
            KernelParam::I16(v) => v as i64 as u64,
            KernelParam::I32(v) => v as i64 as u64,
            KernelParam::I64(v) => v as u64,
            KernelParam::U8(v) => v as u64,
            KernelParam::U16(v) => v as u64,
            KernelParam::U32(v) => v as u64,
            KernelParam::U64(v) => v,
            // Floats travel as their raw bit pattern, not value-converted.
            KernelParam::F32(v) => v.to_bits() as u64,
            KernelParam::F64(v) => v.to_bits(),
            KernelParam::Buffer(buf) => buf.address()?,
            KernelParam::Null => 0,
        })
    }
}

/// Maximum slot count of a [`LaunchParameterSet`].
pub const MAX_PARAMETER_SLOTS: usize = 64;

/// A fixed-length parameter list where every slot must be explicitly set
/// before launch, explicit null/zero included.
#[derive(Debug, Clone)]
pub struct LaunchParameterSet {
    words: Vec<u64>,
    /// Bit `i` set means slot `i` has not been assigned yet.
    unset: u64,
}

impl LaunchParameterSet {
    pub fn new(count: usize) -> Result<Self> {
        if count > MAX_PARAMETER_SLOTS {
            return Err(Error::invalid_argument(format!(
                "parameter count {count} exceeds {MAX_PARAMETER_SLOTS}"
            )));
        }
        let unset = if count == 64 {
            u64::MAX
        } else {
            (1u64 << count) - 1
        };
        Ok(Self {
            words: vec![0; count],
            unset,
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn set_word(&mut self, index: usize, word: u64) -> Result<&mut Self> {
        if index >= self.words.len() {
            return Err(Error::invalid_argument(format!(
                "parameter slot {index} out of range (count {})",
                self.words.len()
            )));
        }
        self.words[index] = word;
        self.unset &= !(1u64 << index);
        Ok(self)
    }

    pub fn set(&mut self, index: usize, value: KernelParam<'_>) -> Result<&mut Self> {
        let word = value.to_word()?;
        self.set_word(index, word)
    }

    pub fn set_i32(&mut self, index: usize, value: i32) -> Result<&mut Self> {
        self.set(index, KernelParam::I32(value))
    }

    pub fn set_i64(&mut self, index: usize, value: i64) -> Result<&mut Self> {
        self.set(index, KernelParam::I64(value))
    }

    pub fn set_u32(&mut self, index: usize, value: u32) -> Result<&mut Self> {
        self.set(index, KernelParam::U32(value))
    }

    pub fn set_u64(&mut self, index: usize, value: u64) -> Result<&mut Self> {
        self.set(index, KernelParam::U64(value))
    }

    pub fn set_f32(&mut self, index: usize, value: f32) -> Result<&mut Self> {
        self.set(index, KernelParam::F32(value))
    }

    pub fn set_f64(&mut self, index: usize, value: f64) -> Result<&mut Self> {
        self.set(index, KernelParam::F64(value))
    }

    pub fn set_buffer(&mut self, index: usize, buffer: &DeviceBuffer) -> Result<&mut Self> {
        self.set(index, KernelParam::Buffer(buffer))
    }

    /// Explicitly pass the zero address in `index`.
    pub fn set_null(&mut self, index: usize) -> Result<&mut Self> {
        self.set(index, KernelParam::Null)
    }

    /// Marshaled words, or `InvalidArgument` naming the first unset slot.
    pub fn words(&self) -> Result<&[u64]> {
        if self.unset != 0 {
            let first = self.unset.trailing_zeros();
            return Err(Error::invalid_argument(format!(
                "parameter slot {first} was never set"
            )));
        }
        Ok(&self.words)
    }
}

impl Function {
    /// Launch this entry point with a loose parameter list.
    pub fn launch(
        &self,
        ctx: &Context,
        config: &LaunchConfig,
        stream: Option<&Stream>,
        params: &[KernelParam<'_>],
    ) -> Result<()> {
        let words: Vec<u64> = params
            .iter()
            .map(KernelParam::to_word)
            .collect::<Result<_>>()?;
        self.launch_words(ctx, config, stream, &words)
    }

    /// Launch this entry point with a pre-validated parameter set.
    pub fn launch_with_set(
        &self,
        ctx: &Context,
        config: &LaunchConfig,
        stream: Option<&Stream>,
        params: &LaunchParameterSet,
    ) -> Result<()> {
        // Completeness is checked before any native call.
        let words = params.words()?;
        self.launch_words(ctx, config, stream, words)
    }

    fn launch_words(
        &self,
        ctx: &Context,
        config: &LaunchConfig,
        stream: Option<&Stream>,
        words: &[u64],
    ) -> Result<()> {
        deny_callback_context("kernel launch")?;
        if config.grid.volume_is_zero() || config.block.volume_is_zero() {
            return Err(Error::invalid_argument(
                "grid and block dimensions must all be positive",
            ));
        }

        let stream_raw = match stream {
            Some(s) => s.raw()?,
            None => DEFAULT_STREAM,
        };

        debug!(
            function = %self.name(),
            device = self.device(),
            grid = ?config.grid,
            block = ?config.block,
            shared = config.shared_bytes,
            "Launching kernel"
        );

        ctx.runtime().launch_kernel(
            self.device(),
            self.raw(),
            config.grid.as_tuple(),
            config.block.as_tuple(),
            config.shared_bytes,
            stream_raw,
            words,
        )
    }
}
