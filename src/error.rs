//! Fault taxonomy for the host-side control layer.
//!
//! Every native runtime failure is surfaced as [`Error::Native`] carrying the
//! raw status code and a message resolved from it; raw codes never drive
//! control flow in callers. Argument and bound violations are raised before
//! any native call is issued.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller-supplied value (negative length, `from > to`, out-of-range
    /// option value, unset launch parameter slot).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Bound violation against a buffer's declared length.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    /// Use of a released or never-materialized handle.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Authorization failure, or a device operation attempted from inside a
    /// runtime-managed completion callback.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Uniform wrapper for every native runtime failure.
    #[error("native fault {code}: {message}")]
    Native { code: i32, message: String },

    /// Host-side I/O failure while staging an indirect transfer.
    #[error("host i/o error: {0}")]
    HostIo(#[from] std::io::Error),
}

impl Error {
    /// Wrap a native status, resolving its message from the status table.
    pub fn native(status: Status) -> Self {
        Error::Native {
            code: status as i32,
            message: status.describe().to_string(),
        }
    }

    /// Wrap a raw native code the status table may not know about.
    pub fn native_code(code: i32) -> Self {
        Error::Native {
            code,
            message: Status::from_code(code).describe().to_string(),
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn out_of_range(msg: impl Into<String>) -> Self {
        Error::IndexOutOfRange(msg.into())
    }
}

/// Native runtime status codes.
///
/// A stable enumeration shared with the vendor runtime; `Success` is never
/// wrapped in an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    InvalidValue = 1,
    OutOfMemory = 2,
    NotInitialized = 3,
    Deinitialized = 4,
    NoDevice = 100,
    InvalidDevice = 101,
    InvalidImage = 200,
    InvalidHandle = 400,
    NotFound = 500,
    NotReady = 600,
    IllegalAddress = 700,
    LaunchFailed = 719,
    NotPermitted = 800,
    NotSupported = 801,
    DeviceUnavailable = 802,
    Unknown = 999,
}

impl Status {
    /// Map a raw code back onto the enumeration, folding unrecognized codes
    /// into `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Success,
            1 => Status::InvalidValue,
            2 => Status::OutOfMemory,
            3 => Status::NotInitialized,
            4 => Status::Deinitialized,
            100 => Status::NoDevice,
            101 => Status::InvalidDevice,
            200 => Status::InvalidImage,
            400 => Status::InvalidHandle,
            500 => Status::NotFound,
            600 => Status::NotReady,
            700 => Status::IllegalAddress,
            719 => Status::LaunchFailed,
            800 => Status::NotPermitted,
            801 => Status::NotSupported,
            802 => Status::DeviceUnavailable,
            _ => Status::Unknown,
        }
    }

    /// Human-readable description, resolved on demand.
    pub fn describe(self) -> &'static str {
        match self {
            Status::Success => "no error",
            Status::InvalidValue => "invalid value",
            Status::OutOfMemory => "out of memory",
            Status::NotInitialized => "runtime not initialized",
            Status::Deinitialized => "runtime shutting down",
            Status::NoDevice => "no device available",
            Status::InvalidDevice => "invalid device ordinal",
            Status::InvalidImage => "invalid code image",
            Status::InvalidHandle => "invalid resource handle",
            Status::NotFound => "named symbol not found",
            Status::NotReady => "operation not ready",
            Status::IllegalAddress => "illegal device address",
            Status::LaunchFailed => "kernel launch failed",
            Status::NotPermitted => "operation not permitted",
            Status::NotSupported => "operation not supported",
            Status::DeviceUnavailable => "device unavailable",
            Status::Unknown => "unknown error",
        }
    }
}
