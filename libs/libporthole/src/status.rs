//! Request completion codes

use core::fmt;

/// Completion status of a Porthole request
///
/// Negative values are errors; `Success` is the only non-negative code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Request completed
    Success = 0,
    /// Bad size, address or buffer length
    InvalidArgument = -1,
    /// Slot table full or descriptor allocation failed
    ResourceExhausted = -2,
    /// The buffer could not be pinned
    AccessViolation = -3,
    /// No remote peer is attached
    NotConnected = -4,
    /// Device reported a timeout
    Timeout = -5,
    /// Device rejected an address
    BadAddress = -6,
    /// Device reported an internal error
    DeviceError = -7,
    /// A wait handle could not be resolved
    InvalidHandle = -8,
    /// No mapping matches the request
    NotFound = -9,
    /// Unknown control code
    InvalidRequest = -10,
    /// Register block or interrupt missing
    HardwareError = -11,
}

impl Status {
    /// Convert a raw completion value
    ///
    /// Returns `None` for values no status is assigned to.
    pub fn from_raw(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            -1 => Self::InvalidArgument,
            -2 => Self::ResourceExhausted,
            -3 => Self::AccessViolation,
            -4 => Self::NotConnected,
            -5 => Self::Timeout,
            -6 => Self::BadAddress,
            -7 => Self::DeviceError,
            -8 => Self::InvalidHandle,
            -9 => Self::NotFound,
            -10 => Self::InvalidRequest,
            -11 => Self::HardwareError,
            _ => return None,
        })
    }

    /// `Ok` for `Success`, the status itself otherwise
    pub fn into_result(self) -> Result<(), Self> {
        match self {
            Self::Success => Ok(()),
            status => Err(status),
        }
    }

    /// Raw completion value
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether this is the success code
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Success => "success",
            Self::InvalidArgument => "invalid argument",
            Self::ResourceExhausted => "insufficient resources",
            Self::AccessViolation => "access violation",
            Self::NotConnected => "device not connected",
            Self::Timeout => "device timeout",
            Self::BadAddress => "invalid address",
            Self::DeviceError => "device error",
            Self::InvalidHandle => "invalid handle",
            Self::NotFound => "mapping not found",
            Self::InvalidRequest => "invalid device request",
            Self::HardwareError => "device hardware error",
        };
        f.write_str(msg)
    }
}
