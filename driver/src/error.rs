//! Driver error taxonomy

use core::fmt;
use libporthole::Status;

/// Errors produced by driver operations
///
/// Hardware-reported conditions (`NotConnected`, `Timeout`, `BadAddress`,
/// `DeviceError`, and `ResourceExhausted` for `NORES`) come from the control
/// register status bits; the rest are raised by the driver itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverError {
    /// Bad size, address or buffer length
    InvalidArgument,
    /// Slot table full, descriptor allocation failed, or device out of resources
    ResourceExhausted,
    /// Page pinning rejected by the memory manager
    AccessViolation,
    /// Device reports no peer attached
    NotConnected,
    /// Command timed out (device-reported or wait deadline)
    Timeout,
    /// Device rejected an address
    BadAddress,
    /// Device reported an internal error
    DeviceError,
    /// A wait handle could not be resolved
    InvalidHandle,
    /// No mapping matches the request
    NotFound,
    /// Unknown control code
    InvalidRequest,
    /// Register block or interrupt resource missing
    HardwareError,
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::InvalidArgument => Status::InvalidArgument,
            DriverError::ResourceExhausted => Status::ResourceExhausted,
            DriverError::AccessViolation => Status::AccessViolation,
            DriverError::NotConnected => Status::NotConnected,
            DriverError::Timeout => Status::Timeout,
            DriverError::BadAddress => Status::BadAddress,
            DriverError::DeviceError => Status::DeviceError,
            DriverError::InvalidHandle => Status::InvalidHandle,
            DriverError::NotFound => Status::NotFound,
            DriverError::InvalidRequest => Status::InvalidRequest,
            DriverError::HardwareError => Status::HardwareError,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Status::from(*self), f)
    }
}
