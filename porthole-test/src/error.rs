//! Reference client errors

use libporthole::Status;
use porthole::DriverError;
use thiserror::Error;

/// Errors raised while running the reference sequence
#[derive(Debug, Error)]
pub enum ClientError {
    /// The simulated device could not be brought up
    #[error("device setup failed: {0}")]
    Setup(DriverError),

    /// A control request completed with an error status
    #[error("{operation} failed: {status}")]
    Request {
        /// Request that failed
        operation: &'static str,
        /// Completion status
        status: Status,
    },

    /// A notification never arrived
    #[error("timed out waiting for {0} event")]
    EventTimeout(&'static str),

    /// The payload does not fit a request
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}
