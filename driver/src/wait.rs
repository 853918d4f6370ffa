//! Busy-wait policy for device commands
//!
//! The device may need real wall-clock time to service a command, so polls
//! sleep for a short fixed interval between checks instead of spinning.

use crate::error::DriverError;
use crate::traits::Scheduler;
use core::time::Duration;

/// Default delay between polls of the control register
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_nanos(100);

/// How long and how often to poll for command completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Delay between checks
    pub interval: Duration,
    /// Give up after this long; `None` relies solely on the device's own
    /// `TIMEOUT` status bit
    pub deadline: Option<Duration>,
}

impl WaitPolicy {
    /// Poll forever at the given interval
    pub const fn unbounded(interval: Duration) -> Self {
        Self { interval, deadline: None }
    }

    /// Poll at the given interval, failing with `Timeout` after `deadline`
    pub const fn bounded(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline: Some(deadline) }
    }

    /// Poll until `done` returns true
    pub fn wait_until<S, F>(&self, sched: &S, mut done: F) -> Result<(), DriverError>
    where
        S: Scheduler + ?Sized,
        F: FnMut() -> bool,
    {
        let limit = self
            .deadline
            .map(|deadline| (sched.now_ns(), deadline.as_nanos() as u64));

        while !done() {
            if let Some((start, limit_ns)) = limit {
                if sched.now_ns().saturating_sub(start) >= limit_ns {
                    log::warn!("Device command exceeded wait deadline of {}ns", limit_ns);
                    return Err(DriverError::Timeout);
                }
            }
            sched.delay(self.interval);
        }

        Ok(())
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_POLL_INTERVAL)
    }
}
