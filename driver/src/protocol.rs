//! Register protocol engine
//!
//! Drives the command handshakes of the register block: a message is a
//! `START`, one `ADD_SEGMENT` per physically contiguous run and a closing
//! `FINISH`; a mapping is dropped with `UNMAP`. Every command is acknowledged
//! by the device clearing its bit, after which the status bits say how it
//! ended.
//!
//! The engine borrows the register block for the duration of one exchange.
//! Callers must hold the hardware lock while a [`Protocol`] exists, as the
//! register block has a single command in flight at a time.

use crate::error::DriverError;
use crate::mem::PhysAddr;
use crate::regs::{full_barrier, write_barrier, ControlFlags, Registers};
use crate::traits::Scheduler;
use crate::wait::WaitPolicy;
use core::fmt;

/// One physically contiguous run of pages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Physical base address
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
}

impl Segment {
    /// Create a segment
    pub const fn new(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len }
    }

    /// First physical address past the segment
    pub const fn end(&self) -> u64 {
        self.addr.as_u64() + self.len as u64
    }
}

/// Device-assigned mapping identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl MapId {
    /// Raw identifier
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Protocol counters, kept under the hardware lock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    /// Messages the device accepted
    pub messages: u64,
    /// Segments streamed, including those of failed messages
    pub segments: u64,
    /// Successful unmaps
    pub unmaps: u64,
    /// Exchanges that ended in an error
    pub failures: u64,
}

/// Translate the status bits of `cr` into an error
///
/// `NOCONN` is checked first: a disconnect invalidates every mapping, so it
/// supersedes whatever else the device reported.
pub fn status_error(cr: ControlFlags) -> Option<DriverError> {
    const ORDER: [(ControlFlags, DriverError); 5] = [
        (ControlFlags::NOCONN, DriverError::NotConnected),
        (ControlFlags::TIMEOUT, DriverError::Timeout),
        (ControlFlags::BADADDR, DriverError::BadAddress),
        (ControlFlags::NORES, DriverError::ResourceExhausted),
        (ControlFlags::DEVERR, DriverError::DeviceError),
    ];

    ORDER
        .iter()
        .find(|(bit, _)| cr.contains(*bit))
        .map(|&(_, err)| err)
}

/// One exchange with the register block
pub struct Protocol<'a, R: ?Sized, S: ?Sized> {
    regs: &'a R,
    sched: &'a S,
    policy: WaitPolicy,
    stats: &'a mut ProtocolStats,
}

impl<'a, R, S> Protocol<'a, R, S>
where
    R: Registers + ?Sized,
    S: Scheduler + ?Sized,
{
    /// Borrow the register block for one exchange
    pub fn new(regs: &'a R, sched: &'a S, policy: WaitPolicy, stats: &'a mut ProtocolStats) -> Self {
        Self { regs, sched, policy, stats }
    }

    /// Wait for every command trigger to read back clear
    ///
    /// Operands are only written to an idle register block.
    fn idle(&self) -> Result<(), DriverError> {
        self.policy
            .wait_until(self.sched, || !self.regs.control().intersects(ControlFlags::COMMANDS))
    }

    /// Whether a command is still in flight
    pub fn busy(&self) -> bool {
        self.regs.control().intersects(ControlFlags::COMMANDS)
    }

    /// Wait for `command` to read back clear, then check the status bits
    fn complete(&self, command: ControlFlags) -> Result<(), DriverError> {
        self.policy
            .wait_until(self.sched, || !self.regs.control().contains(command))?;

        match status_error(self.regs.control()) {
            Some(err) => {
                log::trace!("{:?} failed: {}", command, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Write `command` and wait for the device to service it
    fn issue(&self, command: ControlFlags) -> Result<(), DriverError> {
        write_barrier();
        self.regs.set_control(command);
        full_barrier();
        self.complete(command)
    }

    /// Hand one segment to the device
    ///
    /// Waits for the previous `ADD_SEGMENT` (if any) before overwriting the
    /// operands, so the device is never handed a half-written segment. The
    /// command just issued is left in flight.
    fn add_segment(&mut self, segment: Segment) -> Result<(), DriverError> {
        self.complete(ControlFlags::ADD_SEGMENT)?;

        log::trace!("segment {:#x}+{:#x}", segment.addr.as_u64(), segment.len);
        self.regs.write_addr(segment.addr.as_u64());
        self.regs.write_size(segment.len);
        write_barrier();
        self.regs.set_control(ControlFlags::ADD_SEGMENT);
        full_barrier();
        self.stats.segments += 1;
        Ok(())
    }

    fn stream<I>(&mut self, msg_type: u32, segments: I) -> Result<MapId, DriverError>
    where
        I: Iterator<Item = Segment>,
    {
        let mut segments = segments.peekable();
        if segments.peek().is_none() {
            return Err(DriverError::InvalidArgument);
        }

        self.idle()?;
        self.issue(ControlFlags::START)?;

        for segment in segments {
            self.add_segment(segment)?;
        }
        self.complete(ControlFlags::ADD_SEGMENT)?;

        self.regs.write_type(msg_type);
        self.issue(ControlFlags::FINISH)?;

        Ok(MapId(self.regs.read_addr() as u32))
    }

    /// Describe a buffer to the device and return the mapping id it assigns
    ///
    /// Segments are pulled from `segments` one at a time and sent as they
    /// arrive; a failure aborts the message without consuming the rest. An
    /// empty stream is rejected before `START` is written.
    pub fn send_message<I>(&mut self, msg_type: u32, segments: I) -> Result<MapId, DriverError>
    where
        I: IntoIterator<Item = Segment>,
    {
        let result = self.stream(msg_type, segments.into_iter());
        match result {
            Ok(id) => {
                self.stats.messages += 1;
                log::debug!("Message type {} mapped as {}", msg_type, id);
            }
            Err(err) => {
                self.stats.failures += 1;
                log::warn!("Message type {} rejected: {}", msg_type, err);
            }
        }
        result
    }

    /// Ask the device to drop mapping `id`
    pub fn unmap(&mut self, id: MapId) -> Result<(), DriverError> {
        let result = self.idle().and_then(|()| {
            self.regs.write_addr(id.as_u32() as u64);
            self.issue(ControlFlags::UNMAP)
        });
        match result {
            Ok(()) => {
                self.stats.unmaps += 1;
                log::debug!("Unmapped {}", id);
            }
            Err(err) => {
                self.stats.failures += 1;
                log::warn!("Unmap of {} failed: {}", id, err);
            }
        }
        result
    }
}
