//! # Device Lifecycle
//!
//! A [`Device`] aggregates everything shared by all clients of one Porthole
//! device: the mapped register block, the hardware lock serializing command
//! handshakes, the connection flag and the event registry. It is created by
//! [`Device::prepare_hardware`] from the resources the bus assigned and
//! handed to every client as an `Arc`.

use crate::client::{ClientContext, ClientId};
use crate::error::DriverError;
use crate::events::EventRegistry;
use crate::mem::PhysAddr;
use crate::protocol::{Protocol, ProtocolStats};
use crate::regs::{ControlFlags, Registers, REGISTER_BLOCK_SIZE};
use crate::sync::{HardwareLock, StrandedLock};
use crate::traits::Platform;
use crate::wait::WaitPolicy;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// Driver configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Command poll policy
    pub wait: WaitPolicy,
}

/// A hardware resource assigned to the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Memory-mapped range
    Memory {
        /// Physical base
        start: PhysAddr,
        /// Length in bytes
        len: u64,
    },
    /// Interrupt line or message
    Interrupt {
        /// Vector number
        vector: u32,
        /// Message-signaled (MSI) rather than line-based
        message_signaled: bool,
    },
}

/// The register block: the first memory range of exactly the block's size
fn register_resource(resources: &[Resource]) -> Option<(PhysAddr, u64)> {
    resources.iter().find_map(|resource| match *resource {
        Resource::Memory { start, len } if len == REGISTER_BLOCK_SIZE => Some((start, len)),
        _ => None,
    })
}

/// The first line-based interrupt
fn interrupt_resource(resources: &[Resource]) -> Option<u32> {
    resources.iter().find_map(|resource| match *resource {
        Resource::Interrupt { vector, message_signaled: false } => Some(vector),
        _ => None,
    })
}

struct HardwareState {
    policy: WaitPolicy,
    stats: ProtocolStats,
    /// A command outlived the wait deadline and may still be in flight
    wedged: bool,
}

/// One Porthole device
pub struct Device<P: Platform> {
    platform: P,
    regs: P::Registers,
    vector: u32,
    hardware: HardwareLock<HardwareState>,
    released: AtomicBool,
    pub(crate) connected: AtomicBool,
    events: EventRegistry<P::Event>,
    stranded: StrandedLock<Vec<P::PageLock>>,
}

impl<P: Platform> Device<P> {
    /// Bring up the device from its assigned resources
    ///
    /// Maps the register block, binds the line-based interrupt and enables
    /// interrupt delivery. Fails with `HardwareError` when either resource
    /// is missing; the register mapping is released in that case.
    pub fn prepare_hardware(
        platform: P,
        resources: &[Resource],
        config: DriverConfig,
    ) -> Result<Arc<Self>, DriverError> {
        let (base, len) = register_resource(resources).ok_or_else(|| {
            log::warn!("No {}-byte memory resource for the register block", REGISTER_BLOCK_SIZE);
            DriverError::HardwareError
        })?;

        let regs = platform.map_registers(base, len)?;

        let Some(vector) = interrupt_resource(resources) else {
            log::warn!("No line-based interrupt resource");
            drop(regs);
            return Err(DriverError::HardwareError);
        };

        let device = Arc::new(Self::new(platform, regs, vector, config));
        device.enable_interrupts();

        log::info!(
            "Porthole registers at {:#x}, vector {}, peer {}",
            base.as_u64(),
            vector,
            if device.is_connected() { "connected" } else { "absent" }
        );
        Ok(device)
    }

    /// Wrap an already mapped register block
    ///
    /// The connection flag starts from the control register's `NOCONN` bit.
    pub fn new(platform: P, regs: P::Registers, vector: u32, config: DriverConfig) -> Self {
        let connected = !regs.control().contains(ControlFlags::NOCONN);
        Self {
            platform,
            regs,
            vector,
            hardware: HardwareLock::new(
                HardwareState {
                    policy: config.wait,
                    stats: ProtocolStats::default(),
                    wedged: false,
                },
                "hardware",
            ),
            released: AtomicBool::new(false),
            connected: AtomicBool::new(connected),
            events: EventRegistry::new(),
            stranded: StrandedLock::new(Vec::new(), "stranded"),
        }
    }

    /// Tear down ahead of removal
    ///
    /// Disables interrupt delivery, releases every event registration and
    /// unpins stranded pages. Further protocol exchanges and registrations
    /// fail with `HardwareError`; the register mapping itself goes away with
    /// the last reference to the device.
    pub fn release_hardware(&self) {
        self.disable_interrupts();
        self.released.store(true, Ordering::Release);
        let dropped = self.events.close();
        let stranded = core::mem::take(&mut *self.stranded.lock());
        log::info!(
            "Porthole released ({} event registrations, {} stranded buffers dropped)",
            dropped,
            stranded.len()
        );
    }

    /// Whether a remote peer is attached, as of the last interrupt
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether [`Device::release_hardware`] has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether a timed-out command is still holding the register block
    pub fn is_wedged(&self) -> bool {
        self.hardware.lock().wedged
    }

    /// Number of page locks parked until the hardware is released
    pub fn stranded_count(&self) -> usize {
        self.stranded.lock().len()
    }

    /// Snapshot of the protocol counters
    pub fn stats(&self) -> ProtocolStats {
        self.hardware.lock().stats
    }

    /// Number of event registrations across all clients
    pub fn registration_count(&self) -> usize {
        self.events.len()
    }

    /// Interrupt vector bound at prepare time
    pub fn vector(&self) -> u32 {
        self.vector
    }

    /// The host platform
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The mapped register block
    pub fn registers(&self) -> &P::Registers {
        &self.regs
    }

    /// Open a new client context
    pub fn open_client(self: &Arc<Self>) -> ClientContext<P> {
        let client = ClientContext::new(self.clone());
        log::debug!("Client {} opened", client.id());
        client
    }

    /// Run one protocol exchange under the hardware lock
    ///
    /// An exchange that leaves a command bit set (a software deadline
    /// expired) wedges the device: later exchanges fail with `Timeout`
    /// without touching the registers until the device clears the bit.
    pub(crate) fn with_protocol<T, F>(&self, exchange: F) -> Result<T, DriverError>
    where
        F: FnOnce(&mut Protocol<'_, P::Registers, P>) -> Result<T, DriverError>,
    {
        let mut hardware = self.hardware.lock();
        if self.is_released() {
            return Err(DriverError::HardwareError);
        }

        let HardwareState { policy, stats, wedged } = &mut *hardware;
        if *wedged {
            if self.regs.control().intersects(ControlFlags::COMMANDS) {
                log::debug!("Register block still busy, exchange refused");
                return Err(DriverError::Timeout);
            }
            *wedged = false;
            log::info!("Stuck command cleared, register block usable again");
        }

        let mut protocol = Protocol::new(&self.regs, &self.platform, *policy, stats);
        let result = exchange(&mut protocol);
        if protocol.busy() {
            *wedged = true;
            log::warn!("Command still in flight after the wait deadline, device wedged");
        }
        result
    }

    /// Keep `pages` pinned until the hardware is released
    ///
    /// For buffers the device may still reference after a timed-out
    /// exchange. Called without the hardware lock held.
    pub(crate) fn strand(&self, pages: P::PageLock) {
        if self.is_released() {
            return;
        }
        let mut stranded = self.stranded.lock();
        stranded.push(pages);
        log::warn!("{} buffers stranded on a wedged device", stranded.len());
    }

    /// Run `f` under the hardware lock, against the raw register block
    pub(crate) fn with_registers<T>(&self, f: impl FnOnce(&P::Registers) -> T) -> T {
        let _hardware = self.hardware.lock();
        f(&self.regs)
    }

    /// Fails with `HardwareError` once the hardware has been released
    pub(crate) fn register_events(
        &self,
        owner: ClientId,
        connect: Option<P::Event>,
        disconnect: Option<P::Event>,
    ) -> Result<(), DriverError> {
        self.events.register(owner, connect, disconnect, &self.connected)
    }

    pub(crate) fn remove_registrations(&self, owner: ClientId) -> usize {
        self.events.remove_owner(owner)
    }

    pub(crate) fn events(&self) -> &EventRegistry<P::Event> {
        &self.events
    }
}
