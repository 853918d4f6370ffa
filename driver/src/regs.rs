//! Porthole register block
//!
//! Typed view over the device's memory-mapped registers. Command bits in
//! `cr` are set by software and cleared by the device when the command has
//! been serviced; status bits are set by the device and describe how the
//! last command ended.

use alloc::sync::Arc;
use core::ptr::{addr_of, addr_of_mut, NonNull};
use core::sync::atomic::{fence, AtomicU32, Ordering};

/// Size of the register block in bytes
pub const REGISTER_BLOCK_SIZE: u64 = 0x20;

/// Register offsets
pub mod offsets {
    /// Control/status register
    pub const CR: usize = 0x00;
    /// Latched interrupt status
    pub const ISR: usize = 0x04;
    /// 64-bit physical address / mapping id
    pub const ADDR: usize = 0x08;
    /// Segment length
    pub const SIZE: usize = 0x10;
    /// Message type tag
    pub const TYPE: usize = 0x14;
}

/// Hardware register layout
#[repr(C)]
pub struct RegisterBlock {
    /// Control/status register
    pub cr: u32,
    /// Latched interrupt status, write-1-to-clear
    pub isr: u32,
    /// Segment base address on ADD_SEGMENT, mapping id after FINISH, unmap id on UNMAP
    pub addr: u64,
    /// Segment length
    pub size: u32,
    /// Message type tag
    pub msg_type: u32,
    _reserved: [u32; 2],
}

const _: () = assert!(core::mem::size_of::<RegisterBlock>() == REGISTER_BLOCK_SIZE as usize);

bitflags::bitflags! {
    /// Control register bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        /// Interrupt enable (software-owned)
        const IRQ = 1 << 0;
        /// Begin a new message
        const START = 1 << 1;
        /// Append the segment in `addr`/`size`
        const ADD_SEGMENT = 1 << 2;
        /// Complete the message with the tag in `type`
        const FINISH = 1 << 3;
        /// Device timed out servicing the command
        const TIMEOUT = 1 << 4;
        /// Device rejected an address
        const BADADDR = 1 << 5;
        /// No remote peer attached
        const NOCONN = 1 << 6;
        /// Device out of resources
        const NORES = 1 << 7;
        /// Device internal error
        const DEVERR = 1 << 8;
        /// Release the mapping whose id is in `addr`
        const UNMAP = 1 << 9;

        /// Command triggers (software sets, hardware clears)
        const COMMANDS = Self::START.bits()
            | Self::ADD_SEGMENT.bits()
            | Self::FINISH.bits()
            | Self::UNMAP.bits();
        /// Terminal status (hardware sets)
        const STATUS = Self::TIMEOUT.bits()
            | Self::BADADDR.bits()
            | Self::NOCONN.bits()
            | Self::NORES.bits()
            | Self::DEVERR.bits();
    }
}

bitflags::bitflags! {
    /// Interrupt status bits latched in `isr`
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        /// A peer attached
        const CONNECT = 1 << 0;
        /// The peer detached
        const DISCONNECT = 1 << 1;
    }
}

/// Access to a Porthole register block
///
/// All accessors take `&self`: the block is shared between the protocol
/// engine (under the hardware lock) and the interrupt path, which only
/// reads `cr` and claims `isr`.
pub trait Registers: Send + Sync {
    /// Read the control register
    fn control(&self) -> ControlFlags;

    /// Set bits in the control register (read-modify-write)
    fn set_control(&self, bits: ControlFlags);

    /// Clear bits in the control register (read-modify-write)
    fn clear_control(&self, bits: ControlFlags);

    /// Write the address register
    fn write_addr(&self, value: u64);

    /// Read the address register
    fn read_addr(&self) -> u64;

    /// Write the size register
    fn write_size(&self, value: u32);

    /// Write the type register
    fn write_type(&self, value: u32);

    /// Read the latched interrupt status without clearing it
    fn interrupt_status(&self) -> InterruptStatus;

    /// Atomically claim and clear every latched interrupt bit
    ///
    /// Writes all-ones (write-1-to-clear) and returns the value that was
    /// latched, so an event arriving between read and clear is never lost.
    fn claim_interrupts(&self) -> InterruptStatus;
}

impl<R: Registers + ?Sized> Registers for Arc<R> {
    fn control(&self) -> ControlFlags {
        (**self).control()
    }

    fn set_control(&self, bits: ControlFlags) {
        (**self).set_control(bits)
    }

    fn clear_control(&self, bits: ControlFlags) {
        (**self).clear_control(bits)
    }

    fn write_addr(&self, value: u64) {
        (**self).write_addr(value)
    }

    fn read_addr(&self) -> u64 {
        (**self).read_addr()
    }

    fn write_size(&self, value: u32) {
        (**self).write_size(value)
    }

    fn write_type(&self, value: u32) {
        (**self).write_type(value)
    }

    fn interrupt_status(&self) -> InterruptStatus {
        (**self).interrupt_status()
    }

    fn claim_interrupts(&self) -> InterruptStatus {
        (**self).claim_interrupts()
    }
}

/// Order operand writes before the command trigger that consumes them
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Order a command trigger before the polls that observe its completion
#[inline]
pub fn full_barrier() {
    fence(Ordering::SeqCst);
}

/// Volatile accessor over a mapped register block
pub struct MmioRegisters {
    base: NonNull<RegisterBlock>,
}

// SAFETY: the block is device memory; every access is volatile or atomic and
// command sequencing is serialized by the device's hardware lock.
unsafe impl Send for MmioRegisters {}
// SAFETY: see above
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap a mapped register block
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped, uncached Porthole register block of at
    /// least [`REGISTER_BLOCK_SIZE`] bytes that stays mapped for the lifetime
    /// of the returned value.
    pub unsafe fn new(base: *mut RegisterBlock) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base })
    }

    /// Base of the mapping
    pub fn base(&self) -> *mut RegisterBlock {
        self.base.as_ptr()
    }

    fn cr(&self) -> *mut u32 {
        // SAFETY: base is a valid register block per `new`
        unsafe { addr_of_mut!((*self.base.as_ptr()).cr) }
    }

    fn isr(&self) -> &AtomicU32 {
        // SAFETY: AtomicU32 has the layout of u32 and the field is aligned
        unsafe { &*(addr_of!((*self.base.as_ptr()).isr) as *const AtomicU32) }
    }
}

impl Registers for MmioRegisters {
    fn control(&self) -> ControlFlags {
        // SAFETY: valid mapped register
        ControlFlags::from_bits_retain(unsafe { self.cr().read_volatile() })
    }

    fn set_control(&self, bits: ControlFlags) {
        let value = self.control() | bits;
        // SAFETY: valid mapped register
        unsafe { self.cr().write_volatile(value.bits()) }
    }

    fn clear_control(&self, bits: ControlFlags) {
        let value = self.control() & !bits;
        // SAFETY: valid mapped register
        unsafe { self.cr().write_volatile(value.bits()) }
    }

    fn write_addr(&self, value: u64) {
        // SAFETY: valid mapped register
        unsafe { addr_of_mut!((*self.base.as_ptr()).addr).write_volatile(value) }
    }

    fn read_addr(&self) -> u64 {
        // SAFETY: valid mapped register
        unsafe { addr_of!((*self.base.as_ptr()).addr).read_volatile() }
    }

    fn write_size(&self, value: u32) {
        // SAFETY: valid mapped register
        unsafe { addr_of_mut!((*self.base.as_ptr()).size).write_volatile(value) }
    }

    fn write_type(&self, value: u32) {
        // SAFETY: valid mapped register
        unsafe { addr_of_mut!((*self.base.as_ptr()).msg_type).write_volatile(value) }
    }

    fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.isr().load(Ordering::SeqCst))
    }

    fn claim_interrupts(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.isr().swap(u32::MAX, Ordering::SeqCst))
    }
}
