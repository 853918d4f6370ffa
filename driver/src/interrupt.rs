//! Interrupt handling
//!
//! The top half runs at device interrupt level and only checks whether the
//! device latched anything, queueing the deferred half if so. The deferred
//! half claims the latched bits in one atomic exchange, recomputes the peer
//! state and signals registered wait objects.

use crate::device::Device;
use crate::regs::{ControlFlags, Registers};
use crate::traits::Platform;

impl<P: Platform> Device<P> {
    /// Top half
    ///
    /// Returns whether the interrupt was raised by this device. Nothing is
    /// cleared here; the deferred half claims the status.
    pub fn interrupt_service(&self) -> bool {
        if self.registers().interrupt_status().is_empty() {
            return false;
        }

        self.platform().queue_deferred();
        true
    }

    /// Deferred half
    pub fn deferred_service(&self) {
        let claimed = self.registers().claim_interrupts();
        if claimed.is_empty() {
            log::trace!("Spurious interrupt on vector {}", self.vector());
            return;
        }

        let attached = !self.registers().control().contains(ControlFlags::NOCONN);
        log::debug!("Interrupt {:?}, peer {}", claimed, if attached { "attached" } else { "detached" });

        self.events().dispatch(claimed, &self.connected, attached);
    }

    /// Let the device raise interrupts
    pub fn enable_interrupts(&self) {
        self.with_registers(|regs| regs.set_control(ControlFlags::IRQ));
    }

    /// Stop the device raising interrupts
    pub fn disable_interrupts(&self) {
        self.with_registers(|regs| regs.clear_control(ControlFlags::IRQ));
    }
}
