//! # Porthole
//!
//! Driver core for the Porthole paravirtual shared-memory device.
//!
//! A client hands the driver an arbitrary virtual buffer; the driver pins
//! the backing pages, streams them to the device as a coalesced list of
//! physically contiguous segments, and hands back the mapping identifier the
//! device assigned. Connect/disconnect transitions of the remote peer are
//! fanned out to client-registered wait handles from the interrupt path.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  dispatch (control codes)  ──►  ClientContext            │
//! │                                  │  MappingTable (32)    │
//! ├──────────────────────────────────┼───────────────────────┤
//! │  Device                          ▼                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐ │
//! │  │ pin/coalesce │──►│   Protocol   │   │ EventRegistry │ │
//! │  └──────────────┘   └──────┬───────┘   └───────▲───────┘ │
//! │                            │ lock (a)          │ lock (b)│
//! │                     ┌──────▼───────┐   ┌───────┴───────┐ │
//! │                     │  Registers   │◄──│ top/bottom IRQ│ │
//! │                     └──────────────┘   └───────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Hierarchy
//!
//! 1. Hardware lock (protocol handshakes, register block commands)
//! 2. Per-client mapping table
//! 3. Event registration list (also taken by the bottom half)
//! 4. Stranded page locks (pages a wedged device may still reference)
//!
//! The event lock is never held while the hardware lock is acquired.
//! Nothing allocates while the hardware lock is held.
//!
//! Everything the driver needs from the host kernel (page pinning, handle
//! resolution, delays, deferred work, register mapping) comes through the
//! [`traits::Platform`] trait, so the whole crate runs under host tests.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod client;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod mem;
pub mod pin;
pub mod protocol;
pub mod regs;
pub mod sync;
pub mod table;
pub mod traits;
pub mod wait;

pub use client::{ClientContext, ClientId};
pub use device::{Device, DriverConfig, Resource};
pub use dispatch::{dispatch, Completion};
pub use error::DriverError;
pub use mem::{PhysAddr, UserBuffer, VirtAddr, PAGE_SIZE};
pub use protocol::{MapId, ProtocolStats, Segment};
pub use regs::{ControlFlags, InterruptStatus, Registers};
pub use traits::{PageLock, Platform, Scheduler, WaitEvent};
pub use wait::WaitPolicy;

/// Driver version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
