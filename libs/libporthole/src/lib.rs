//! # libporthole - Porthole Client ABI
//!
//! Fixed-size request/response records and control codes exchanged between
//! user-mode clients and the Porthole driver.
//!
//! ## Operations
//!
//! - **SEND_MESSAGE** - pin a buffer, describe it to the device, get a mapping id
//! - **UNLOCK_BUFFER** - unmap a previously sent buffer by mapping id
//! - **REGISTER_EVENTS** - hand the driver connect/disconnect wait handles
//!
//! ## Example
//!
//! ```
//! use libporthole::{PortholeMsg, IOCTL_PORTHOLE_SEND_MSG};
//!
//! let msg = PortholeMsg { msg_type: 1, addr: 0x7000_1000, size: 16392 };
//! let bytes = msg.to_bytes();
//! assert_eq!(PortholeMsg::from_bytes(&bytes), Some(msg));
//! assert_eq!(IOCTL_PORTHOLE_SEND_MSG, 0x0022_2000);
//! ```

#![no_std]

pub mod ioctl;
pub mod status;

pub use ioctl::{
    ctl_code, map_id_from_bytes, PortholeEvents, PortholeMapId, PortholeMsg,
    IOCTL_PORTHOLE_REGISTER_EVENTS, IOCTL_PORTHOLE_SEND_MSG, IOCTL_PORTHOLE_UNLOCK_BUFFER,
    MAP_ID_SIZE, NO_HANDLE,
};
pub use status::Status;

/// Device interface class identifier `{10ccc0ac-f4b0-4d78-ba41-1ebb385a5285}`
///
/// Stored in the mixed-endian layout used by device-interface GUIDs.
pub const GUID_DEVINTERFACE_PORTHOLE: [u8; 16] = [
    0xac, 0xc0, 0xcc, 0x10, 0xb0, 0xf4, 0x78, 0x4d, 0xba, 0x41, 0x1e, 0xbb, 0x38, 0x5a, 0x52, 0x85,
];

/// Maximum number of buffers a single client may keep mapped at once
pub const MAX_MAPPINGS: usize = 32;
