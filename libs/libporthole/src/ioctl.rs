//! Control codes and request records
//!
//! All records are encoded little-endian with natural C alignment, so the
//! byte layout matches what a C client passes through `DeviceIoControl`.

/// Device type for vendor-defined devices
pub const FILE_DEVICE_UNKNOWN: u32 = 0x22;

/// Buffered transfer method
pub const METHOD_BUFFERED: u32 = 0;

/// No access check beyond opening the device
pub const FILE_ANY_ACCESS: u32 = 0;

/// Pack a control code from its components
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Send a message describing a user buffer
pub const IOCTL_PORTHOLE_SEND_MSG: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x800, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Unmap and unlock a previously sent buffer
pub const IOCTL_PORTHOLE_UNLOCK_BUFFER: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x801, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Register connect/disconnect wait handles
pub const IOCTL_PORTHOLE_REGISTER_EVENTS: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x802, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Handle value meaning "not requested"
pub const NO_HANDLE: u64 = u64::MAX;

/// Device-assigned mapping identifier
pub type PortholeMapId = u32;

/// Size of an encoded [`PortholeMapId`]
pub const MAP_ID_SIZE: usize = core::mem::size_of::<PortholeMapId>();

/// SEND_MESSAGE request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PortholeMsg {
    /// Message type tag forwarded to the device
    pub msg_type: u32,
    /// User virtual address of the buffer
    pub addr: u64,
    /// Buffer length in bytes
    pub size: u32,
}

impl PortholeMsg {
    /// Encoded size in bytes
    pub const SIZE: usize = 24;

    /// Decode from an exactly-sized buffer
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            msg_type: read_u32(bytes, 0),
            addr: read_u64(bytes, 8),
            size: read_u32(bytes, 16),
        })
    }

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        out[8..16].copy_from_slice(&self.addr.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// REGISTER_EVENTS request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PortholeEvents {
    /// Handle signaled on connect, or [`NO_HANDLE`]
    pub connect: u64,
    /// Handle signaled on disconnect, or [`NO_HANDLE`]
    pub disconnect: u64,
}

impl PortholeEvents {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Decode from an exactly-sized buffer
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            connect: read_u64(bytes, 0),
            disconnect: read_u64(bytes, 8),
        })
    }

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.connect.to_le_bytes());
        out[8..16].copy_from_slice(&self.disconnect.to_le_bytes());
        out
    }

    /// Connect handle, if one was supplied
    pub fn connect_handle(&self) -> Option<u64> {
        (self.connect != NO_HANDLE).then_some(self.connect)
    }

    /// Disconnect handle, if one was supplied
    pub fn disconnect_handle(&self) -> Option<u64> {
        (self.disconnect != NO_HANDLE).then_some(self.disconnect)
    }
}

/// Decode a mapping id from an exactly-sized buffer
pub fn map_id_from_bytes(bytes: &[u8]) -> Option<PortholeMapId> {
    if bytes.len() != MAP_ID_SIZE {
        return None;
    }
    Some(read_u32(bytes, 0))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
