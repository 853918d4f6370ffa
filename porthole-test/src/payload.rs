//! Setup message sent to the peer
//!
//! A packed little-endian header (`version`, `main_ring_size`) followed by
//! the ring itself, filled with a repeating text.

/// Protocol version announced in the setup header
pub const SETUP_VERSION: u32 = 0x0100;

/// Size of the packed header
pub const HEADER_SIZE: usize = 8;

/// The initial setup message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSetup {
    /// Header version
    pub version: u32,
    /// Ring contents
    pub ring: Vec<u8>,
}

impl MsgSetup {
    /// A setup message whose ring repeats `text`, each copy NUL-terminated
    pub fn new(ring_size: u32, text: &str) -> Self {
        let mut pattern = text.as_bytes().to_vec();
        pattern.push(0);

        let ring = pattern.iter().copied().cycle().take(ring_size as usize).collect();
        Self { version: SETUP_VERSION, ring }
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.ring.len()
    }

    /// Encode header and ring
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.ring.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.ring);
        out
    }
}
