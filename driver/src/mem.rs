//! Address types and user buffer validation

use crate::error::DriverError;

/// Page size of the host
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Physical address type
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Create a new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Physical address of the start of a page frame
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Virtual address type
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Create a new virtual address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Byte offset within the page
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Virtual page number
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

/// A user-supplied buffer, validated but not yet pinned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserBuffer {
    addr: VirtAddr,
    len: u32,
}

impl UserBuffer {
    /// Validate a user buffer
    ///
    /// Null addresses, zero lengths and ranges that wrap the address space are
    /// rejected before any pinning is attempted.
    pub fn new(addr: VirtAddr, len: u32) -> Result<Self, DriverError> {
        if addr.as_u64() == 0 || len == 0 {
            return Err(DriverError::InvalidArgument);
        }

        addr.as_u64()
            .checked_add(len as u64)
            .ok_or(DriverError::InvalidArgument)?;

        Ok(Self { addr, len })
    }

    /// Start address
    pub const fn addr(&self) -> VirtAddr {
        self.addr
    }

    /// Length in bytes
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Always false; zero-length buffers cannot be constructed
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages the buffer touches
    pub const fn page_span(&self) -> u64 {
        (self.addr.page_offset() + self.len as u64 + PAGE_SIZE - 1) >> PAGE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_null_and_empty() {
        assert_eq!(
            UserBuffer::new(VirtAddr::new(0), 4096),
            Err(DriverError::InvalidArgument)
        );
        assert_eq!(
            UserBuffer::new(VirtAddr::new(0x1000), 0),
            Err(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn test_reject_wrapping_range() {
        assert_eq!(
            UserBuffer::new(VirtAddr::new(u64::MAX - 10), 100),
            Err(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn test_page_span() {
        let aligned = UserBuffer::new(VirtAddr::new(0x1000), 4096).unwrap();
        assert_eq!(aligned.page_span(), 1);

        let straddling = UserBuffer::new(VirtAddr::new(0x1ff0), 0x20).unwrap();
        assert_eq!(straddling.page_span(), 2);

        let three = UserBuffer::new(VirtAddr::new(0x1800), 3 * 4096 - 0x800).unwrap();
        assert_eq!(three.page_span(), 3);
    }

    #[test]
    fn test_pfn_conversion() {
        assert_eq!(PhysAddr::from_pfn(3).as_u64(), 3 * PAGE_SIZE);
        assert_eq!(VirtAddr::new(0x2345).page_number(), 2);
        assert_eq!(VirtAddr::new(0x2345).page_offset(), 0x345);
    }
}
