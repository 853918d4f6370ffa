//! Per-client mapping slot table
//!
//! A fixed array of [`MAX_MAPPINGS`] slots. The bound is the client's
//! backpressure: once every slot is in use, further messages fail with
//! `ResourceExhausted` until a mapping is released. Nothing here allocates.
//!
//! A slot moves `Free -> Reserved -> Active -> Free`. A reservation is
//! taken before pinning and the device handshake, and is either committed
//! with the mapping id the device assigned or cancelled on failure.

use crate::error::DriverError;
use crate::mem::VirtAddr;
use crate::protocol::MapId;
use alloc::vec::Vec;
pub use libporthole::MAX_MAPPINGS;

/// An established mapping and the page lock backing it
pub struct Mapping<L> {
    /// Client virtual address
    pub addr: VirtAddr,
    /// Length in bytes
    pub len: u32,
    /// Device-assigned identifier
    pub id: MapId,
    /// Pinned pages; released when the mapping is dropped
    pub pages: L,
}

enum Slot<L> {
    Free,
    Reserved { addr: VirtAddr, len: u32 },
    Active(Mapping<L>),
}

impl<L> Slot<L> {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

/// Index of a reserved slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Raw slot number
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Fixed-capacity table of a client's mappings
pub struct MappingTable<L> {
    slots: [Slot<L>; MAX_MAPPINGS],
}

impl<L> MappingTable<L> {
    /// An empty table
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::Free),
        }
    }

    /// Reserve the first free slot for a buffer
    pub fn reserve(&mut self, addr: VirtAddr, len: u32) -> Result<SlotIndex, DriverError> {
        let index = self
            .slots
            .iter()
            .position(Slot::is_free)
            .ok_or(DriverError::ResourceExhausted)?;

        self.slots[index] = Slot::Reserved { addr, len };
        Ok(SlotIndex(index))
    }

    /// Turn a reservation into an active mapping
    ///
    /// Fails with `InvalidArgument` if `index` is not reserved; the page
    /// lock is dropped in that case.
    pub fn commit(&mut self, index: SlotIndex, id: MapId, pages: L) -> Result<(), DriverError> {
        let slot = self.slots.get_mut(index.0).ok_or(DriverError::InvalidArgument)?;
        match *slot {
            Slot::Reserved { addr, len } => {
                *slot = Slot::Active(Mapping { addr, len, id, pages });
                Ok(())
            }
            _ => Err(DriverError::InvalidArgument),
        }
    }

    /// Give back a reservation that never became a mapping
    pub fn cancel(&mut self, index: SlotIndex) {
        if let Some(slot) = self.slots.get_mut(index.0) {
            if matches!(slot, Slot::Reserved { .. }) {
                *slot = Slot::Free;
            }
        }
    }

    /// Find the active mapping with the given id
    pub fn find_by_id(&self, id: MapId) -> Option<SlotIndex> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Active(m) if m.id == id))
            .map(SlotIndex)
    }

    /// Find the active mapping covering exactly `addr`/`len`
    pub fn find_by_address(&self, addr: VirtAddr, len: u32) -> Option<SlotIndex> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Active(m) if m.addr == addr && m.len == len))
            .map(SlotIndex)
    }

    /// The lowest slot holding an active mapping
    pub fn first_active(&self) -> Option<SlotIndex> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Active(_)))
            .map(SlotIndex)
    }

    /// The active mapping in `index`
    pub fn get(&self, index: SlotIndex) -> Option<&Mapping<L>> {
        match self.slots.get(index.0)? {
            Slot::Active(mapping) => Some(mapping),
            _ => None,
        }
    }

    /// Remove and return the active mapping in `index`, freeing the slot
    pub fn take(&mut self, index: SlotIndex) -> Option<Mapping<L>> {
        let slot = self.slots.get_mut(index.0)?;
        if !matches!(slot, Slot::Active(_)) {
            return None;
        }
        match core::mem::replace(slot, Slot::Free) {
            Slot::Active(mapping) => Some(mapping),
            _ => None,
        }
    }

    /// Free the mapping with `id`, releasing its page lock
    pub fn release_by_id(&mut self, id: MapId) -> Result<Mapping<L>, DriverError> {
        let index = self.find_by_id(id).ok_or(DriverError::NotFound)?;
        self.take(index).ok_or(DriverError::NotFound)
    }

    /// Free the mapping for `addr`/`len`, releasing its page lock
    pub fn release_by_address(&mut self, addr: VirtAddr, len: u32) -> Result<Mapping<L>, DriverError> {
        let index = self.find_by_address(addr, len).ok_or(DriverError::NotFound)?;
        self.take(index).ok_or(DriverError::NotFound)
    }

    /// Remove every active mapping, leaving the table free
    pub fn drain(&mut self) -> Vec<Mapping<L>> {
        let mut mappings = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Slot::Active(mapping) = core::mem::replace(slot, Slot::Free) {
                mappings.push(mapping);
            }
        }
        mappings
    }

    /// Number of active mappings
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    /// Number of free slots
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_free()).count()
    }

    /// Whether every slot is in use
    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }
}

impl<L> Default for MappingTable<L> {
    fn default() -> Self {
        Self::new()
    }
}
