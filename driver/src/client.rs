//! Per-open-handle client state
//!
//! Each open handle gets a [`ClientContext`]: an identity used to own event
//! registrations and a private mapping table. Closing the handle (dropping
//! the context) unmaps and unpins everything the client still holds and
//! drops its registrations.

use crate::device::Device;
use crate::error::DriverError;
use crate::mem::{UserBuffer, VirtAddr};
use crate::pin::{pin_user_buffer, segments};
use crate::protocol::MapId;
use crate::sync::MappingLock;
use crate::table::MappingTable;
use crate::traits::Platform;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Next client identity
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an open handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of one open handle
pub struct ClientContext<P: Platform> {
    id: ClientId,
    device: Arc<Device<P>>,
    mappings: MappingLock<MappingTable<P::PageLock>>,
}

impl<P: Platform> ClientContext<P> {
    pub(crate) fn new(device: Arc<Device<P>>) -> Self {
        Self {
            id: ClientId::new(),
            device,
            mappings: MappingLock::new(MappingTable::new(), "mappings"),
        }
    }

    /// This client's identity
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The device this client is bound to
    pub fn device(&self) -> &Arc<Device<P>> {
        &self.device
    }

    /// Pin a buffer, describe it to the device and record the mapping
    ///
    /// A slot is reserved first, so a full table fails before any page is
    /// pinned. On any later failure the slot is freed before returning and
    /// the pages are unpinned, unless the device was left wedged; then they
    /// stay pinned until the hardware is released.
    pub fn send_message(&self, msg_type: u32, addr: VirtAddr, len: u32) -> Result<MapId, DriverError> {
        let buffer = UserBuffer::new(addr, len)?;
        let index = self.mappings.lock().reserve(addr, len)?;

        let pages = match pin_user_buffer(self.device.platform(), buffer) {
            Ok(pages) => pages,
            Err(err) => {
                self.mappings.lock().cancel(index);
                return Err(err);
            }
        };

        let mut issued = false;
        let result = self.device.with_protocol(|protocol| {
            issued = true;
            protocol.send_message(msg_type, segments(&pages))
        });

        match result {
            Ok(id) => {
                self.mappings.lock().commit(index, id, pages)?;
                log::debug!("Client {} mapped {:#x}+{:#x} as {}", self.id, addr.as_u64(), len, id);
                Ok(id)
            }
            Err(err) => {
                self.mappings.lock().cancel(index);
                if issued && self.device.is_wedged() {
                    self.device.strand(pages);
                }
                Err(err)
            }
        }
    }

    /// Unmap the mapping with `id` and unpin its pages
    ///
    /// Fails with `NotFound` if this client holds no such mapping. If the
    /// device rejects the unmap, the mapping is kept.
    pub fn unlock_buffer(&self, id: MapId) -> Result<(), DriverError> {
        self.device.with_protocol(|protocol| {
            let mut table = self.mappings.lock();
            let index = table.find_by_id(id).ok_or(DriverError::NotFound)?;
            protocol.unmap(id)?;
            drop(table.take(index));
            Ok(())
        })
    }

    /// Unmap the mapping created for exactly `addr`/`len`
    pub fn unlock_range(&self, addr: VirtAddr, len: u32) -> Result<MapId, DriverError> {
        self.device.with_protocol(|protocol| {
            let mut table = self.mappings.lock();
            let index = table
                .find_by_address(addr, len)
                .ok_or(DriverError::NotFound)?;
            let id = table.get(index).map(|mapping| mapping.id).ok_or(DriverError::NotFound)?;
            protocol.unmap(id)?;
            drop(table.take(index));
            Ok(id)
        })
    }

    /// Register connect/disconnect wait handles
    ///
    /// Either handle may be absent. Both are resolved before anything is
    /// recorded; if the second fails the first is released again.
    pub fn register_events(&self, connect: Option<u64>, disconnect: Option<u64>) -> Result<(), DriverError> {
        let platform = self.device.platform();
        let resolve = |handle: u64| {
            platform.resolve_event(handle).map_err(|err| {
                log::warn!("Client {} passed unusable handle {:#x}: {}", self.id, handle, err);
                DriverError::InvalidHandle
            })
        };

        let connect = connect.map(resolve).transpose()?;
        let disconnect = disconnect.map(resolve).transpose()?;

        self.device.register_events(self.id, connect, disconnect)
    }

    /// Drop every mapping, telling the device on a best-effort basis
    ///
    /// Unmap failures are ignored: the mappings are treated as already gone
    /// on the device side. If the device wedges, the remaining mappings are
    /// stranded instead. Returns the number of mappings released.
    pub fn release_mappings(&self) -> usize {
        let mut count = 0;
        let _ = self.device.with_protocol(|protocol| {
            let mut table = self.mappings.lock();
            while let Some(index) = table.first_active() {
                let Some(id) = table.get(index).map(|mapping| mapping.id) else {
                    break;
                };
                if protocol.unmap(id).is_err() && protocol.busy() {
                    break;
                }
                drop(table.take(index));
                count += 1;
            }
            Ok(())
        });

        if self.device.is_released() {
            // Without hardware there is nobody left to tell
            count += self.mappings.lock().drain().len();
        } else {
            count += self.strand_remaining();
        }

        if count > 0 {
            log::warn!("Client {} force-released {} mappings", self.id, count);
        }
        count
    }

    /// Park every active mapping's pages on the device
    fn strand_remaining(&self) -> usize {
        let mut count = 0;
        loop {
            let mapping = {
                let mut table = self.mappings.lock();
                match table.first_active() {
                    Some(index) => table.take(index),
                    None => None,
                }
            };
            let Some(mapping) = mapping else {
                break;
            };
            self.device.strand(mapping.pages);
            count += 1;
        }
        count
    }

    /// Release everything the client holds
    ///
    /// Safe to call more than once.
    pub fn cleanup(&self) {
        let mappings = self.release_mappings();
        let registrations = self.device.remove_registrations(self.id);
        log::debug!(
            "Client {} closed ({} mappings, {} registrations)",
            self.id,
            mappings,
            registrations
        );
    }

    /// Number of live mappings
    pub fn active_mappings(&self) -> usize {
        self.mappings.lock().active_count()
    }
}

impl<P: Platform> Drop for ClientContext<P> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DriverConfig;
    use crate::mem::PAGE_SHIFT;
    use crate::regs::ControlFlags;
    use crate::table::MAX_MAPPINGS;
    use crate::traits::mock::{MockPlatform, MockRegisters};
    use crate::wait::WaitPolicy;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::time::Duration;

    const P: u64 = 0x40_0000;

    fn device_with(platform: MockPlatform) -> Arc<Device<MockPlatform>> {
        let regs = platform.registers().clone();
        Arc::new(Device::new(platform, regs, 9, DriverConfig::default()))
    }

    fn device() -> Arc<Device<MockPlatform>> {
        device_with(MockPlatform::new())
    }

    #[test]
    fn test_contiguous_buffer_one_segment() {
        let device = device();
        let client = device.open_client();

        let id = client.send_message(1, VirtAddr::new(P), 12288).unwrap();

        let messages = device.platform().registers().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id.as_u32());
        assert_eq!(messages[0].segments, vec![(P, 12288)]);
        assert_eq!(client.active_mappings(), 1);
        assert_eq!(device.platform().outstanding_locks(), 1);
    }

    #[test]
    fn test_gapped_buffer_two_segments() {
        let device = device();
        device
            .platform()
            .remap_page(VirtAddr::new(P + 8192), (P + 20480) >> PAGE_SHIFT);
        let client = device.open_client();

        client.send_message(1, VirtAddr::new(P), 12288).unwrap();

        let messages = device.platform().registers().messages();
        assert_eq!(messages[0].segments, vec![(P, 8192), (P + 20480, 4096)]);
    }

    #[test]
    fn test_invalid_buffer_rejected_before_pinning() {
        let device = device();
        let client = device.open_client();

        assert_eq!(
            client.send_message(1, VirtAddr::new(0), 16),
            Err(DriverError::InvalidArgument)
        );
        assert_eq!(
            client.send_message(1, VirtAddr::new(P), 0),
            Err(DriverError::InvalidArgument)
        );
        assert_eq!(device.platform().locked_pages(), 0);
        assert!(device.platform().registers().commands().is_empty());
    }

    #[test]
    fn test_noconn_on_first_poll() {
        let device = device_with(MockPlatform::with_registers(Arc::new(MockRegisters::disconnected())));
        let client = device.open_client();

        assert_eq!(
            client.send_message(1, VirtAddr::new(P), 4096),
            Err(DriverError::NotConnected)
        );
        assert_eq!(client.active_mappings(), 0);
        assert_eq!(client.mappings.lock().free_count(), MAX_MAPPINGS);
        assert_eq!(device.platform().locked_pages(), 1);
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_pin_failure_frees_slot() {
        let device = device();
        device.platform().revoke_page(VirtAddr::new(P + 4096));
        let client = device.open_client();

        assert_eq!(
            client.send_message(1, VirtAddr::new(P), 8192),
            Err(DriverError::AccessViolation)
        );
        assert_eq!(client.mappings.lock().free_count(), MAX_MAPPINGS);
        assert!(device.platform().registers().commands().is_empty());
    }

    #[test]
    fn test_finish_failure_releases_everything() {
        let device = device();
        device
            .platform()
            .registers()
            .fail_nth(ControlFlags::FINISH, 0, ControlFlags::DEVERR);
        let client = device.open_client();

        assert_eq!(
            client.send_message(1, VirtAddr::new(P), 4096),
            Err(DriverError::DeviceError)
        );
        assert_eq!(client.mappings.lock().free_count(), MAX_MAPPINGS);
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_table_full() {
        let device = device();
        let client = device.open_client();

        let ids: Vec<MapId> = (0..MAX_MAPPINGS as u64)
            .map(|n| client.send_message(1, VirtAddr::new(P + n * 4096), 4096).unwrap())
            .collect();

        let extra = VirtAddr::new(P + 0x10_0000);
        assert_eq!(
            client.send_message(1, extra, 4096),
            Err(DriverError::ResourceExhausted)
        );
        assert_eq!(device.platform().locked_pages(), MAX_MAPPINGS);

        client.unlock_buffer(ids[3]).unwrap();
        assert!(client.send_message(1, extra, 4096).is_ok());
    }

    #[test]
    fn test_unlock_twice() {
        let device = device();
        let client = device.open_client();
        let id = client.send_message(1, VirtAddr::new(P), 4096).unwrap();

        assert_eq!(client.unlock_buffer(id), Ok(()));
        assert_eq!(client.unlock_buffer(id), Err(DriverError::NotFound));
        assert_eq!(device.platform().registers().unmapped(), vec![id.as_u32()]);
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_unlock_failure_keeps_mapping() {
        let device = device();
        let client = device.open_client();
        let id = client.send_message(1, VirtAddr::new(P), 4096).unwrap();
        device
            .platform()
            .registers()
            .fail_nth(ControlFlags::UNMAP, 0, ControlFlags::BADADDR);

        assert_eq!(client.unlock_buffer(id), Err(DriverError::BadAddress));
        assert_eq!(client.active_mappings(), 1);
        assert_eq!(client.unlock_buffer(id), Ok(()));
    }

    #[test]
    fn test_unlock_range() {
        let device = device();
        let client = device.open_client();
        let id = client.send_message(1, VirtAddr::new(P), 4096).unwrap();

        assert_eq!(
            client.unlock_range(VirtAddr::new(P), 8192),
            Err(DriverError::NotFound)
        );
        assert_eq!(client.unlock_range(VirtAddr::new(P), 4096), Ok(id));
        assert_eq!(client.active_mappings(), 0);
    }

    #[test]
    fn test_clients_do_not_share_mappings() {
        let device = device();
        let first = device.open_client();
        let second = device.open_client();
        let id = first.send_message(1, VirtAddr::new(P), 4096).unwrap();

        assert_eq!(second.unlock_buffer(id), Err(DriverError::NotFound));
        assert_eq!(first.active_mappings(), 1);
    }

    #[test]
    fn test_close_with_five_mappings() {
        let device = device();
        let client = device.open_client();
        let ids: Vec<u32> = (0..5)
            .map(|n| {
                client
                    .send_message(1, VirtAddr::new(P + n * 0x10000), 4096)
                    .unwrap()
                    .as_u32()
            })
            .collect();

        drop(client);

        let mut unmapped = device.platform().registers().unmapped();
        unmapped.sort_unstable();
        assert_eq!(unmapped, ids);
        assert_eq!(device.platform().locked_pages(), 5);
        assert_eq!(device.platform().unlocked_pages(), 5);
    }

    #[test]
    fn test_forced_release_ignores_unmap_errors() {
        let device = device();
        let client = device.open_client();
        for n in 0..3 {
            client.send_message(1, VirtAddr::new(P + n * 4096), 4096).unwrap();
        }
        device.platform().registers().set_connected(false);

        assert_eq!(client.release_mappings(), 3);
        assert_eq!(client.active_mappings(), 0);
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_release_after_hardware_removal() {
        let device = device();
        let client = device.open_client();
        client.send_message(1, VirtAddr::new(P), 4096).unwrap();
        device.release_hardware();

        assert_eq!(client.release_mappings(), 1);
        assert!(device.platform().registers().unmapped().is_empty());
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_register_events() {
        let device = device();
        let client = device.open_client();
        let platform = device.platform();
        let (up, down) = (platform.create_event(), platform.create_event());

        client.register_events(Some(up), Some(down)).unwrap();

        assert!(platform.is_signaled(up));
        assert!(!platform.is_signaled(down));
        assert_eq!(device.registration_count(), 1);
    }

    #[test]
    fn test_register_events_atomic() {
        let device = device();
        let client = device.open_client();
        let up = device.platform().create_event();

        assert_eq!(
            client.register_events(Some(up), Some(0xDEAD)),
            Err(DriverError::InvalidHandle)
        );
        assert_eq!(device.registration_count(), 0);
        assert_eq!(device.platform().references(up), 0);
    }

    #[test]
    fn test_register_events_after_removal() {
        let device = device();
        let client = device.open_client();
        let up = device.platform().create_event();
        device.release_hardware();

        assert_eq!(client.register_events(Some(up), None), Err(DriverError::HardwareError));
        assert_eq!(device.registration_count(), 0);
        assert_eq!(device.platform().references(up), 0);
    }

    #[test]
    fn test_close_removes_only_own_registrations() {
        let device = device();
        let first = device.open_client();
        let second = device.open_client();
        let platform = device.platform();
        let handles: Vec<u64> = (0..2).map(|_| platform.create_event()).collect();

        first.register_events(Some(handles[0]), None).unwrap();
        second.register_events(None, Some(handles[1])).unwrap();

        drop(first);
        assert_eq!(device.registration_count(), 1);
        assert_eq!(platform.references(handles[0]), 0);
        assert_eq!(platform.references(handles[1]), 1);

        second.cleanup();
        second.cleanup();
        assert_eq!(device.registration_count(), 0);
    }

    #[test]
    fn test_stuck_command_wedges_device() {
        let platform = MockPlatform::new();
        let regs = platform.registers().clone();
        let config = DriverConfig {
            wait: WaitPolicy::bounded(Duration::from_micros(1), Duration::from_micros(50)),
        };
        let device = Arc::new(Device::new(platform, regs.clone(), 9, config));
        let client = device.open_client();

        let first = client.send_message(1, VirtAddr::new(P), 4096).unwrap();
        regs.hang(ControlFlags::ADD_SEGMENT);

        assert_eq!(
            client.send_message(1, VirtAddr::new(P + 0x10000), 4096),
            Err(DriverError::Timeout)
        );
        assert!(device.is_wedged());
        assert_eq!(client.active_mappings(), 1);
        assert_eq!(device.stranded_count(), 1);
        assert_eq!(device.platform().outstanding_locks(), 2);

        // Nothing is written over the stuck command
        let issued = regs.commands().len();
        assert_eq!(client.unlock_buffer(first), Err(DriverError::Timeout));
        assert_eq!(
            client.send_message(1, VirtAddr::new(P + 0x20000), 4096),
            Err(DriverError::Timeout)
        );
        assert_eq!(regs.commands().len(), issued);
        assert_eq!(regs.overlapped_commands(), 0);
        assert_eq!(client.active_mappings(), 1);
        assert_eq!(device.stranded_count(), 1);
        assert_eq!(device.platform().outstanding_locks(), 2);

        regs.unhang();
        client.unlock_buffer(first).unwrap();
        assert!(!device.is_wedged());
        assert_eq!(regs.unmapped(), vec![first.as_u32()]);
        assert_eq!(regs.overlapped_commands(), 0);
        assert_eq!(device.platform().outstanding_locks(), 1);

        device.release_hardware();
        assert_eq!(device.stranded_count(), 0);
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_release_on_wedged_device_strands_pages() {
        let platform = MockPlatform::new();
        let regs = platform.registers().clone();
        let config = DriverConfig {
            wait: WaitPolicy::bounded(Duration::from_micros(1), Duration::from_micros(50)),
        };
        let device = Arc::new(Device::new(platform, regs.clone(), 9, config));
        let client = device.open_client();
        for n in 0..3 {
            client.send_message(1, VirtAddr::new(P + n * 4096), 4096).unwrap();
        }
        regs.hang(ControlFlags::UNMAP);

        assert_eq!(client.release_mappings(), 3);
        assert_eq!(client.active_mappings(), 0);
        assert_eq!(regs.unmapped().len(), 0);
        assert_eq!(device.stranded_count(), 3);
        assert_eq!(device.platform().outstanding_locks(), 3);

        device.release_hardware();
        assert_eq!(device.platform().outstanding_locks(), 0);
    }

    #[test]
    fn test_parallel_clients_serialize_handshakes() {
        use std::thread;

        const THREADS: u64 = 4;
        const ROUNDS: u64 = 16;
        const FAR: u64 = 0x4000_0000;

        let addr = |lane: u64, round: u64| P + lane * 0x10_0000 + round * 0x4000;
        let platform = MockPlatform::new();
        for lane in 0..THREADS {
            for round in 0..ROUNDS {
                let base = addr(lane, round);
                platform.remap_page(VirtAddr::new(base + 4096), (FAR + base) >> PAGE_SHIFT);
            }
        }
        platform.registers().set_latency(2);
        let device = device_with(platform);

        let workers: Vec<_> = (0..THREADS)
            .map(|lane| {
                let device = device.clone();
                thread::spawn(move || {
                    let client = device.open_client();
                    let mut ids = Vec::new();
                    for round in 0..ROUNDS {
                        let tag = (lane * ROUNDS + round) as u32;
                        let id = client
                            .send_message(tag, VirtAddr::new(addr(lane, round)), 8192)
                            .unwrap();
                        client.unlock_buffer(id).unwrap();
                        ids.push(id.as_u32());
                    }
                    ids
                })
            })
            .collect();
        let mut ids: Vec<u32> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();

        let regs = device.platform().registers();
        let messages = regs.messages();
        assert_eq!(messages.len(), (THREADS * ROUNDS) as usize);
        for message in &messages {
            let base = addr(message.msg_type as u64 / ROUNDS, message.msg_type as u64 % ROUNDS);
            assert_eq!(message.segments, vec![(base, 4096), (FAR + base, 4096)]);
        }

        let mut unmapped = regs.unmapped();
        unmapped.sort_unstable();
        ids.sort_unstable();
        assert_eq!(unmapped, ids);
        assert_eq!(regs.overlapped_commands(), 0);
        assert_eq!(device.platform().outstanding_locks(), 0);
        assert_eq!(device.stats().messages, THREADS * ROUNDS);
    }
}
