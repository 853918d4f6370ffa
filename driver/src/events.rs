//! Connect/disconnect notification registry
//!
//! Clients register wait objects to be signaled when the remote peer
//! attaches or detaches. The list is shared between client request threads
//! and the deferred interrupt handler, so every access goes through the
//! event lock and nothing under it may block.

use crate::client::ClientId;
use crate::error::DriverError;
use crate::regs::InterruptStatus;
use crate::sync::EventLock;
use crate::traits::WaitEvent;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// One client's registered wait objects
pub struct EventRecord<E> {
    /// Client that registered the record
    pub owner: ClientId,
    /// Signaled when a peer attaches
    pub connect: Option<E>,
    /// Signaled when the peer detaches
    pub disconnect: Option<E>,
}

struct Records<E> {
    list: Vec<EventRecord<E>>,
    closed: bool,
}

/// Registered wait objects of every client
pub struct EventRegistry<E> {
    records: EventLock<Records<E>>,
}

impl<E: WaitEvent> EventRegistry<E> {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            records: EventLock::new(Records { list: Vec::new(), closed: false }, "events"),
        }
    }

    /// Add a record for `owner`
    ///
    /// The connect object starts signaled if a peer is attached and
    /// unsignaled otherwise; the disconnect object always starts unsignaled.
    /// `connected` is read under the event lock, so a transition handled by
    /// the deferred interrupt path is either reflected here or signaled on
    /// the new record afterwards.
    ///
    /// Fails with `HardwareError` once the registry has been closed; the
    /// wait objects are released untouched.
    pub fn register(
        &self,
        owner: ClientId,
        connect: Option<E>,
        disconnect: Option<E>,
        connected: &AtomicBool,
    ) -> Result<(), DriverError> {
        let mut records = self.records.lock();
        if records.closed {
            log::debug!("Client {} registered after hardware release", owner);
            return Err(DriverError::HardwareError);
        }

        if let Some(event) = &connect {
            if connected.load(Ordering::Acquire) {
                event.set();
            } else {
                event.reset();
            }
        }
        if let Some(event) = &disconnect {
            event.reset();
        }

        records.list.push(EventRecord { owner, connect, disconnect });
        log::debug!("Client {} registered for events ({} records)", owner, records.list.len());
        Ok(())
    }

    /// Drop every record owned by `owner`, releasing its wait objects
    pub fn remove_owner(&self, owner: ClientId) -> usize {
        let mut records = self.records.lock();
        let before = records.list.len();
        records.list.retain(|record| record.owner != owner);
        before - records.list.len()
    }

    /// Drop every record
    pub fn clear(&self) -> usize {
        let records = core::mem::take(&mut self.records.lock().list);
        records.len()
    }

    /// Drop every record and refuse further registrations
    pub fn close(&self) -> usize {
        let records = {
            let mut records = self.records.lock();
            records.closed = true;
            core::mem::take(&mut records.list)
        };
        records.len()
    }

    /// Publish a claimed interrupt status
    ///
    /// Stores the recomputed peer state in `connected` and signals the wait
    /// objects matching `status`, all under the event lock. Every disconnect
    /// object is signaled before any connect object, so a disconnect and
    /// reconnect claimed together are observed in that order.
    pub fn dispatch(&self, status: InterruptStatus, connected: &AtomicBool, attached: bool) {
        let records = self.records.lock();
        connected.store(attached, Ordering::Release);

        if status.contains(InterruptStatus::DISCONNECT) {
            for event in records.list.iter().filter_map(|r| r.disconnect.as_ref()) {
                event.set();
            }
        }

        if status.contains(InterruptStatus::CONNECT) {
            for event in records.list.iter().filter_map(|r| r.connect.as_ref()) {
                event.set();
            }
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.lock().list.len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: WaitEvent> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::mock::MockPlatform;
    use crate::traits::Platform;

    fn resolve(platform: &MockPlatform, handle: u64) -> Option<<MockPlatform as Platform>::Event> {
        Some(platform.resolve_event(handle).unwrap())
    }

    #[test]
    fn test_connect_initial_state_follows_connection() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let up = platform.create_event();
        let down = platform.create_event();

        registry.register(ClientId::new(), resolve(&platform, up), None, &AtomicBool::new(true)).unwrap();
        assert!(platform.is_signaled(up));

        platform.force_event(down, true);
        registry.register(ClientId::new(), resolve(&platform, down), None, &AtomicBool::new(false)).unwrap();
        assert!(!platform.is_signaled(down));
    }

    #[test]
    fn test_disconnect_starts_unsignaled() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let handle = platform.create_event();
        platform.force_event(handle, true);

        registry.register(ClientId::new(), None, resolve(&platform, handle), &AtomicBool::new(false)).unwrap();
        assert!(!platform.is_signaled(handle));
    }

    #[test]
    fn test_disconnect_dispatched_before_connect() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let connected = AtomicBool::new(false);

        let handles: Vec<(u64, u64)> = (0..3)
            .map(|_| (platform.create_event(), platform.create_event()))
            .collect();
        for &(up, down) in &handles {
            registry.register(
                ClientId::new(),
                resolve(&platform, up),
                resolve(&platform, down),
                &connected,
            ).unwrap();
        }

        registry.dispatch(
            InterruptStatus::CONNECT | InterruptStatus::DISCONNECT,
            &connected,
            true,
        );
        assert!(connected.load(Ordering::Acquire));

        let last_disconnect = handles
            .iter()
            .filter_map(|&(_, down)| platform.signal_stamp(down))
            .max()
            .unwrap();
        let first_connect = handles
            .iter()
            .filter_map(|&(up, _)| platform.signal_stamp(up))
            .min()
            .unwrap();
        assert!(last_disconnect < first_connect);
    }

    #[test]
    fn test_dispatch_only_matching_bits() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let (up, down) = (platform.create_event(), platform.create_event());
        registry.register(
            ClientId::new(),
            resolve(&platform, up),
            resolve(&platform, down),
            &AtomicBool::new(false),
        ).unwrap();

        registry.dispatch(InterruptStatus::DISCONNECT, &AtomicBool::new(true), false);
        assert!(platform.is_signaled(down));
        assert!(!platform.is_signaled(up));
    }

    #[test]
    fn test_remove_owner_releases_references() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let (alice, bob) = (ClientId::new(), ClientId::new());
        let handles: Vec<u64> = (0..3).map(|_| platform.create_event()).collect();

        registry.register(alice, resolve(&platform, handles[0]), resolve(&platform, handles[1]), &AtomicBool::new(false)).unwrap();
        registry.register(bob, resolve(&platform, handles[2]), None, &AtomicBool::new(false)).unwrap();
        registry.register(alice, None, None, &AtomicBool::new(false)).unwrap();

        assert_eq!(registry.remove_owner(alice), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(platform.references(handles[0]), 0);
        assert_eq!(platform.references(handles[1]), 0);
        assert_eq!(platform.references(handles[2]), 1);

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert_eq!(platform.references(handles[2]), 0);
    }

    #[test]
    fn test_closed_registry_refuses() {
        let platform = MockPlatform::new();
        let registry = EventRegistry::new();
        let (up, late) = (platform.create_event(), platform.create_event());
        registry
            .register(ClientId::new(), resolve(&platform, up), None, &AtomicBool::new(true))
            .unwrap();

        assert_eq!(registry.close(), 1);
        assert_eq!(
            registry.register(ClientId::new(), resolve(&platform, late), None, &AtomicBool::new(true)),
            Err(DriverError::HardwareError)
        );
        assert!(registry.is_empty());
        assert_eq!(platform.references(late), 0);
        assert!(!platform.is_signaled(late));
    }
}
