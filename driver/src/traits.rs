//! # Host Kernel Abstraction Traits
//!
//! Everything the driver needs from the kernel it is loaded into: delays and
//! a monotonic clock, register mapping, page pinning, wait-handle resolution
//! and deferred interrupt work. The driver core is generic over [`Platform`],
//! so the same code runs against the real kernel bindings and, during
//! testing, against the recording mocks in [`mock`].

use crate::error::DriverError;
use crate::mem::{PhysAddr, UserBuffer};
use crate::regs::Registers;
use core::time::Duration;

/// Time services used by the command poll
pub trait Scheduler {
    /// Sleep the calling thread for at least `duration`
    fn delay(&self, duration: Duration);

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;
}

/// Pinned user pages
///
/// Holding the value keeps the pages resident; dropping it unlocks them and
/// frees the descriptor. Ownership guarantees the release happens once.
pub trait PageLock: Send {
    /// Physical frame numbers, one per page touched, in ascending virtual order
    fn frames(&self) -> &[u64];

    /// Offset of the buffer start within its first page
    fn byte_offset(&self) -> u64;

    /// Number of bytes described
    fn byte_count(&self) -> u32;
}

/// A referenced kernel wait object supplied by a client
///
/// Dropping the value releases the reference taken when it was resolved.
pub trait WaitEvent: Send {
    /// Signal the event
    fn set(&self);

    /// Return the event to the unsignaled state
    fn reset(&self);
}

/// Kernel services required by the driver core
pub trait Platform: Scheduler + Send + Sync {
    /// Mapped register block
    type Registers: Registers;
    /// Page lock descriptor
    type PageLock: PageLock;
    /// Resolved wait object
    type Event: WaitEvent;

    /// Map the register block at `base`
    fn map_registers(&self, base: PhysAddr, len: u64) -> Result<Self::Registers, DriverError>;

    /// Allocate a descriptor for `buffer` and pin its pages
    ///
    /// Fails with `ResourceExhausted` when no descriptor can be allocated
    /// and `AccessViolation` when any page is not accessible to the caller.
    fn lock_pages(&self, buffer: UserBuffer) -> Result<Self::PageLock, DriverError>;

    /// Resolve a client-supplied handle to a referenced wait object
    fn resolve_event(&self, handle: u64) -> Result<Self::Event, DriverError>;

    /// Queue the deferred half of the interrupt handler
    fn queue_deferred(&self);
}

// ============================================================================
// Test Mock Implementations
// ============================================================================

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! Recording doubles for the register block and the host kernel.
    //!
    //! [`MockRegisters`] behaves like a well-formed device: it services each
    //! command when it is written (optionally after a number of polls), keeps
    //! `NOCONN` in step with the simulated peer, and can be scripted to fail
    //! or hang a specific command.

    use super::*;
    use crate::mem::VirtAddr;
    use crate::regs::{ControlFlags, InterruptStatus};
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
    use spin::Mutex;

    /// A message the device accepted
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SentMessage {
        /// Identifier assigned on FINISH
        pub id: u32,
        /// Type tag written before FINISH
        pub msg_type: u32,
        /// Segments in the order they were added
        pub segments: Vec<(u64, u32)>,
    }

    struct Fault {
        command: ControlFlags,
        skip: usize,
        status: ControlFlags,
    }

    struct DeviceState {
        cr: ControlFlags,
        addr: u64,
        size: u32,
        msg_type: u32,
        connected: bool,
        pending: Option<(ControlFlags, u32)>,
        latency: u32,
        stuck: Option<ControlFlags>,
        faults: Vec<Fault>,
        segments: Vec<(u64, u32)>,
        messages: Vec<SentMessage>,
        unmapped: Vec<u32>,
        commands: Vec<ControlFlags>,
        overlapped: usize,
        next_id: u32,
    }

    impl DeviceState {
        fn tick(&mut self) {
            if let Some((command, remaining)) = self.pending {
                if self.stuck == Some(command) {
                    return;
                }
                if remaining == 0 {
                    self.pending = None;
                    self.complete(command);
                } else {
                    self.pending = Some((command, remaining - 1));
                }
            }
        }

        fn complete(&mut self, command: ControlFlags) {
            let mut status = ControlFlags::empty();
            if !self.connected {
                status |= ControlFlags::NOCONN;
            } else if let Some(index) = self.faults.iter().position(|f| f.command == command) {
                if self.faults[index].skip == 0 {
                    status |= self.faults.remove(index).status;
                } else {
                    self.faults[index].skip -= 1;
                }
            }

            if status.is_empty() {
                if command == ControlFlags::START {
                    self.segments.clear();
                } else if command == ControlFlags::ADD_SEGMENT {
                    self.segments.push((self.addr, self.size));
                } else if command == ControlFlags::FINISH {
                    let id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1);
                    self.addr = 0xFFFF_FFFF_0000_0000 | id as u64;
                    self.messages.push(SentMessage {
                        id,
                        msg_type: self.msg_type,
                        segments: core::mem::take(&mut self.segments),
                    });
                } else if command == ControlFlags::UNMAP {
                    self.unmapped.push(self.addr as u32);
                }
            }

            self.cr = (self.cr - ControlFlags::STATUS - command) | status;
        }
    }

    /// Scripted register block
    pub struct MockRegisters {
        state: Mutex<DeviceState>,
        isr: AtomicU32,
    }

    impl MockRegisters {
        /// A device with a connected peer
        pub fn new() -> Self {
            Self {
                state: Mutex::new(DeviceState {
                    cr: ControlFlags::empty(),
                    addr: 0,
                    size: 0,
                    msg_type: 0,
                    connected: true,
                    pending: None,
                    latency: 0,
                    stuck: None,
                    faults: Vec::new(),
                    segments: Vec::new(),
                    messages: Vec::new(),
                    unmapped: Vec::new(),
                    commands: Vec::new(),
                    overlapped: 0,
                    next_id: 1,
                }),
                isr: AtomicU32::new(0),
            }
        }

        /// A device with no peer attached
        pub fn disconnected() -> Self {
            let regs = Self::new();
            {
                let mut state = regs.state.lock();
                state.connected = false;
                state.cr |= ControlFlags::NOCONN;
            }
            regs
        }

        /// Attach or detach the peer and latch the matching interrupt
        pub fn set_connected(&self, connected: bool) {
            {
                let mut state = self.state.lock();
                state.connected = connected;
                state.cr.set(ControlFlags::NOCONN, !connected);
            }
            self.latch(if connected {
                InterruptStatus::CONNECT
            } else {
                InterruptStatus::DISCONNECT
            });
        }

        /// Whether a peer is attached
        pub fn is_connected(&self) -> bool {
            self.state.lock().connected
        }

        /// Latch interrupt bits without changing the peer state
        pub fn latch(&self, bits: InterruptStatus) {
            self.isr.fetch_or(bits.bits(), Ordering::AcqRel);
        }

        /// Fail the `nth` (zero-based) upcoming occurrence of `command` with `status`
        pub fn fail_nth(&self, command: ControlFlags, nth: usize, status: ControlFlags) {
            self.state.lock().faults.push(Fault { command, skip: nth, status });
        }

        /// Service every command only after `polls` reads of `cr`
        pub fn set_latency(&self, polls: u32) {
            self.state.lock().latency = polls;
        }

        /// Never complete `command`
        pub fn hang(&self, command: ControlFlags) {
            self.state.lock().stuck = Some(command);
        }

        /// Let a hung command complete on the next poll
        pub fn unhang(&self) {
            self.state.lock().stuck = None;
        }

        /// Commands written while another was still in flight
        pub fn overlapped_commands(&self) -> usize {
            self.state.lock().overlapped
        }

        /// Messages accepted so far
        pub fn messages(&self) -> Vec<SentMessage> {
            self.state.lock().messages.clone()
        }

        /// Mapping ids unmapped so far
        pub fn unmapped(&self) -> Vec<u32> {
            self.state.lock().unmapped.clone()
        }

        /// Every command written, in order
        pub fn commands(&self) -> Vec<ControlFlags> {
            self.state.lock().commands.clone()
        }

        /// Segments added since the last START, including a failed stream
        pub fn pending_segments(&self) -> Vec<(u64, u32)> {
            self.state.lock().segments.clone()
        }
    }

    impl Default for MockRegisters {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Registers for MockRegisters {
        fn control(&self) -> ControlFlags {
            let mut state = self.state.lock();
            state.tick();
            state.cr
        }

        fn set_control(&self, bits: ControlFlags) {
            let mut state = self.state.lock();
            state.cr |= bits;
            let command = bits & ControlFlags::COMMANDS;
            if !command.is_empty() {
                if state.pending.is_some() {
                    state.overlapped += 1;
                }
                state.commands.push(command);
                let latency = state.latency;
                state.pending = Some((command, latency));
                if latency == 0 {
                    state.tick();
                }
            }
        }

        fn clear_control(&self, bits: ControlFlags) {
            self.state.lock().cr -= bits;
        }

        fn write_addr(&self, value: u64) {
            self.state.lock().addr = value;
        }

        fn read_addr(&self) -> u64 {
            self.state.lock().addr
        }

        fn write_size(&self, value: u32) {
            self.state.lock().size = value;
        }

        fn write_type(&self, value: u32) {
            self.state.lock().msg_type = value;
        }

        fn interrupt_status(&self) -> InterruptStatus {
            InterruptStatus::from_bits_truncate(self.isr.load(Ordering::Acquire))
        }

        fn claim_interrupts(&self) -> InterruptStatus {
            InterruptStatus::from_bits_truncate(self.isr.swap(0, Ordering::AcqRel))
        }
    }

    /// Pages pinned by [`MockPlatform`]
    pub struct MockPageLock {
        frames: Vec<u64>,
        offset: u64,
        count: u32,
        unlocked: Arc<AtomicUsize>,
    }

    impl PageLock for MockPageLock {
        fn frames(&self) -> &[u64] {
            &self.frames
        }

        fn byte_offset(&self) -> u64 {
            self.offset
        }

        fn byte_count(&self) -> u32 {
            self.count
        }
    }

    impl Drop for MockPageLock {
        fn drop(&mut self) {
            self.unlocked.fetch_add(1, Ordering::AcqRel);
        }
    }

    struct EventState {
        signaled: AtomicBool,
        references: AtomicUsize,
        signals: AtomicUsize,
        last_signal: AtomicU64,
    }

    /// A referenced mock wait object
    pub struct MockEvent {
        state: Arc<EventState>,
        sequence: Arc<AtomicU64>,
    }

    impl WaitEvent for MockEvent {
        fn set(&self) {
            let stamp = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            self.state.last_signal.store(stamp, Ordering::Release);
            self.state.signals.fetch_add(1, Ordering::AcqRel);
            self.state.signaled.store(true, Ordering::Release);
        }

        fn reset(&self) {
            self.state.signaled.store(false, Ordering::Release);
        }
    }

    impl Drop for MockEvent {
        fn drop(&mut self) {
            self.state.references.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Recording host kernel
    ///
    /// Virtual pages map to the physical frame with the same number unless
    /// remapped with [`MockPlatform::remap_page`]. The clock only advances
    /// through [`Scheduler::delay`].
    pub struct MockPlatform {
        registers: Arc<MockRegisters>,
        map_fails: AtomicBool,
        descriptor_fails: AtomicBool,
        remapped: Mutex<BTreeMap<u64, u64>>,
        inaccessible: Mutex<Vec<u64>>,
        locked: AtomicUsize,
        unlocked: Arc<AtomicUsize>,
        events: Mutex<BTreeMap<u64, Arc<EventState>>>,
        next_handle: AtomicU64,
        sequence: Arc<AtomicU64>,
        clock: AtomicU64,
        delays: AtomicU64,
        deferred: AtomicUsize,
    }

    impl MockPlatform {
        /// A platform whose device has a connected peer
        pub fn new() -> Self {
            Self::with_registers(Arc::new(MockRegisters::new()))
        }

        /// A platform around the given register block
        pub fn with_registers(registers: Arc<MockRegisters>) -> Self {
            Self {
                registers,
                map_fails: AtomicBool::new(false),
                descriptor_fails: AtomicBool::new(false),
                remapped: Mutex::new(BTreeMap::new()),
                inaccessible: Mutex::new(Vec::new()),
                locked: AtomicUsize::new(0),
                unlocked: Arc::new(AtomicUsize::new(0)),
                events: Mutex::new(BTreeMap::new()),
                next_handle: AtomicU64::new(0x100),
                sequence: Arc::new(AtomicU64::new(0)),
                clock: AtomicU64::new(0),
                delays: AtomicU64::new(0),
                deferred: AtomicUsize::new(0),
            }
        }

        /// The simulated register block
        pub fn registers(&self) -> &Arc<MockRegisters> {
            &self.registers
        }

        /// Back the virtual page containing `page` with physical frame `pfn`
        pub fn remap_page(&self, page: VirtAddr, pfn: u64) {
            self.remapped.lock().insert(page.page_number(), pfn);
        }

        /// Make the virtual page containing `page` fail pinning
        pub fn revoke_page(&self, page: VirtAddr) {
            self.inaccessible.lock().push(page.page_number());
        }

        /// Make descriptor allocation fail
        pub fn fail_descriptors(&self, fail: bool) {
            self.descriptor_fails.store(fail, Ordering::Release);
        }

        /// Make register mapping fail
        pub fn fail_register_map(&self, fail: bool) {
            self.map_fails.store(fail, Ordering::Release);
        }

        /// Number of page locks taken
        pub fn locked_pages(&self) -> usize {
            self.locked.load(Ordering::Acquire)
        }

        /// Number of page locks released
        pub fn unlocked_pages(&self) -> usize {
            self.unlocked.load(Ordering::Acquire)
        }

        /// Page locks currently held
        pub fn outstanding_locks(&self) -> usize {
            self.locked_pages() - self.unlocked_pages()
        }

        /// Create a wait object and return its handle
        pub fn create_event(&self) -> u64 {
            let handle = self.next_handle.fetch_add(4, Ordering::AcqRel);
            self.events.lock().insert(
                handle,
                Arc::new(EventState {
                    signaled: AtomicBool::new(false),
                    references: AtomicUsize::new(0),
                    signals: AtomicUsize::new(0),
                    last_signal: AtomicU64::new(0),
                }),
            );
            handle
        }

        fn event(&self, handle: u64) -> Option<Arc<EventState>> {
            self.events.lock().get(&handle).cloned()
        }

        /// Force an event's state from outside the driver
        pub fn force_event(&self, handle: u64, signaled: bool) {
            if let Some(state) = self.event(handle) {
                state.signaled.store(signaled, Ordering::Release);
            }
        }

        /// Whether the event is signaled
        pub fn is_signaled(&self, handle: u64) -> bool {
            self.event(handle)
                .map_or(false, |state| state.signaled.load(Ordering::Acquire))
        }

        /// Number of times the event was set
        pub fn signal_count(&self, handle: u64) -> usize {
            self.event(handle)
                .map_or(0, |state| state.signals.load(Ordering::Acquire))
        }

        /// Sequence stamp of the event's latest set, if any
        pub fn signal_stamp(&self, handle: u64) -> Option<u64> {
            self.event(handle)
                .map(|state| state.last_signal.load(Ordering::Acquire))
                .filter(|&stamp| stamp != 0)
        }

        /// References the driver holds on the event
        pub fn references(&self, handle: u64) -> usize {
            self.event(handle)
                .map_or(0, |state| state.references.load(Ordering::Acquire))
        }

        /// Number of times deferred work was queued
        pub fn deferred_requests(&self) -> usize {
            self.deferred.load(Ordering::Acquire)
        }

        /// Number of delays taken
        pub fn delays(&self) -> u64 {
            self.delays.load(Ordering::Acquire)
        }
    }

    impl Default for MockPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Scheduler for MockPlatform {
        fn delay(&self, duration: Duration) {
            self.clock
                .fetch_add(duration.as_nanos() as u64, Ordering::AcqRel);
            self.delays.fetch_add(1, Ordering::AcqRel);
        }

        fn now_ns(&self) -> u64 {
            self.clock.load(Ordering::Acquire)
        }
    }

    impl Platform for MockPlatform {
        type Registers = Arc<MockRegisters>;
        type PageLock = MockPageLock;
        type Event = MockEvent;

        fn map_registers(&self, _base: PhysAddr, _len: u64) -> Result<Self::Registers, DriverError> {
            if self.map_fails.load(Ordering::Acquire) {
                return Err(DriverError::HardwareError);
            }
            Ok(self.registers.clone())
        }

        fn lock_pages(&self, buffer: UserBuffer) -> Result<MockPageLock, DriverError> {
            if self.descriptor_fails.load(Ordering::Acquire) {
                return Err(DriverError::ResourceExhausted);
            }

            let first = buffer.addr().page_number();
            let pages = first..first + buffer.page_span();

            let inaccessible = self.inaccessible.lock();
            if pages.clone().any(|page| inaccessible.contains(&page)) {
                return Err(DriverError::AccessViolation);
            }
            drop(inaccessible);

            let remapped = self.remapped.lock();
            let frames = pages
                .map(|page| remapped.get(&page).copied().unwrap_or(page))
                .collect();
            drop(remapped);

            self.locked.fetch_add(1, Ordering::AcqRel);
            Ok(MockPageLock {
                frames,
                offset: buffer.addr().page_offset(),
                count: buffer.len(),
                unlocked: self.unlocked.clone(),
            })
        }

        fn resolve_event(&self, handle: u64) -> Result<MockEvent, DriverError> {
            let state = self.event(handle).ok_or(DriverError::InvalidHandle)?;
            state.references.fetch_add(1, Ordering::AcqRel);
            Ok(MockEvent {
                state,
                sequence: self.sequence.clone(),
            })
        }

        fn queue_deferred(&self) {
            self.deferred.fetch_add(1, Ordering::AcqRel);
        }
    }
}
