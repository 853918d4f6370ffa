//! In-process simulated Porthole device
//!
//! Hosts the driver core on top of a scripted register block. A worker
//! thread plays the deferred interrupt path and a peer thread plays the far
//! side of the device: it attaches after a delay, waits for the client to
//! release its buffer, then detaches again.

use crate::config::DeviceConfig;
use crate::error::ClientError;
use porthole::regs::REGISTER_BLOCK_SIZE;
use porthole::traits::mock::{MockRegisters, SentMessage};
use porthole::{Device, DriverError, PageLock, PhysAddr, Platform, Resource, Scheduler, UserBuffer, WaitEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Register block base reported to the driver
const REGISTER_BASE: PhysAddr = PhysAddr::new(0xFEBF_1000);

/// Interrupt line reported to the driver
const INTERRUPT_LINE: u32 = 11;

struct EventSlot {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl EventSlot {
    fn store(&self, signaled: bool) {
        let mut state = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        *state = signaled;
        if signaled {
            self.cond.notify_all();
        }
    }
}

/// A wait object resolved by the driver
pub struct SimEvent(Arc<EventSlot>);

impl WaitEvent for SimEvent {
    fn set(&self) {
        self.0.store(true);
    }

    fn reset(&self) {
        self.0.store(false);
    }
}

/// Pinned pages of a client buffer
pub struct SimPageLock {
    frames: Vec<u64>,
    offset: u64,
    count: u32,
    outstanding: Arc<AtomicUsize>,
}

impl PageLock for SimPageLock {
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

impl Drop for SimPageLock {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Host kernel services backed by threads and the process's own memory
///
/// Buffers are never really pinned; each page is given a made-up frame
/// number so the driver sees a plausible physical layout.
pub struct SimPlatform {
    regs: Arc<MockRegisters>,
    stride: u64,
    events: Mutex<HashMap<u64, Arc<EventSlot>>>,
    next_handle: AtomicU64,
    outstanding: Arc<AtomicUsize>,
    deferred: Mutex<Option<Sender<()>>>,
    epoch: Instant,
}

impl SimPlatform {
    fn new(regs: Arc<MockRegisters>, stride: u64, deferred: Sender<()>) -> Self {
        Self {
            regs,
            stride,
            events: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0x10),
            outstanding: Arc::new(AtomicUsize::new(0)),
            deferred: Mutex::new(Some(deferred)),
            epoch: Instant::now(),
        }
    }

    /// Create a manual-reset wait object and return its handle
    pub fn create_event(&self) -> u64 {
        let handle = self.next_handle.fetch_add(4, Ordering::Relaxed);
        let slot = Arc::new(EventSlot {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        });
        self.lock_events().insert(handle, slot);
        handle
    }

    /// Close a wait object handle
    pub fn close_event(&self, handle: u64) {
        self.lock_events().remove(&handle);
    }

    /// Block until the event is signaled or `timeout` passes
    pub fn wait_event(&self, handle: u64, timeout: Duration) -> bool {
        let Some(slot) = self.lock_events().get(&handle).cloned() else {
            return false;
        };

        let guard = slot.signaled.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = slot
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    /// Page locks currently held
    #[cfg(test)]
    pub fn outstanding_locks(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<EventSlot>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn detach_deferred(&self) {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Scheduler for SimPlatform {
    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Platform for SimPlatform {
    type Registers = Arc<MockRegisters>;
    type PageLock = SimPageLock;
    type Event = SimEvent;

    fn map_registers(&self, base: PhysAddr, len: u64) -> Result<Self::Registers, DriverError> {
        debug!(base = base.as_u64(), len, "mapping simulated register block");
        Ok(self.regs.clone())
    }

    fn lock_pages(&self, buffer: UserBuffer) -> Result<SimPageLock, DriverError> {
        let first = buffer.addr().page_number();
        let frames = (0..buffer.page_span())
            .map(|page| match self.stride {
                0 => first + page,
                stride => first + page + page / stride,
            })
            .collect();

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(SimPageLock {
            frames,
            offset: buffer.addr().page_offset(),
            count: buffer.len(),
            outstanding: self.outstanding.clone(),
        })
    }

    fn resolve_event(&self, handle: u64) -> Result<SimEvent, DriverError> {
        self.lock_events()
            .get(&handle)
            .cloned()
            .map(SimEvent)
            .ok_or(DriverError::InvalidHandle)
    }

    fn queue_deferred(&self) {
        if let Some(tx) = self.deferred.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(());
        }
    }
}

fn run_deferred(device: Weak<Device<SimPlatform>>, rx: Receiver<()>) {
    while rx.recv().is_ok() {
        let Some(device) = device.upgrade() else {
            break;
        };
        device.deferred_service();
    }
    trace!("deferred worker exiting");
}

fn raise_interrupt(device: &Weak<Device<SimPlatform>>) {
    if let Some(device) = device.upgrade() {
        if !device.interrupt_service() {
            warn!("interrupt raised with nothing latched");
        }
    }
}

/// Sleep for `duration` in short steps; false if asked to stop meanwhile
fn linger(duration: Duration, stop: &AtomicBool) -> bool {
    let start = Instant::now();
    while start.elapsed() < duration {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    !stop.load(Ordering::Acquire)
}

fn run_peer(
    device: Weak<Device<SimPlatform>>,
    regs: Arc<MockRegisters>,
    connect_delay: Duration,
    disconnect_delay: Duration,
    stop: Arc<AtomicBool>,
) {
    if !linger(connect_delay, &stop) {
        return;
    }
    info!("peer attaching");
    regs.set_connected(true);
    raise_interrupt(&device);

    while regs.unmapped().is_empty() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }

    if !linger(disconnect_delay, &stop) {
        return;
    }
    info!("peer detaching");
    regs.set_connected(false);
    raise_interrupt(&device);
}

/// A running simulated device
pub struct Simulation {
    device: Arc<Device<SimPlatform>>,
    regs: Arc<MockRegisters>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Simulation {
    /// Bring up the device and start the peer
    pub fn start(config: &DeviceConfig) -> Result<Self, ClientError> {
        let regs = Arc::new(MockRegisters::disconnected());
        regs.set_latency(config.command_latency);

        let (tx, rx) = mpsc::channel();
        let platform = SimPlatform::new(regs.clone(), config.fragment_stride, tx);
        let resources = [
            Resource::Memory { start: REGISTER_BASE, len: REGISTER_BLOCK_SIZE },
            Resource::Interrupt { vector: INTERRUPT_LINE, message_signaled: false },
        ];
        let device = Device::prepare_hardware(platform, &resources, config.driver_config())
            .map_err(ClientError::Setup)?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        let weak = Arc::downgrade(&device);
        workers.push(thread::spawn(move || run_deferred(weak, rx)));

        let weak = Arc::downgrade(&device);
        let (peer_regs, peer_stop) = (regs.clone(), stop.clone());
        let (connect_delay, disconnect_delay) = (config.connect_delay(), config.disconnect_delay());
        workers.push(thread::spawn(move || {
            run_peer(weak, peer_regs, connect_delay, disconnect_delay, peer_stop)
        }));

        Ok(Self { device, regs, stop, workers })
    }

    /// The simulated device
    pub fn device(&self) -> &Arc<Device<SimPlatform>> {
        &self.device
    }

    /// Messages the device accepted
    pub fn messages(&self) -> Vec<SentMessage> {
        self.regs.messages()
    }

    /// Mapping ids the device was asked to drop
    #[cfg(test)]
    pub fn unmapped(&self) -> Vec<u32> {
        self.regs.unmapped()
    }

    /// Stop the peer, release the hardware and join the workers
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.release_hardware();
        self.device.platform().detach_deferred();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("simulation worker panicked");
            }
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop_workers();
        }
    }
}
