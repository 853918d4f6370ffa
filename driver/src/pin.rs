//! Page pinning and segment coalescing
//!
//! A pinned buffer is described to the device as the shortest list of
//! physically contiguous runs covering it. Runs are produced lazily so the
//! protocol engine can stream each one to the device as soon as it closes.

use crate::error::DriverError;
use crate::mem::{PhysAddr, UserBuffer, PAGE_SHIFT, PAGE_SIZE};
use crate::protocol::Segment;
use crate::traits::{PageLock, Platform};

/// Pin `buffer`'s pages through the platform
///
/// The returned lock keeps the pages resident until it is dropped.
pub fn pin_user_buffer<P: Platform + ?Sized>(
    platform: &P,
    buffer: UserBuffer,
) -> Result<P::PageLock, DriverError> {
    match platform.lock_pages(buffer) {
        Ok(lock) => {
            log::trace!(
                "Pinned {:#x}+{:#x} ({} pages)",
                buffer.addr().as_u64(),
                buffer.len(),
                lock.frames().len()
            );
            Ok(lock)
        }
        Err(err) => {
            log::warn!(
                "Failed to pin {:#x}+{:#x}: {}",
                buffer.addr().as_u64(),
                buffer.len(),
                err
            );
            Err(err)
        }
    }
}

/// Per-page physical chunks of a pinned buffer
///
/// The first chunk starts at the buffer's offset within its page and the
/// last one stops at the buffer's end.
pub struct PageChunks<'a> {
    frames: core::slice::Iter<'a, u64>,
    offset: u64,
    remaining: u64,
}

impl<'a> PageChunks<'a> {
    /// Chunks of the given frames
    pub fn new(frames: &'a [u64], offset: u64, len: u32) -> Self {
        Self {
            frames: frames.iter(),
            offset,
            remaining: len as u64,
        }
    }
}

impl Iterator for PageChunks<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }

        let pfn = *self.frames.next()?;
        let len = (PAGE_SIZE - self.offset).min(self.remaining);
        let addr = PhysAddr::new((pfn << PAGE_SHIFT) + self.offset);

        self.remaining -= len;
        self.offset = 0;
        Some(Segment::new(addr, len as u32))
    }
}

/// Merges adjacent chunks into maximal contiguous runs
///
/// A chunk extends the current run when it starts exactly where the run
/// ends; otherwise the run is emitted and the chunk starts the next one.
/// Order is preserved.
pub struct Coalesce<I> {
    chunks: I,
    run: Option<Segment>,
}

impl<I: Iterator<Item = Segment>> Coalesce<I> {
    /// Coalesce `chunks`
    pub fn new(chunks: I) -> Self {
        Self { chunks, run: None }
    }
}

impl<I: Iterator<Item = Segment>> Iterator for Coalesce<I> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        for chunk in self.chunks.by_ref() {
            match &mut self.run {
                Some(run) if run.end() == chunk.addr.as_u64() => run.len += chunk.len,
                run => {
                    if let Some(closed) = run.replace(chunk) {
                        return Some(closed);
                    }
                }
            }
        }
        self.run.take()
    }
}

/// Coalesced segments of a pinned buffer
pub fn segments<L: PageLock + ?Sized>(lock: &L) -> Coalesce<PageChunks<'_>> {
    Coalesce::new(PageChunks::new(
        lock.frames(),
        lock.byte_offset(),
        lock.byte_count(),
    ))
}
