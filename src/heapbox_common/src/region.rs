/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The header at the base of a shared memory region.
//!
//! The header takes the first pagemap chunk of the region; the heap the
//! sandbox allocates from starts at the next chunk. Both processes map the
//! region at the same address, so the header is always reached through
//! [`SharedRegionHeader::from_base`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use anyhow::{Result, bail};

use crate::pagemap::CHUNK_SIZE;
use crate::sync::CallSignal;

/// Value of [`SharedRegionHeader::magic`] once the host initialised it.
pub const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"HEAPBOX\0");
/// Bytes at the start of the region reserved for the header.
pub const HEADER_RESERVED: usize = CHUNK_SIZE;
/// Slots in the remote-free queue.
pub const REMOTE_FREE_CAPACITY: usize = 256;

/// The last call completed.
pub const CALL_OK: u32 = 0;
/// The last call named a function the child does not export.
pub const CALL_UNKNOWN_FUNCTION: u32 = 1;

/// The fixed header of a shared memory region.
///
/// `start` and `end` are written by the host before the child exists. Once
/// the child runs they are untrusted from the host's point of view; the host
/// keeps its own copy of the range and never reads them back.
#[repr(C)]
pub struct SharedRegionHeader {
    magic: AtomicU64,
    /// First usable heap address
    pub start: AtomicUsize,
    /// One past the last usable heap address
    pub end: AtomicUsize,
    /// Set by the host to ask the child to exit on its next wakeup
    pub should_exit: AtomicBool,
    /// Index of the exported function to run
    pub function_index: AtomicU32,
    /// Outcome of the last call, one of the `CALL_*` constants
    pub call_status: AtomicU32,
    /// Address of the argument/result frame for the call
    pub msg_buffer: AtomicUsize,
    /// Objects the child released that the host allocated
    pub remote_free: RemoteFreeQueue,
    /// Wait/signal state for the call protocol
    pub signal: CallSignal,
}

const _: () = assert!(std::mem::size_of::<SharedRegionHeader>() <= HEADER_RESERVED);

impl SharedRegionHeader {
    /// Initialises the header at `base`.
    ///
    /// # Safety
    /// `base` must be the start of a writable mapping of at least
    /// [`HEADER_RESERVED`] bytes that no other process has started using.
    pub unsafe fn init(base: usize, start: usize, end: usize) -> Result<()> {
        let this = base as *mut SharedRegionHeader;
        // SAFETY: guaranteed by the caller. Atomics are valid when zeroed.
        unsafe {
            std::ptr::write_bytes(this.cast::<u8>(), 0, std::mem::size_of::<Self>());
            CallSignal::init(std::ptr::addr_of_mut!((*this).signal))?;
            let header = &*this;
            header.start.store(start, Ordering::Relaxed);
            header.end.store(end, Ordering::Relaxed);
            header.magic.store(HEADER_MAGIC, Ordering::Release);
        }
        Ok(())
    }

    /// The header of the region mapped at `base`.
    ///
    /// # Safety
    /// `base` must be the base of a mapped region whose header was set up by
    /// [`SharedRegionHeader::init`], and the mapping must outlive every use
    /// of the returned reference.
    pub unsafe fn from_base<'a>(base: usize) -> Result<&'a Self> {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { &*(base as *const SharedRegionHeader) };
        if header.magic.load(Ordering::Acquire) != HEADER_MAGIC {
            bail!("no shared region header at {:#x}", base);
        }
        Ok(header)
    }
}

/// A single-producer, single-consumer ring of addresses.
///
/// The child pushes, the host drains. The host must treat everything in the
/// ring, including the indices, as untrusted.
#[repr(C)]
pub struct RemoteFreeQueue {
    head: AtomicU64,
    tail: AtomicU64,
    slots: [AtomicUsize; REMOTE_FREE_CAPACITY],
}

impl RemoteFreeQueue {
    /// Queues `addr`. Returns false if the ring is full.
    pub fn push(&self, addr: usize) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= REMOTE_FREE_CAPACITY as u64 {
            return false;
        }
        self.slots[tail as usize % REMOTE_FREE_CAPACITY].store(addr, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Hands every queued address to `f` and empties the ring. Returns the
    /// number of addresses drained.
    pub fn drain(&self, mut f: impl FnMut(usize)) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let pending = tail.wrapping_sub(head);
        if pending > REMOTE_FREE_CAPACITY as u64 {
            log::warn!(
                "remote free queue indices are inconsistent (head {}, tail {}), discarding",
                head,
                tail
            );
            self.head.store(tail, Ordering::Release);
            return 0;
        }
        for i in 0..pending {
            let slot = head.wrapping_add(i) as usize % REMOTE_FREE_CAPACITY;
            f(self.slots[slot].load(Ordering::Relaxed));
        }
        self.head.store(tail, Ordering::Release);
        pending as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_queue() -> Box<RemoteFreeQueue> {
        // SAFETY: all-zero atomics are valid.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        let q = zeroed_queue();
        for i in 0..REMOTE_FREE_CAPACITY {
            assert!(q.push(0x1000 + i));
        }
        assert!(!q.push(0xdead));
        let mut seen = Vec::new();
        assert_eq!(q.drain(|a| seen.push(a)), REMOTE_FREE_CAPACITY);
        assert_eq!(seen.first(), Some(&0x1000));
        assert_eq!(seen.last(), Some(&(0x1000 + REMOTE_FREE_CAPACITY - 1)));
        assert_eq!(q.drain(|_| panic!("queue should be empty")), 0);
        assert!(q.push(0xbeef));
    }

    #[test]
    fn corrupt_indices_are_discarded() {
        let q = zeroed_queue();
        q.tail.store(10_000, Ordering::Relaxed);
        assert_eq!(q.drain(|_| panic!("nothing should be drained")), 0);
        assert!(q.push(0x2000));
        let mut seen = Vec::new();
        q.drain(|a| seen.push(a));
        assert_eq!(seen, vec![0x2000]);
    }

    #[test]
    fn header_init_sets_range_and_magic() {
        let len = HEADER_RESERVED;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base as usize;
        assert!(unsafe { SharedRegionHeader::from_base(base) }.is_err());
        unsafe { SharedRegionHeader::init(base, base + len, base + 4 * len) }.unwrap();
        let header = unsafe { SharedRegionHeader::from_base(base) }.unwrap();
        assert_eq!(header.start.load(Ordering::Relaxed), base + len);
        assert_eq!(header.end.load(Ordering::Relaxed), base + 4 * len);
        unsafe {
            header.signal.destroy();
            libc::munmap(base as *mut _, len);
        }
    }
}
