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

//! The child's allocator for the shared heap.
//!
//! Chunks come from the host through Host Calls, and every pagemap change is
//! requested from the host rather than written locally: the child's pagemap
//! page is read-only and only the host may update it.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use anyhow::{Result, anyhow, bail};
use heapbox_common::alloc::{ChunkSource, SizeClassAllocator};
use heapbox_common::host_call::{HostCallKind, HostCallResponse};
use heapbox_common::pagemap::{CHUNK_BITS, Owner, PagemapEntry, lookup};
use heapbox_common::region::SharedRegionHeader;

use crate::host_service::HostServiceClient;

static HEAP: OnceLock<Mutex<ChildHeap>> = OnceLock::new();

thread_local! {
    static INSIDE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running child heap code until dropped.
struct Inside;

impl Inside {
    fn enter() -> Option<Inside> {
        let entered = INSIDE.try_with(|inside| !inside.replace(true)).unwrap_or(false);
        entered.then_some(Inside)
    }
}

impl Drop for Inside {
    fn drop(&mut self) {
        let _ = INSIDE.try_with(|inside| inside.set(false));
    }
}

/// Whether this thread is running child heap code right now. Anything it
/// allocates meanwhile must come from somewhere else.
pub fn inside_heap() -> bool {
    INSIDE.try_with(Cell::get).unwrap_or(true)
}

/// Obtains chunks and pagemap updates from the host.
struct HostChunks<'a> {
    client: &'a mut HostServiceClient,
}

impl HostChunks<'_> {
    fn call(&mut self, kind: HostCallKind, arg0: usize, arg1: usize) -> Result<u64> {
        let resp = self.client.request(kind, arg0 as u64, arg1 as u64)?;
        if !resp.is_ok() {
            bail!("host rejected {} ({:#x}, {})", kind.name(), arg0, arg1);
        }
        Ok(resp.result)
    }
}

impl ChunkSource for HostChunks<'_> {
    fn acquire(&mut self, large_class: usize) -> Result<Option<usize>> {
        let popped = self.call(HostCallKind::PopLargeStack, 0, large_class)?;
        if popped != 0 {
            return Ok(Some(popped as usize));
        }
        let reserved = self.call(HostCallKind::Reserve, 0, large_class)?;
        Ok((reserved != 0).then_some(reserved as usize))
    }

    fn release(&mut self, addr: usize, large_class: usize) -> Result<()> {
        self.call(HostCallKind::PushLargeStack, addr, large_class)
            .map(drop)
    }

    fn mark_slab(&mut self, chunk: usize) -> Result<()> {
        let entry = PagemapEntry::Slab(Owner::Child).encode();
        self.call(HostCallKind::Set, chunk, entry as usize).map(drop)
    }

    fn mark_large(&mut self, addr: usize, large_class: usize) -> Result<()> {
        self.call(HostCallKind::SetRange, addr, large_class + CHUNK_BITS)
            .map(drop)
    }

    fn clear(&mut self, addr: usize, large_class: usize) -> Result<()> {
        self.call(HostCallKind::ClearRange, addr, large_class + CHUNK_BITS)
            .map(drop)
    }
}

/// What happened to a pointer passed to [`free`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freed {
    /// Released by the child allocator
    Local,
    /// Queued for the host, which allocated it
    Remote,
}

/// The shared heap as seen from inside the sandbox.
pub struct ChildHeap {
    allocator: SizeClassAllocator,
    client: HostServiceClient,
    pagemap: &'static [u8],
    header: &'static SharedRegionHeader,
}

impl ChildHeap {
    fn alloc(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        let mut source = HostChunks {
            client: &mut self.client,
        };
        let addr = self.allocator.alloc(size, &mut source)?;
        Ok(addr.and_then(|a| NonNull::new(a as *mut u8)))
    }

    fn free(&mut self, ptr: NonNull<u8>) -> Result<Freed> {
        let addr = ptr.as_ptr() as usize;
        let mut source = HostChunks {
            client: &mut self.client,
        };
        if self.allocator.dealloc(addr, &mut source)? {
            return Ok(Freed::Local);
        }
        match lookup(self.pagemap, addr).owner() {
            Some(Owner::Host) => {
                if !self.header.remote_free.push(addr) {
                    bail!("remote free queue is full, leaking {:#x}", addr);
                }
                Ok(Freed::Remote)
            }
            _ => bail!("free of unknown pointer {:#x}", addr),
        }
    }

    /// The pagemap entry the host published for `addr`.
    fn entry(&self, addr: usize) -> PagemapEntry {
        lookup(self.pagemap, addr)
    }
}

pub(crate) fn install(
    client: HostServiceClient,
    pagemap: &'static [u8],
    header: &'static SharedRegionHeader,
) -> Result<()> {
    HEAP.set(Mutex::new(ChildHeap {
        allocator: SizeClassAllocator::new(),
        client,
        pagemap,
        header,
    }))
    .map_err(|_| anyhow!("the child heap is already installed"))
}

fn with_heap<T>(f: impl FnOnce(&mut ChildHeap) -> Result<T>) -> Result<T> {
    let Some(_inside) = Inside::enter() else {
        bail!("the child heap is not reentrant");
    };
    let heap = HEAP
        .get()
        .ok_or_else(|| anyhow!("the child heap is not bootstrapped"))?;
    let mut heap = heap
        .lock()
        .map_err(|_| anyhow!("the child heap lock is poisoned"))?;
    f(&mut heap)
}

/// Allocates `size` bytes in the shared heap. `Ok(None)` when the sandbox's
/// range is exhausted.
pub fn alloc(size: usize) -> Result<Option<NonNull<u8>>> {
    with_heap(|heap| heap.alloc(size))
}

/// Frees a pointer into the shared heap, whichever side allocated it.
pub fn free(ptr: NonNull<u8>) -> Result<Freed> {
    with_heap(|heap| heap.free(ptr))
}

/// The usable size of a live child allocation at `addr`. `None` for
/// anything the child heap did not hand out.
pub fn usable_size(addr: usize) -> Result<Option<usize>> {
    with_heap(|heap| Ok(heap.allocator.usable_size(addr)))
}

/// The pagemap entry for `addr` in the child's read-only page.
pub fn pagemap_entry(addr: usize) -> Result<PagemapEntry> {
    with_heap(|heap| Ok(heap.entry(addr)))
}

/// Sends a raw Host Call on the heap's channel. Used to exercise the host's
/// validation from inside a sandbox.
pub fn raw_host_call(kind: HostCallKind, arg0: u64, arg1: u64) -> Result<HostCallResponse> {
    with_heap(|heap| heap.client.request(kind, arg0, arg1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_heap_must_be_bootstrapped_first() {
        assert!(!inside_heap());
        assert!(alloc(16).is_err());
        assert!(usable_size(0x1000).is_err());
        assert!(!inside_heap());
    }

    #[test]
    fn heap_code_is_not_reentered() {
        let inside = Inside::enter().unwrap();
        assert!(inside_heap());
        assert!(Inside::enter().is_none());
        let err = alloc(16).unwrap_err();
        assert!(err.to_string().contains("not reentrant"));
        drop(inside);
        assert!(!inside_heap());
    }
}
