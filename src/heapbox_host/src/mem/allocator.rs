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

use std::sync::Arc;

use heapbox_common::alloc::{ChunkSource, SizeClassAllocator};
use heapbox_common::pagemap::{CHUNK_BITS, Owner, PagemapEntry};
use heapbox_common::region::SharedRegionHeader;
use log::{debug, warn};

use crate::HeapboxError::{ForeignPointer, OutOfSandboxMemory};
use crate::Result;
use crate::pagemap::service::{PagemapService, RangeHandle, RangeState};
use crate::pagemap::table::{PagemapTable, entries_for};

/// Chunks for the host allocator, taken straight from the provider with
/// every pagemap change mirrored into the child's page.
struct HostChunks<'a> {
    table: &'a mut PagemapTable,
    state: &'a mut RangeState,
}

impl ChunkSource for HostChunks<'_> {
    fn acquire(&mut self, large_class: usize) -> anyhow::Result<Option<usize>> {
        let provider = &mut self.state.provider;
        Ok(provider
            .pop_large_stack(large_class)
            .or_else(|| provider.reserve(large_class)))
    }

    fn release(&mut self, addr: usize, large_class: usize) -> anyhow::Result<()> {
        self.state.provider.push_large_stack(addr, large_class);
        Ok(())
    }

    fn mark_slab(&mut self, chunk: usize) -> anyhow::Result<()> {
        self.table.set(chunk, PagemapEntry::Slab(Owner::Host));
        self.state.publish(self.table, chunk, 1);
        Ok(())
    }

    fn mark_large(&mut self, addr: usize, large_class: usize) -> anyhow::Result<()> {
        let bits = large_class + CHUNK_BITS;
        self.table.set_large(addr, bits, Owner::Host);
        self.state.publish(self.table, addr, entries_for(addr, bits));
        Ok(())
    }

    fn clear(&mut self, addr: usize, large_class: usize) -> anyhow::Result<()> {
        let entries = entries_for(addr, large_class + CHUNK_BITS);
        self.table.clear(addr, entries);
        self.state.publish(self.table, addr, entries);
        Ok(())
    }
}

/// The host's allocator for one sandbox's heap.
///
/// Runs under the pagemap service lock, so a host allocation and the
/// matching pagemap update are never observed apart by the child's Host
/// Calls.
pub(crate) struct SandboxAllocator {
    service: Arc<PagemapService>,
    handle: RangeHandle,
    inner: SizeClassAllocator,
}

impl SandboxAllocator {
    pub(crate) fn new(service: Arc<PagemapService>, handle: RangeHandle) -> Self {
        Self {
            service,
            handle,
            inner: SizeClassAllocator::new(),
        }
    }

    /// Allocates `size` bytes inside the sandbox.
    pub(crate) fn alloc(&mut self, size: usize) -> Result<usize> {
        let inner = &mut self.inner;
        self.service
            .with_range(&self.handle, |table, state| {
                inner.alloc(size, &mut HostChunks { table, state })
            })??
            .ok_or(OutOfSandboxMemory(size))
    }

    /// Frees whatever the child queued in `header`, then allocates `size`
    /// bytes. Blocks the child gave back are reusable by this allocation.
    pub(crate) fn alloc_after_drain(
        &mut self,
        header: &SharedRegionHeader,
        size: usize,
    ) -> Result<usize> {
        let freed = self.drain_remote_frees(header)?;
        if freed > 0 {
            debug!("freed {} host allocations released by the sandbox", freed);
        }
        self.alloc(size)
    }

    /// Frees an allocation made by [`SandboxAllocator::alloc`].
    pub(crate) fn dealloc(&mut self, addr: usize) -> Result<()> {
        let inner = &mut self.inner;
        let freed = self.service.with_range(&self.handle, |table, state| {
            inner.dealloc(addr, &mut HostChunks { table, state })
        })??;
        if !freed {
            return Err(ForeignPointer(addr));
        }
        Ok(())
    }

    /// Frees everything the child queued in `header`. Addresses this
    /// allocator never handed out are logged and dropped. Returns how many
    /// allocations were freed.
    pub(crate) fn drain_remote_frees(&mut self, header: &SharedRegionHeader) -> Result<usize> {
        let mut queued = Vec::new();
        header.remote_free.drain(|addr| queued.push(addr));

        let mut freed = 0;
        for addr in queued {
            if !self.owns(addr) {
                warn!("ignoring remote free of {:#x}, not a live host allocation", addr);
                continue;
            }
            self.dealloc(addr)?;
            freed += 1;
        }
        Ok(freed)
    }

    /// Whether `addr` is a live host allocation.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        self.inner.owns(addr)
    }
}

#[cfg(test)]
mod tests {
    use heapbox_common::pagemap::{CHUNK_SIZE, page_index};
    use heapbox_testing::seqpacket_pair;

    use super::*;
    use crate::HeapboxError;
    use crate::mem::memory_range::MemoryRange;
    use crate::mem::provider::MemoryProvider;
    use crate::mem::shared_mem::SharedMemory;
    use crate::pagemap::service::ServiceConfiguration;

    struct Fixture {
        service: Arc<PagemapService>,
        handle: RangeHandle,
        region: SharedMemory,
        _child: std::os::fd::OwnedFd,
    }

    impl Fixture {
        fn new() -> Self {
            let service = PagemapService::start(ServiceConfiguration::new()).unwrap();
            let region = SharedMemory::new_aligned(23).unwrap();
            let start = region.base_addr() + CHUNK_SIZE;
            let end = region.base_addr() + region.mem_size();
            unsafe { SharedRegionHeader::init(region.base_addr(), start, end).unwrap() };
            let (host, child) = seqpacket_pair().unwrap();
            let handle = service
                .register(
                    MemoryProvider::new(MemoryRange::new(start, end - start).unwrap()),
                    host,
                    SharedMemory::new_page().unwrap(),
                )
                .unwrap();
            Self {
                service,
                handle,
                region,
                _child: child,
            }
        }

        fn allocator(&self) -> SandboxAllocator {
            SandboxAllocator::new(self.service.clone(), self.handle)
        }

        fn header(&self) -> &SharedRegionHeader {
            unsafe { SharedRegionHeader::from_base(self.region.base_addr()).unwrap() }
        }

        fn child_view(&self, addr: usize) -> u8 {
            self.service
                .with_range(&self.handle, |_, state| state.page.as_mut_slice()[page_index(addr)])
                .unwrap()
        }
    }

    #[test]
    fn host_allocations_are_marked_as_host_owned() {
        let fixture = Fixture::new();
        let mut allocator = fixture.allocator();

        let small = allocator.alloc(24).unwrap();
        assert_eq!(fixture.child_view(small), PagemapEntry::Slab(Owner::Host).encode());

        let large = allocator.alloc(2 * CHUNK_SIZE).unwrap();
        assert_eq!(large % (2 * CHUNK_SIZE), 0);
        assert_eq!(
            fixture.child_view(large),
            PagemapEntry::LargeHead(Owner::Host, 1).encode()
        );
        assert_eq!(
            fixture.child_view(large + CHUNK_SIZE),
            PagemapEntry::LargeBody(Owner::Host, 1).encode()
        );

        allocator.dealloc(large).unwrap();
        assert_eq!(fixture.child_view(large), 0);
        allocator.dealloc(small).unwrap();
        assert_eq!(fixture.child_view(small), 0);
    }

    #[test]
    fn foreign_and_double_frees_are_refused() {
        let fixture = Fixture::new();
        let mut allocator = fixture.allocator();
        let a = allocator.alloc(64).unwrap();
        let _b = allocator.alloc(64).unwrap();

        assert!(matches!(allocator.dealloc(a + 8), Err(HeapboxError::ForeignPointer(_))));
        allocator.dealloc(a).unwrap();
        assert!(matches!(allocator.dealloc(a), Err(HeapboxError::ForeignPointer(_))));
    }

    #[test]
    fn running_out_of_range_is_an_error() {
        let fixture = Fixture::new();
        let mut allocator = fixture.allocator();
        assert!(matches!(
            allocator.alloc(8 * CHUNK_SIZE),
            Err(HeapboxError::OutOfSandboxMemory(_))
        ));
    }

    #[test]
    fn remote_frees_only_release_host_allocations() {
        let fixture = Fixture::new();
        let mut allocator = fixture.allocator();
        let a = allocator.alloc(128).unwrap();
        let b = allocator.alloc(128).unwrap();

        let header = fixture.header();
        assert!(header.remote_free.push(a));
        assert!(header.remote_free.push(a + 1));
        assert!(header.remote_free.push(0xdead_0000));
        assert_eq!(allocator.drain_remote_frees(header).unwrap(), 1);
        assert!(!allocator.owns(a));
        assert!(allocator.owns(b));
        assert_eq!(allocator.drain_remote_frees(header).unwrap(), 0);
    }

    #[test]
    fn host_allocation_first_takes_back_remote_frees() {
        let fixture = Fixture::new();
        let mut allocator = fixture.allocator();
        let a = allocator.alloc(256).unwrap();

        let header = fixture.header();
        assert!(header.remote_free.push(a));
        let b = allocator.alloc_after_drain(header, 256).unwrap();
        assert!(allocator.owns(b));
        if b != a {
            assert!(!allocator.owns(a));
        }
        assert_eq!(allocator.drain_remote_frees(header).unwrap(), 0);
    }
}
