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

//! Size-class allocation over pagemap chunks.
//!
//! [`SizeClassAllocator`] only keeps bookkeeping: it never reads or writes
//! the memory it hands out. Where chunks come from and how the pagemap is
//! told about them is up to the [`ChunkSource`], which is what differs
//! between the host and the sandboxed child. All bookkeeping lives in the
//! private memory of whichever process owns the allocator, never in the
//! shared heap.

use std::collections::HashMap;

use anyhow::Result;

use crate::pagemap::{CHUNK_SIZE, large_class_for};

/// Smallest object handed out.
pub const MIN_ALLOC_SIZE: usize = 16;
/// Number of small size classes, `MIN_ALLOC_SIZE << i`.
pub const NUM_SMALL_CLASSES: usize = 13;
/// Largest object served from a slab (64KB).
pub const MAX_SMALL_SIZE: usize = MIN_ALLOC_SIZE << (NUM_SMALL_CLASSES - 1);

/// The small size class for an object of `size` bytes, if it is small.
pub fn small_class_for(size: usize) -> Option<usize> {
    if size > MAX_SMALL_SIZE {
        return None;
    }
    let rounded = size.max(MIN_ALLOC_SIZE).next_power_of_two();
    Some((rounded.trailing_zeros() - MIN_ALLOC_SIZE.trailing_zeros()) as usize)
}

/// Object size of small class `class`.
pub fn small_class_size(class: usize) -> usize {
    MIN_ALLOC_SIZE << class
}

/// Supplies chunk-aligned blocks and records their use in the pagemap.
pub trait ChunkSource {
    /// A block of large class `large_class`, recycled or fresh. `Ok(None)`
    /// when the range is exhausted.
    fn acquire(&mut self, large_class: usize) -> Result<Option<usize>>;
    /// Returns a block obtained from [`ChunkSource::acquire`] to the pool.
    fn release(&mut self, addr: usize, large_class: usize) -> Result<()>;
    /// Records that the chunk at `chunk` is carved into small objects.
    fn mark_slab(&mut self, chunk: usize) -> Result<()>;
    /// Records a large allocation of class `large_class` at `addr`.
    fn mark_large(&mut self, addr: usize, large_class: usize) -> Result<()>;
    /// Clears the pagemap entries of the block of class `large_class` at `addr`.
    fn clear(&mut self, addr: usize, large_class: usize) -> Result<()>;
}

struct Slab {
    class: usize,
    bump: usize,
    free: Vec<usize>,
    allocated: Vec<u64>,
    live: usize,
}

impl Slab {
    fn new(class: usize) -> Self {
        let objects = CHUNK_SIZE / small_class_size(class);
        Self {
            class,
            bump: 0,
            free: Vec::new(),
            allocated: vec![0; objects.div_ceil(64)],
            live: 0,
        }
    }

    fn object_size(&self) -> usize {
        small_class_size(self.class)
    }

    fn is_full(&self) -> bool {
        self.free.is_empty() && self.bump + self.object_size() > CHUNK_SIZE
    }

    fn take(&mut self, chunk: usize) -> Option<usize> {
        let addr = match self.free.pop() {
            Some(addr) => addr,
            None if self.bump + self.object_size() <= CHUNK_SIZE => {
                let addr = chunk + self.bump;
                self.bump += self.object_size();
                addr
            }
            None => return None,
        };
        let slot = (addr - chunk) / self.object_size();
        self.allocated[slot / 64] |= 1 << (slot % 64);
        self.live += 1;
        Some(addr)
    }

    /// Returns false if `addr` is not a live object of this slab.
    fn put(&mut self, chunk: usize, addr: usize) -> bool {
        let offset = addr - chunk;
        if offset % self.object_size() != 0 || offset >= self.bump {
            return false;
        }
        let slot = offset / self.object_size();
        let bit = 1u64 << (slot % 64);
        if self.allocated[slot / 64] & bit == 0 {
            return false;
        }
        self.allocated[slot / 64] &= !bit;
        self.live -= 1;
        self.free.push(addr);
        true
    }
}

/// Small objects from per-class slabs, everything else as whole large blocks.
#[derive(Default)]
pub struct SizeClassAllocator {
    slabs: HashMap<usize, Slab>,
    partial: [Vec<usize>; NUM_SMALL_CLASSES],
    large: HashMap<usize, usize>,
}

impl SizeClassAllocator {
    /// An allocator owning nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `size` bytes. Returns `Ok(None)` when the source is exhausted
    /// or `size` cannot be represented as a large class.
    pub fn alloc(&mut self, size: usize, source: &mut impl ChunkSource) -> Result<Option<usize>> {
        match small_class_for(size) {
            Some(class) => self.alloc_small(class, source),
            None => {
                let Some(class) = large_class_for(size) else {
                    return Ok(None);
                };
                let Some(addr) = source.acquire(class)? else {
                    return Ok(None);
                };
                source.mark_large(addr, class)?;
                self.large.insert(addr, class);
                Ok(Some(addr))
            }
        }
    }

    fn alloc_small(&mut self, class: usize, source: &mut impl ChunkSource) -> Result<Option<usize>> {
        while let Some(&chunk) = self.partial[class].last() {
            let Some(slab) = self.slabs.get_mut(&chunk) else {
                self.partial[class].pop();
                continue;
            };
            if let Some(addr) = slab.take(chunk) {
                if slab.is_full() {
                    self.partial[class].pop();
                }
                return Ok(Some(addr));
            }
            self.partial[class].pop();
        }

        let Some(chunk) = source.acquire(0)? else {
            return Ok(None);
        };
        source.mark_slab(chunk)?;
        let mut slab = Slab::new(class);
        let addr = slab.take(chunk);
        self.slabs.insert(chunk, slab);
        self.partial[class].push(chunk);
        Ok(addr)
    }

    /// Frees `addr`. Returns `Ok(false)` without touching anything if `addr`
    /// was not handed out by this allocator or was already freed.
    pub fn dealloc(&mut self, addr: usize, source: &mut impl ChunkSource) -> Result<bool> {
        if let Some(class) = self.large.remove(&addr) {
            source.clear(addr, class)?;
            source.release(addr, class)?;
            return Ok(true);
        }

        let chunk = addr & !(CHUNK_SIZE - 1);
        let Some(slab) = self.slabs.get_mut(&chunk) else {
            return Ok(false);
        };
        let was_full = slab.is_full();
        if !slab.put(chunk, addr) {
            return Ok(false);
        }
        let class = slab.class;
        if slab.live == 0 {
            self.slabs.remove(&chunk);
            self.partial[class].retain(|&c| c != chunk);
            source.clear(chunk, 0)?;
            source.release(chunk, 0)?;
        } else if was_full {
            self.partial[class].push(chunk);
        }
        Ok(true)
    }

    /// Whether `addr` is a live allocation of this allocator.
    pub fn owns(&self, addr: usize) -> bool {
        self.usable_size(addr).is_some()
    }

    /// The usable size of the live allocation at `addr`.
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        if let Some(&class) = self.large.get(&addr) {
            return crate::pagemap::large_class_size(class);
        }
        let chunk = addr & !(CHUNK_SIZE - 1);
        let slab = self.slabs.get(&chunk)?;
        let offset = addr - chunk;
        if offset % slab.object_size() != 0 || offset >= slab.bump {
            return None;
        }
        let slot = offset / slab.object_size();
        (slab.allocated[slot / 64] & (1 << (slot % 64)) != 0).then(|| slab.object_size())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::pagemap::{Owner, PagemapEntry, large_class_size};

    /// Hands out chunks from a fake address space without mapping anything.
    struct FakeSource {
        next: usize,
        end: usize,
        stacks: HashMap<usize, Vec<usize>>,
        entries: HashMap<usize, PagemapEntry>,
    }

    impl FakeSource {
        fn new(chunks: usize) -> Self {
            let base = 0x10_0000_0000;
            Self {
                next: base,
                end: base + chunks * CHUNK_SIZE,
                stacks: HashMap::new(),
                entries: HashMap::new(),
            }
        }
    }

    impl ChunkSource for FakeSource {
        fn acquire(&mut self, large_class: usize) -> Result<Option<usize>> {
            if let Some(addr) = self.stacks.entry(large_class).or_default().pop() {
                return Ok(Some(addr));
            }
            let size = large_class_size(large_class).unwrap();
            let addr = self.next.next_multiple_of(size);
            if addr + size > self.end {
                return Ok(None);
            }
            self.next = addr + size;
            Ok(Some(addr))
        }

        fn release(&mut self, addr: usize, large_class: usize) -> Result<()> {
            self.stacks.entry(large_class).or_default().push(addr);
            Ok(())
        }

        fn mark_slab(&mut self, chunk: usize) -> Result<()> {
            self.entries.insert(chunk, PagemapEntry::Slab(Owner::Child));
            Ok(())
        }

        fn mark_large(&mut self, addr: usize, large_class: usize) -> Result<()> {
            self.entries
                .insert(addr, PagemapEntry::LargeHead(Owner::Child, large_class as u8));
            Ok(())
        }

        fn clear(&mut self, addr: usize, _large_class: usize) -> Result<()> {
            self.entries.remove(&addr);
            Ok(())
        }
    }

    #[test]
    fn size_classes() {
        assert_eq!(small_class_for(0), Some(0));
        assert_eq!(small_class_for(16), Some(0));
        assert_eq!(small_class_for(17), Some(1));
        assert_eq!(small_class_for(MAX_SMALL_SIZE), Some(NUM_SMALL_CLASSES - 1));
        assert_eq!(small_class_for(MAX_SMALL_SIZE + 1), None);
    }

    #[test]
    fn small_objects_share_a_slab() {
        let mut source = FakeSource::new(4);
        let mut heap = SizeClassAllocator::new();
        let a = heap.alloc(24, &mut source).unwrap().unwrap();
        let b = heap.alloc(32, &mut source).unwrap().unwrap();
        assert_eq!(b, a + 32);
        assert_eq!(heap.usable_size(a), Some(32));
        assert_eq!(
            source.entries.get(&a),
            Some(&PagemapEntry::Slab(Owner::Child))
        );
    }

    #[test]
    fn freed_objects_are_reused_and_empty_slabs_released() {
        let mut source = FakeSource::new(4);
        let mut heap = SizeClassAllocator::new();
        let a = heap.alloc(64, &mut source).unwrap().unwrap();
        let b = heap.alloc(64, &mut source).unwrap().unwrap();
        assert!(heap.dealloc(a, &mut source).unwrap());
        assert_eq!(heap.alloc(64, &mut source).unwrap(), Some(a));
        assert!(heap.dealloc(a, &mut source).unwrap());
        assert!(heap.dealloc(b, &mut source).unwrap());
        // the slab went back to the pool and its entry was cleared
        assert!(source.entries.is_empty());
        assert_eq!(source.stacks[&0], vec![a & !(CHUNK_SIZE - 1)]);
    }

    #[test]
    fn foreign_and_double_frees_are_refused() {
        let mut source = FakeSource::new(4);
        let mut heap = SizeClassAllocator::new();
        let a = heap.alloc(128, &mut source).unwrap().unwrap();
        let _keep = heap.alloc(128, &mut source).unwrap().unwrap();
        assert!(!heap.dealloc(a + 8, &mut source).unwrap());
        assert!(!heap.dealloc(0x1234, &mut source).unwrap());
        assert!(heap.dealloc(a, &mut source).unwrap());
        assert!(!heap.dealloc(a, &mut source).unwrap());
    }

    #[test]
    fn large_allocations_take_whole_blocks() {
        let mut source = FakeSource::new(8);
        let mut heap = SizeClassAllocator::new();
        let big = heap.alloc(3 * CHUNK_SIZE, &mut source).unwrap().unwrap();
        assert_eq!(big % (4 * CHUNK_SIZE), 0);
        assert_eq!(heap.usable_size(big), Some(4 * CHUNK_SIZE));
        assert!(heap.dealloc(big, &mut source).unwrap());
        assert!(!heap.owns(big));
        assert_eq!(heap.alloc(4 * CHUNK_SIZE, &mut source).unwrap(), Some(big));
    }

    #[test]
    fn exhaustion_is_not_an_error() {
        let mut source = FakeSource::new(2);
        let mut heap = SizeClassAllocator::new();
        assert_eq!(heap.alloc(4 * CHUNK_SIZE, &mut source).unwrap(), None);
        assert_eq!(heap.alloc(usize::MAX, &mut source).unwrap(), None);
    }

    #[test]
    fn full_slabs_are_replaced() {
        let mut source = FakeSource::new(4);
        let mut heap = SizeClassAllocator::new();
        let per_slab = CHUNK_SIZE / MAX_SMALL_SIZE;
        let first: Vec<_> = (0..per_slab)
            .map(|_| heap.alloc(MAX_SMALL_SIZE, &mut source).unwrap().unwrap())
            .collect();
        let next = heap.alloc(MAX_SMALL_SIZE, &mut source).unwrap().unwrap();
        assert_ne!(next & !(CHUNK_SIZE - 1), first[0] & !(CHUNK_SIZE - 1));
        // freeing from a full slab makes it usable again
        assert!(heap.dealloc(first[3], &mut source).unwrap());
        assert_eq!(heap.alloc(MAX_SMALL_SIZE, &mut source).unwrap(), Some(first[3]));
    }
}
