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

use heapbox_common::pagemap::{NUM_LARGE_CLASSES, large_class_size};

use super::memory_range::MemoryRange;

/// Hands out large blocks from one sandbox's [`MemoryRange`].
///
/// Fresh blocks are bump allocated, each aligned to its own size. Freed
/// blocks are kept on per-class stacks in host memory; nothing about the
/// pool is stored inside the shared heap where the child could reach it.
#[derive(Debug)]
pub struct MemoryProvider {
    range: MemoryRange,
    bump: usize,
    large_stacks: Vec<Vec<usize>>,
}

impl MemoryProvider {
    /// A provider with nothing handed out yet.
    pub fn new(range: MemoryRange) -> Self {
        Self {
            range,
            bump: range.base(),
            large_stacks: vec![Vec::new(); NUM_LARGE_CLASSES],
        }
    }

    /// The range this provider allocates from.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// Whether `[addr, addr + len)` is inside this provider's range.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        self.range.contains(addr, len)
    }

    /// Carves a fresh block of `large_class` out of the range. `None` if the
    /// class is invalid or the range is exhausted.
    pub fn reserve(&mut self, large_class: usize) -> Option<usize> {
        let size = large_class_size(large_class)?;
        let addr = self.bump.checked_next_multiple_of(size)?;
        if !self.range.contains(addr, size) {
            return None;
        }
        self.bump = addr + size;
        Some(addr)
    }

    /// Puts a block on the free stack for `large_class`. The caller has
    /// already checked that the block lies inside the range.
    pub fn push_large_stack(&mut self, addr: usize, large_class: usize) {
        if let Some(stack) = self.large_stacks.get_mut(large_class) {
            stack.push(addr);
        }
    }

    /// Takes the most recently pushed block of `large_class`.
    pub fn pop_large_stack(&mut self, large_class: usize) -> Option<usize> {
        self.large_stacks.get_mut(large_class)?.pop()
    }

    /// Number of free blocks of `large_class`.
    pub fn free_blocks(&self, large_class: usize) -> usize {
        self.large_stacks.get(large_class).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use heapbox_common::pagemap::CHUNK_SIZE;

    use super::*;

    fn provider(chunks: usize) -> MemoryProvider {
        // start one chunk past an 8 chunk boundary, like a region after its header
        let base = (64 << 30) + CHUNK_SIZE;
        MemoryProvider::new(MemoryRange::new(base, chunks * CHUNK_SIZE).unwrap())
    }

    #[test]
    fn reserve_aligns_each_block_to_its_size() {
        let mut p = provider(15);
        let small = p.reserve(0).unwrap();
        assert_eq!(small, p.range().base());
        let four = p.reserve(2).unwrap();
        assert_eq!(four % (4 * CHUNK_SIZE), 0);
        assert!(four > small);
        assert!(p.contains(four, 4 * CHUNK_SIZE));
    }

    #[test]
    fn reserve_stops_at_the_end_of_the_range() {
        let mut p = provider(3);
        assert!(p.reserve(2).is_none());
        assert!(p.reserve(0).is_some());
        assert!(p.reserve(1).is_some());
        assert!(p.reserve(0).is_none());
        assert!(p.reserve(NUM_LARGE_CLASSES).is_none());
    }

    #[test]
    fn push_then_pop_returns_the_same_block() {
        let mut p = provider(4);
        let a = p.reserve(0).unwrap();
        let b = p.reserve(0).unwrap();
        p.push_large_stack(a, 0);
        p.push_large_stack(b, 0);
        assert_eq!(p.free_blocks(0), 2);
        assert_eq!(p.pop_large_stack(0), Some(b));
        assert_eq!(p.pop_large_stack(0), Some(a));
        assert_eq!(p.pop_large_stack(0), None);
        assert_eq!(p.pop_large_stack(NUM_LARGE_CLASSES), None);
    }
}
