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

use std::collections::HashMap;

use heapbox_common::pagemap::{
    CHUNK_BITS, CHUNK_SIZE, Owner, PAGEMAP_PAGE_ENTRIES, PAGEMAP_PAGE_SPAN_BITS, PagemapEntry,
    page_index,
};

type Leaf = Box<[u8; PAGEMAP_PAGE_ENTRIES]>;

/// The canonical pagemap for every registered range.
///
/// Addresses are split at [`PAGEMAP_PAGE_SPAN_BITS`]: the high bits pick a
/// leaf, the low bits pick the entry within it, so a leaf has exactly the
/// layout of the page a child maps.
#[derive(Default)]
pub struct PagemapTable {
    leaves: HashMap<usize, Leaf>,
}

fn leaf_index(addr: usize) -> usize {
    addr >> PAGEMAP_PAGE_SPAN_BITS
}

impl PagemapTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw entry byte for the chunk containing `addr`.
    pub fn get(&self, addr: usize) -> u8 {
        self.leaves
            .get(&leaf_index(addr))
            .map_or(0, |leaf| leaf[page_index(addr)])
    }

    /// The decoded entry for the chunk containing `addr`.
    pub fn entry(&self, addr: usize) -> PagemapEntry {
        PagemapEntry::decode(self.get(addr)).unwrap_or(PagemapEntry::Unused)
    }

    /// Stores `entry` for the chunk containing `addr`.
    pub fn set(&mut self, addr: usize, entry: PagemapEntry) {
        let value = entry.encode();
        if value == 0 && !self.leaves.contains_key(&leaf_index(addr)) {
            return;
        }
        let leaf = self
            .leaves
            .entry(leaf_index(addr))
            .or_insert_with(|| Box::new([0; PAGEMAP_PAGE_ENTRIES]));
        leaf[page_index(addr)] = value;
    }

    /// Records a large allocation of `1 << bits` bytes at `addr`: a head
    /// entry for the chunk holding `addr` and body entries for every other
    /// chunk the block touches. `addr` need not be chunk aligned.
    pub fn set_large(&mut self, addr: usize, bits: usize, owner: Owner) {
        let class = (bits - CHUNK_BITS) as u8;
        let first = chunk_base(addr);
        self.set(first, PagemapEntry::LargeHead(owner, class));
        for i in 1..entries_for(addr, bits) {
            self.set(first + i * CHUNK_SIZE, PagemapEntry::LargeBody(owner, class));
        }
    }

    /// Resets `entries` consecutive chunk entries starting at the chunk
    /// holding `addr`.
    pub fn clear(&mut self, addr: usize, entries: usize) {
        let first = chunk_base(addr);
        for i in 0..entries {
            self.set(first + i * CHUNK_SIZE, PagemapEntry::Unused);
        }
    }

    /// Copies `entries` entries starting at the entry for `addr` into `page`,
    /// the pagemap page shared with one child. Entries past the end of the
    /// page are not copied.
    pub fn copy_into(&self, page: &mut [u8], addr: usize, entries: usize) {
        let first = chunk_base(addr);
        let start = page_index(first);
        let end = start.saturating_add(entries).min(page.len());
        for (i, slot) in page[start.min(end)..end].iter_mut().enumerate() {
            *slot = self.get(first + i * CHUNK_SIZE);
        }
    }
}

fn chunk_base(addr: usize) -> usize {
    addr & !(CHUNK_SIZE - 1)
}

/// Number of chunk entries touched by a block of `1 << bits` bytes at
/// `addr`. One more than the block size in chunks when `addr` is not chunk
/// aligned.
pub(crate) fn entries_for(addr: usize, bits: usize) -> usize {
    let last = addr + ((1usize << bits) - 1);
    (last >> CHUNK_BITS) - (addr >> CHUNK_BITS) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 3 << PAGEMAP_PAGE_SPAN_BITS;

    #[test]
    fn unset_addresses_read_as_unused() {
        let table = PagemapTable::new();
        assert_eq!(table.get(BASE), 0);
        assert_eq!(table.entry(usize::MAX), PagemapEntry::Unused);
    }

    #[test]
    fn set_only_touches_one_chunk() {
        let mut table = PagemapTable::new();
        let addr = BASE + 5 * CHUNK_SIZE;
        table.set(addr, PagemapEntry::Slab(Owner::Child));
        assert_eq!(table.entry(addr + CHUNK_SIZE - 1), PagemapEntry::Slab(Owner::Child));
        assert_eq!(table.entry(addr + CHUNK_SIZE), PagemapEntry::Unused);
        assert_eq!(table.entry(addr - 1), PagemapEntry::Unused);
        // same page index, different leaf
        assert_eq!(table.entry(addr + (1 << PAGEMAP_PAGE_SPAN_BITS)), PagemapEntry::Unused);
    }

    #[test]
    fn set_large_then_clear() {
        let mut table = PagemapTable::new();
        let addr = BASE + 8 * CHUNK_SIZE;
        table.set_large(addr, CHUNK_BITS + 2, Owner::Host);
        assert_eq!(table.entry(addr), PagemapEntry::LargeHead(Owner::Host, 2));
        for i in 1..4 {
            assert_eq!(
                table.entry(addr + i * CHUNK_SIZE),
                PagemapEntry::LargeBody(Owner::Host, 2)
            );
        }
        assert_eq!(table.entry(addr + 4 * CHUNK_SIZE), PagemapEntry::Unused);

        table.clear(addr, entries_for(addr, CHUNK_BITS + 2));
        for i in 0..4 {
            assert_eq!(table.get(addr + i * CHUNK_SIZE), 0);
        }
    }

    #[test]
    fn unaligned_large_block_covers_every_chunk_it_touches() {
        let mut table = PagemapTable::new();
        let addr = BASE + 3 * CHUNK_SIZE + 0x40;
        assert_eq!(entries_for(addr, CHUNK_BITS + 1), 3);
        assert_eq!(entries_for(BASE + 4 * CHUNK_SIZE, CHUNK_BITS + 1), 2);

        table.set_large(addr, CHUNK_BITS + 1, Owner::Child);
        assert_eq!(table.entry(addr - 0x40), PagemapEntry::LargeHead(Owner::Child, 1));
        for i in 1..3 {
            assert_eq!(
                table.entry(addr + i * CHUNK_SIZE),
                PagemapEntry::LargeBody(Owner::Child, 1)
            );
        }
        assert_eq!(table.entry(addr + 3 * CHUNK_SIZE), PagemapEntry::Unused);

        let mut page = vec![0u8; PAGEMAP_PAGE_ENTRIES];
        table.copy_into(&mut page, addr, 3);
        assert_eq!(page[3], PagemapEntry::LargeHead(Owner::Child, 1).encode());
        assert_eq!(page[5], PagemapEntry::LargeBody(Owner::Child, 1).encode());

        table.clear(addr, 3);
        for i in 0..3 {
            assert_eq!(table.get(addr + i * CHUNK_SIZE), 0);
        }
    }

    #[test]
    fn copy_into_writes_exactly_the_requested_entries() {
        let mut table = PagemapTable::new();
        let addr = BASE + 16 * CHUNK_SIZE;
        table.set_large(addr, CHUNK_BITS + 1, Owner::Child);
        table.set(addr + 2 * CHUNK_SIZE, PagemapEntry::Slab(Owner::Child));

        let mut page = vec![0xffu8; PAGEMAP_PAGE_ENTRIES];
        table.copy_into(&mut page, addr, 2);
        assert_eq!(page[15], 0xff);
        assert_eq!(page[16], PagemapEntry::LargeHead(Owner::Child, 1).encode());
        assert_eq!(page[17], PagemapEntry::LargeBody(Owner::Child, 1).encode());
        assert_eq!(page[18], 0xff);
    }

    #[test]
    fn copy_into_stops_at_the_end_of_the_page() {
        let table = PagemapTable::new();
        let mut page = vec![0xffu8; PAGEMAP_PAGE_ENTRIES];
        let last = BASE + (PAGEMAP_PAGE_ENTRIES - 1) * CHUNK_SIZE;
        table.copy_into(&mut page, last, 4);
        assert_eq!(page[PAGEMAP_PAGE_ENTRIES - 1], 0);
        assert_eq!(page[PAGEMAP_PAGE_ENTRIES - 2], 0xff);
    }
}
