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

//! Pagemap geometry.
//!
//! The pagemap classifies every [`CHUNK_SIZE`]-aligned bucket of the address
//! space with a single byte. The host keeps the canonical table; each child
//! sees a read-only page holding the [`PAGEMAP_PAGE_ENTRIES`] entries that
//! cover its own region.

/// log2 of the pagemap bucket size.
pub const CHUNK_BITS: usize = 20;
/// Size of one pagemap bucket (1MB).
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
/// Size of the page shared read-only into each child.
pub const PAGEMAP_PAGE_SIZE: usize = crate::PAGE_SIZE;
/// Entries held by one pagemap page, one byte each.
pub const PAGEMAP_PAGE_ENTRIES: usize = PAGEMAP_PAGE_SIZE;
/// log2 of the span covered by one pagemap page (4GB).
pub const PAGEMAP_PAGE_SPAN_BITS: usize = CHUNK_BITS + 12;
/// Number of large size classes. Class `c` covers `1 << (c + CHUNK_BITS)` bytes.
pub const NUM_LARGE_CLASSES: usize = PAGEMAP_PAGE_SPAN_BITS - CHUNK_BITS + 1;

const _: () = assert!(PAGEMAP_PAGE_ENTRIES == 1 << (PAGEMAP_PAGE_SPAN_BITS - CHUNK_BITS));

/// Returns the index of the entry describing `addr` within its pagemap page.
#[inline]
pub fn page_index(addr: usize) -> usize {
    (addr >> CHUNK_BITS) & (PAGEMAP_PAGE_ENTRIES - 1)
}

/// Returns true if `large_class` names a valid large size class.
#[inline]
pub fn is_large_class(large_class: usize) -> bool {
    large_class < NUM_LARGE_CLASSES
}

/// Size in bytes of large class `large_class`, or `None` if it is not a valid class.
pub fn large_class_size(large_class: usize) -> Option<usize> {
    if !is_large_class(large_class) {
        return None;
    }
    1usize.checked_shl((large_class + CHUNK_BITS) as u32)
}

/// The smallest large class able to hold `size` bytes.
pub fn large_class_for(size: usize) -> Option<usize> {
    let bits = size.max(CHUNK_SIZE).checked_next_power_of_two()?.trailing_zeros() as usize;
    let class = bits - CHUNK_BITS;
    is_large_class(class).then_some(class)
}

/// Which side of the sandbox boundary allocated a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The sandboxed child
    Child,
    /// The host process
    Host,
}

const LARGE_BIT: u8 = 0x80;
const BODY_BIT: u8 = 0x40;
const HOST_BIT: u8 = 0x20;
const CLASS_MASK: u8 = 0x1f;
const SLAB: u8 = 0x01;

/// A decoded pagemap entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PagemapEntry {
    /// Nothing is allocated in this chunk.
    Unused,
    /// The chunk is carved into small objects of one size class.
    Slab(Owner),
    /// First chunk of a large allocation of the given large class.
    LargeHead(Owner, u8),
    /// A chunk inside a large allocation. The head is found by aligning the
    /// address down to the size of the class.
    LargeBody(Owner, u8),
}

impl PagemapEntry {
    /// The byte stored in the pagemap for this entry.
    pub fn encode(self) -> u8 {
        let owner_bit = |owner| match owner {
            Owner::Child => 0,
            Owner::Host => HOST_BIT,
        };
        match self {
            PagemapEntry::Unused => 0,
            PagemapEntry::Slab(owner) => SLAB | owner_bit(owner),
            PagemapEntry::LargeHead(owner, class) => LARGE_BIT | owner_bit(owner) | (class & CLASS_MASK),
            PagemapEntry::LargeBody(owner, class) => {
                LARGE_BIT | BODY_BIT | owner_bit(owner) | (class & CLASS_MASK)
            }
        }
    }

    /// Decodes a pagemap byte. Returns `None` for bytes no valid entry encodes to.
    pub fn decode(byte: u8) -> Option<Self> {
        let owner = if byte & HOST_BIT != 0 {
            Owner::Host
        } else {
            Owner::Child
        };
        if byte & LARGE_BIT != 0 {
            let class = byte & CLASS_MASK;
            if !is_large_class(class as usize) {
                return None;
            }
            return Some(if byte & BODY_BIT != 0 {
                PagemapEntry::LargeBody(owner, class)
            } else {
                PagemapEntry::LargeHead(owner, class)
            });
        }
        match byte & !HOST_BIT {
            0 if byte == 0 => Some(PagemapEntry::Unused),
            SLAB => Some(PagemapEntry::Slab(owner)),
            _ => None,
        }
    }

    /// The owner of the chunk, if anything is allocated there.
    pub fn owner(self) -> Option<Owner> {
        match self {
            PagemapEntry::Unused => None,
            PagemapEntry::Slab(owner)
            | PagemapEntry::LargeHead(owner, _)
            | PagemapEntry::LargeBody(owner, _) => Some(owner),
        }
    }
}

/// Looks up the entry for `addr` in a pagemap page. Bytes that do not decode
/// are reported as [`PagemapEntry::Unused`].
pub fn lookup(page: &[u8], addr: usize) -> PagemapEntry {
    page.get(page_index(addr))
        .copied()
        .and_then(PagemapEntry::decode)
        .unwrap_or(PagemapEntry::Unused)
}
