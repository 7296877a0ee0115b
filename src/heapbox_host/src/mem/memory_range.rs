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

use std::fmt;

use crate::HeapboxError::BoundsCheckFailed;
use crate::Result;

/// The address span `[base, base + size)` one sandbox's heap may occupy.
///
/// Every address that originates in the child must be checked against the
/// range of the sandbox it came from before the host acts on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    base: usize,
    size: usize,
}

impl MemoryRange {
    /// A range starting at `base` of `size` bytes. Returns `None` if the range
    /// would wrap the address space.
    pub fn new(base: usize, size: usize) -> Option<Self> {
        base.checked_add(size)?;
        Some(Self { base, size })
    }

    /// First address in the range.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address in the range.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `[addr, addr + len)` lies entirely inside the range. A span
    /// that wraps the address space is never contained.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Whether the two ranges share any address.
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// A [`SandboxPtr`] to `addr`, if `[addr, addr + len)` is inside the range.
    pub fn checked_ptr(&self, addr: usize, len: usize) -> Result<SandboxPtr> {
        if !self.contains(addr, len) {
            return Err(BoundsCheckFailed(addr, len));
        }
        Ok(SandboxPtr { addr })
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.base, self.end())
    }
}

/// An address known to lie inside a sandbox's memory range.
///
/// Only produced by [`MemoryRange::checked_ptr`] or by a sandbox allocator,
/// so holding one means the address was validated when it was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxPtr {
    addr: usize,
}

impl SandboxPtr {
    /// The address as an integer.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The address as a raw pointer, valid in the host and the child alike.
    pub fn as_ptr<T>(&self) -> *mut T {
        self.addr as *mut T
    }
}

impl fmt::Display for SandboxPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_both_ends() {
        let range = MemoryRange::new(0x10_0000, 0x30_0000).unwrap();
        assert!(range.contains(0x10_0000, 0x30_0000));
        assert!(range.contains(0x3f_ffff, 1));
        assert!(!range.contains(0x3f_ffff, 2));
        assert!(!range.contains(0x0f_ffff, 1));
        assert!(!range.contains(range.end(), 0x10_0000));
        assert!(!range.contains(usize::MAX, 2));
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = MemoryRange::new(0x1000, 0x1000).unwrap();
        let b = MemoryRange::new(0x1800, 0x1000).unwrap();
        let c = MemoryRange::new(0x2000, 0x1000).unwrap();
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c) && !c.overlaps(&a));
    }

    #[test]
    fn checked_ptr_refuses_outside_addresses() {
        let range = MemoryRange::new(0x1000, 0x1000).unwrap();
        assert_eq!(range.checked_ptr(0x1ff8, 8).unwrap().addr(), 0x1ff8);
        assert!(matches!(
            range.checked_ptr(0x1ff8, 9),
            Err(crate::HeapboxError::BoundsCheckFailed(0x1ff8, 9))
        ));
        assert!(MemoryRange::new(usize::MAX, 2).is_none());
    }
}
