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

//! The descriptor numbering a sandboxed child starts with.
//!
//! The launcher places every descriptor the child needs into a fixed slot and
//! closes everything else. The child entry point relies on these numbers, so
//! they are the contract between the two binaries.

use std::os::fd::RawFd;

use bitflags::bitflags;

/// A fixed descriptor slot in the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildFd {
    /// Standard input
    Stdin,
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// The shared memory region holding the header and the heap
    SharedMemRegion,
    /// The pagemap page, mapped read-only by the child
    PageMapPage,
    /// Socket over which further descriptors may be passed to the child
    FdSocket,
    /// The library the child loads
    MainLibrary,
    /// Socket carrying Host Call requests to the pagemap service
    PageMapUpdates,
    /// The `n`th library search directory
    OtherLibraries(u16),
}

impl ChildFd {
    /// The first slot holding a library search directory.
    pub const FIRST_LIBRARY_DIR: RawFd = 8;

    /// The descriptor number this role occupies in the child.
    pub const fn raw(self) -> RawFd {
        match self {
            ChildFd::Stdin => 0,
            ChildFd::Stdout => 1,
            ChildFd::Stderr => 2,
            ChildFd::SharedMemRegion => 3,
            ChildFd::PageMapPage => 4,
            ChildFd::FdSocket => 5,
            ChildFd::MainLibrary => 6,
            ChildFd::PageMapUpdates => 7,
            ChildFd::OtherLibraries(n) => Self::FIRST_LIBRARY_DIR + n as RawFd,
        }
    }

    /// The minimum set of operations the child needs on this descriptor.
    pub const fn rights(self) -> Rights {
        match self {
            ChildFd::Stdin => Rights::READ,
            ChildFd::Stdout | ChildFd::Stderr => Rights::WRITE,
            ChildFd::SharedMemRegion => Rights::MMAP_RW,
            ChildFd::PageMapPage => Rights::MMAP_R,
            ChildFd::FdSocket | ChildFd::PageMapUpdates => Rights::READ.union(Rights::WRITE),
            ChildFd::MainLibrary => Rights::READ
                .union(Rights::FSTAT)
                .union(Rights::SEEK)
                .union(Rights::MMAP_RX),
            ChildFd::OtherLibraries(_) => Rights::READ
                .union(Rights::FSTAT)
                .union(Rights::LOOKUP)
                .union(Rights::MMAP_RX),
        }
    }

    /// Every role in slot order for a child given `library_dirs` search directories.
    pub fn layout(library_dirs: u16) -> Vec<ChildFd> {
        let mut roles = vec![
            ChildFd::Stdin,
            ChildFd::Stdout,
            ChildFd::Stderr,
            ChildFd::SharedMemRegion,
            ChildFd::PageMapPage,
            ChildFd::FdSocket,
            ChildFd::MainLibrary,
            ChildFd::PageMapUpdates,
        ];
        roles.extend((0..library_dirs).map(ChildFd::OtherLibraries));
        roles
    }
}

bitflags! {
    /// Operations permitted on a descriptor handed to the child.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        /// read(2) and friends
        const READ    = 1 << 0;
        /// write(2) and friends
        const WRITE   = 1 << 1;
        /// fstat(2)
        const FSTAT   = 1 << 2;
        /// lseek(2)
        const SEEK    = 1 << 3;
        /// openat(2) relative to a directory
        const LOOKUP  = 1 << 4;
        /// mmap(2) with `PROT_READ`
        const MMAP_R  = 1 << 5;
        /// mmap(2) with `PROT_WRITE`
        const MMAP_W  = 1 << 6;
        /// mmap(2) with `PROT_EXEC`
        const MMAP_X  = 1 << 7;
        /// Shared read/write mapping
        const MMAP_RW = Self::MMAP_R.bits() | Self::MMAP_W.bits();
        /// Mapping code
        const MMAP_RX = Self::MMAP_R.bits() | Self::MMAP_X.bits();
    }
}

impl Rights {
    /// Whether the descriptor may be used to modify its object.
    pub fn allows_write(self) -> bool {
        self.intersects(Rights::WRITE | Rights::MMAP_W)
    }

    /// Whether the descriptor may be used to observe its object.
    pub fn allows_read(self) -> bool {
        self.intersects(Rights::READ | Rights::MMAP_R)
    }
}

/// Checks that `roles` is exactly the slot order of [`ChildFd::layout`].
pub fn validate_layout(roles: &[ChildFd]) -> anyhow::Result<()> {
    let library_dirs = roles
        .iter()
        .filter(|r| matches!(r, ChildFd::OtherLibraries(_)))
        .count();
    let expected = ChildFd::layout(u16::try_from(library_dirs)?);
    if roles != expected.as_slice() {
        anyhow::bail!("descriptor layout {:?} does not match {:?}", roles, expected);
    }
    for (slot, role) in roles.iter().enumerate() {
        if role.raw() as usize != slot {
            anyhow::bail!("role {:?} is not in slot {}", role, slot);
        }
    }
    Ok(())
}
