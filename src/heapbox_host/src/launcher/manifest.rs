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

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use heapbox_common::fd_layout::{ChildFd, validate_layout};

use crate::Result;

/// The descriptors a child starts with, each paired with the slot it must
/// land in. Standard streams are inherited and not listed.
#[derive(Debug)]
pub(crate) struct DescriptorManifest {
    entries: Vec<(ChildFd, OwnedFd)>,
}

impl DescriptorManifest {
    pub(crate) fn new(
        shared_mem: OwnedFd,
        pagemap_page: OwnedFd,
        fd_socket: OwnedFd,
        library: OwnedFd,
        pagemap_updates: OwnedFd,
        library_dirs: Vec<OwnedFd>,
    ) -> Result<Self> {
        let mut entries = vec![
            (ChildFd::SharedMemRegion, shared_mem),
            (ChildFd::PageMapPage, pagemap_page),
            (ChildFd::FdSocket, fd_socket),
            (ChildFd::MainLibrary, library),
            (ChildFd::PageMapUpdates, pagemap_updates),
        ];
        for (n, dir) in library_dirs.into_iter().enumerate() {
            entries.push((ChildFd::OtherLibraries(u16::try_from(n)?), dir));
        }
        let manifest = Self { entries };
        validate_layout(&manifest.roles())?;
        Ok(manifest)
    }

    /// Every role in slot order, standard streams included.
    pub(crate) fn roles(&self) -> Vec<ChildFd> {
        [ChildFd::Stdin, ChildFd::Stdout, ChildFd::Stderr]
            .into_iter()
            .chain(self.entries.iter().map(|(role, _)| *role))
            .collect()
    }

    /// `(slot, current descriptor)` for every listed entry.
    pub(crate) fn moves(&self) -> Vec<(RawFd, RawFd)> {
        self.entries
            .iter()
            .map(|(role, fd)| (role.raw(), fd.as_raw_fd()))
            .collect()
    }

    /// The highest slot the child uses.
    pub(crate) fn last_slot(&self) -> RawFd {
        self.entries
            .last()
            .map_or(ChildFd::Stderr.raw(), |(role, _)| role.raw())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    fn fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn slots_follow_the_fixed_layout() {
        let manifest = DescriptorManifest::new(fd(), fd(), fd(), fd(), fd(), vec![fd(), fd()]).unwrap();
        let slots: Vec<RawFd> = manifest.moves().iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(manifest.last_slot(), 9);
        assert_eq!(manifest.roles().len(), 10);
        assert_eq!(manifest.roles()[7], ChildFd::PageMapUpdates);
    }

    #[test]
    fn no_library_dirs_ends_at_the_updates_socket() {
        let manifest = DescriptorManifest::new(fd(), fd(), fd(), fd(), fd(), Vec::new()).unwrap();
        assert_eq!(manifest.last_slot(), ChildFd::PageMapUpdates.raw());
    }
}
