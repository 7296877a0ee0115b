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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! The runtime linked into the sandboxed child.
//!
//! A child is started with the descriptor layout from
//! [`heapbox_common::fd_layout::ChildFd`] and the region location in its
//! environment. [`bootstrap`] maps the shared heap and the read-only pagemap
//! page, connects the heap to the host pagemap service and routes the
//! child's allocations into it, and returns the [`Guest`] that then serves
//! calls.

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use heapbox_common::fd_layout::ChildFd;
use heapbox_common::location::RegionLocation;
use heapbox_common::pagemap::PAGEMAP_PAGE_SIZE;
use heapbox_common::region::SharedRegionHeader;

/// Routing the child's allocations into the shared heap
pub mod allocator;
/// The child's view of the shared heap
pub mod heap;
/// Client side of the Host Call channel
pub mod host_service;
/// Loading the export table of the sandboxed library
pub mod library;
/// Minimal stderr logger for the child
pub mod logger;
/// The call-serving run loop
pub mod runloop;

pub use heapbox_common::exports::{ExportEntry, ExportedFn};
pub use runloop::{ExportTable, run};

fn map_fixed(location: RegionLocation) -> Result<()> {
    // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
    let ptr = unsafe {
        libc::mmap(
            location.base as *mut libc::c_void,
            location.size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
            ChildFd::SharedMemRegion.raw(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        bail!(
            "mapping the shared heap at {:#x} failed: {}",
            location.base,
            std::io::Error::last_os_error()
        );
    }
    if ptr as usize != location.base {
        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        // SAFETY: we just mapped this.
        unsafe { libc::munmap(ptr, location.size) };
        bail!(
            "shared heap landed at {:#x} instead of {:#x}",
            ptr as usize,
            location.base
        );
    }
    Ok(())
}

fn map_pagemap_page() -> Result<&'static [u8]> {
    // SAFETY: a fresh read-only mapping at a kernel-chosen address.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            PAGEMAP_PAGE_SIZE,
            libc::PROT_READ,
            libc::MAP_SHARED,
            ChildFd::PageMapPage.raw(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        bail!(
            "mapping the pagemap page failed: {}",
            std::io::Error::last_os_error()
        );
    }
    // SAFETY: the mapping lives for the rest of the process.
    Ok(unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), PAGEMAP_PAGE_SIZE) })
}

/// A bootstrapped child, ready to serve calls.
#[derive(Clone, Copy)]
pub struct Guest {
    header: &'static SharedRegionHeader,
}

impl Guest {
    /// The shared region header.
    pub fn header(&self) -> &'static SharedRegionHeader {
        self.header
    }

    /// Builds the export table for `entries`.
    ///
    /// # Safety
    /// As for [`ExportTable::new`].
    pub unsafe fn exports(&self, entries: &[ExportEntry]) -> Result<ExportTable> {
        // SAFETY: guaranteed by the caller.
        unsafe { ExportTable::new(entries) }
    }

    /// Serves calls into `exports` until the host asks the child to exit.
    pub fn run(self, exports: &ExportTable) -> ! {
        run(self.header, exports)
    }
}

/// Sets up the shared heap from the inherited descriptors.
///
/// Must be called once, before any exported function runs. The descriptors
/// for the region and the pagemap page are closed once mapped. From here on
/// the process allocates from the shared heap.
pub fn bootstrap() -> Result<Guest> {
    let location = RegionLocation::from_env()?;
    map_fixed(location)?;
    let pagemap = map_pagemap_page()?;
    // SAFETY: both descriptors were placed there by the launcher and nothing
    // else in this process owns them.
    unsafe {
        libc::close(ChildFd::SharedMemRegion.raw());
        libc::close(ChildFd::PageMapPage.raw());
    }

    // SAFETY: the region was initialised by the host before we were spawned
    // and stays mapped for the rest of the process.
    let header = unsafe { SharedRegionHeader::from_base(location.base) }
        .context("shared region has no header")?;
    let start = header.start.load(Ordering::Relaxed);
    let end = header.end.load(Ordering::Relaxed);
    if start < location.base || end > location.base + location.size || start >= end {
        bail!("declared heap {:#x}..{:#x} is outside the region", start, end);
    }

    // SAFETY: fd 7 is the Host Call channel and nothing else owns it.
    let channel = unsafe { OwnedFd::from_raw_fd(ChildFd::PageMapUpdates.raw()) };
    heap::install(host_service::HostServiceClient::new(channel), pagemap, header)?;
    allocator::enable(start, end);

    // SAFETY: prctl with constant arguments.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        log::warn!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        );
    }
    log::debug!("child heap ready at {:#x}..{:#x}", start, end);
    Ok(Guest { header })
}

/// Logs `err` and terminates the child. The host notices the exit through its
/// liveness check.
pub fn fatal(err: anyhow::Error) -> ! {
    log::error!("{:#}", err);
    std::process::exit(1)
}
