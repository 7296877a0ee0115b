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

use std::ffi::{CStr, c_void};
use std::io::Error;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::null_mut;

use heapbox_common::PAGE_SIZE;
use tracing::{Span, instrument};

use crate::HeapboxError::MmapFailed;
use crate::{Result, log_then_return, new_error};

/// Makes sure that the given `offset` and `size` are within the bounds of the memory with size `mem_size`.
macro_rules! bounds_check {
    ($offset:expr, $size:expr, $mem_size:expr) => {
        if $offset.checked_add($size).map_or(true, |end| end > $mem_size) {
            return Err(new_error!(
                "Cannot access offset {} with size {} in memory of size {}",
                $offset,
                $size,
                $mem_size
            ));
        }
    };
}

/// A representation of a host mapping of a shared memory region,
/// which will be released when this structure is Drop'd.
#[derive(Debug)]
struct HostMapping {
    ptr: *mut u8,
    size: usize,
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: we own the mapping.
        if unsafe { libc::munmap(self.ptr as *mut c_void, self.size) } != 0 {
            tracing::error!(
                "Failed to drop HostMapping (munmap failed): {:?}",
                Error::last_os_error()
            );
        }
    }
}

/// An unsafe marker trait for types for which all bit patterns are valid.
/// This is required in order for it to be safe to read a value of a particular
/// type out of memory the sandbox can write.
///
/// # Safety
/// This must only be implemented for types for which all bit patterns
/// are valid.
pub unsafe trait AllValid {}
unsafe impl AllValid for u8 {}
unsafe impl AllValid for u16 {}
unsafe impl AllValid for u32 {}
unsafe impl AllValid for u64 {}
unsafe impl AllValid for usize {}
unsafe impl AllValid for i32 {}
unsafe impl AllValid for i64 {}

/// A memfd and the host's read/write mapping of it.
///
/// The descriptor is what gets handed to the child; the mapping is the
/// host's view. Both are released on drop.
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    mapping: HostMapping,
}

// SharedMemory only hands out copies and explicitly bounds-checked
// accesses, and the region it maps is meant to be shared between
// processes anyway.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn memfd(name: &CStr, size: usize) -> Result<OwnedFd> {
    // SAFETY: `name` is a valid C string.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        log_then_return!(new_error!(
            "memfd_create failed: {:?}",
            Error::last_os_error()
        ));
    }
    // SAFETY: memfd_create returned a fresh descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: plain syscall on a descriptor we own.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), libc::off_t::try_from(size)?) } != 0 {
        log_then_return!(new_error!(
            "sizing shared memory to {} bytes failed: {:?}",
            size,
            Error::last_os_error()
        ));
    }
    Ok(fd)
}

impl SharedMemory {
    /// Creates a region of `1 << size_bits` bytes, mapped at an address
    /// aligned to its own size.
    ///
    /// Alignment lets every large block carved from the region be aligned
    /// to its size, and keeps the whole region inside one pagemap page.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new_aligned(size_bits: usize) -> Result<Self> {
        let size = 1usize
            .checked_shl(size_bits as u32)
            .filter(|s| *s >= PAGE_SIZE && *s <= isize::MAX as usize / 2)
            .ok_or_else(|| new_error!("Cannot create shared memory of 2^{} bytes", size_bits))?;
        let fd = memfd(c"heapbox-shm", size)?;

        // Reserve twice the size so an aligned window is guaranteed, then
        // trim the excess on both sides.
        let reserve_size = 2 * size;
        // SAFETY: a fresh anonymous reservation.
        let reserved = unsafe {
            libc::mmap(
                null_mut(),
                reserve_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            log_then_return!(MmapFailed(Error::last_os_error().raw_os_error()));
        }
        let reserved = reserved as usize;
        let aligned = reserved.next_multiple_of(size);
        // SAFETY: both trimmed spans lie inside our reservation.
        unsafe {
            if aligned > reserved {
                libc::munmap(reserved as *mut c_void, aligned - reserved);
            }
            let tail = aligned + size;
            let reserved_end = reserved + reserve_size;
            if reserved_end > tail {
                libc::munmap(tail as *mut c_void, reserved_end - tail);
            }
        }

        // SAFETY: replaces our own reservation at `aligned`.
        let addr = unsafe {
            libc::mmap(
                aligned as *mut c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = Error::last_os_error();
            // SAFETY: still our reservation.
            unsafe { libc::munmap(aligned as *mut c_void, size) };
            log_then_return!(MmapFailed(err.raw_os_error()));
        }

        Ok(Self {
            fd,
            mapping: HostMapping {
                ptr: addr as *mut u8,
                size,
            },
        })
    }

    /// Creates a single page of shared memory at any address.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new_page() -> Result<Self> {
        let fd = memfd(c"heapbox-pagemap", PAGE_SIZE)?;
        // SAFETY: a fresh mapping at a kernel-chosen address.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log_then_return!(MmapFailed(Error::last_os_error().raw_os_error()));
        }
        Ok(Self {
            fd,
            mapping: HostMapping {
                ptr: addr as *mut u8,
                size: PAGE_SIZE,
            },
        })
    }

    /// Address of the host's mapping.
    pub fn base_addr(&self) -> usize {
        self.mapping.ptr as usize
    }

    /// Size of the mapping in bytes.
    pub fn mem_size(&self) -> usize {
        self.mapping.size
    }

    /// A duplicate of the backing memfd, for handing to a child.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    /// Copies `slice.len()` bytes starting at `offset` out of the mapping.
    pub fn copy_to_slice(&self, slice: &mut [u8], offset: usize) -> Result<()> {
        bounds_check!(offset, slice.len(), self.mem_size());
        // SAFETY: bounds checked above, the mapping is live.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.ptr.add(offset),
                slice.as_mut_ptr(),
                slice.len(),
            )
        };
        Ok(())
    }

    /// Copies `slice` into the mapping starting at `offset`.
    pub fn copy_from_slice(&self, slice: &[u8], offset: usize) -> Result<()> {
        bounds_check!(offset, slice.len(), self.mem_size());
        // SAFETY: bounds checked above, the mapping is live.
        unsafe {
            std::ptr::copy_nonoverlapping(slice.as_ptr(), self.mapping.ptr.add(offset), slice.len())
        };
        Ok(())
    }

    /// The whole mapping as bytes. The child may read the memory at any
    /// time, but nothing else in this process can reach it while the borrow
    /// lives.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is live for as long as `self`, and the
        // exclusive borrow of `self` covers every host-side access.
        unsafe { std::slice::from_raw_parts_mut(self.mapping.ptr, self.mapping.size) }
    }

    /// Read a value of type T, whose representation is the same
    /// between the sandbox and the host, and which has no invalid bit
    /// patterns
    pub fn read<T: AllValid>(&self, offset: usize) -> Result<T> {
        bounds_check!(offset, std::mem::size_of::<T>(), self.mem_size());
        // SAFETY: bounds checked above, and every bit pattern is a valid T.
        Ok(unsafe { std::ptr::read_unaligned(self.mapping.ptr.add(offset) as *const T) })
    }

    /// Write a value of type T, whose representation is the same
    /// between the sandbox and the host, and which has no invalid bit
    /// patterns
    pub fn write<T: AllValid>(&self, offset: usize, data: T) -> Result<()> {
        bounds_check!(offset, std::mem::size_of::<T>(), self.mem_size());
        // SAFETY: bounds checked above.
        unsafe { std::ptr::write_unaligned(self.mapping.ptr.add(offset) as *mut T, data) };
        Ok(())
    }
}

impl AsFd for SharedMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_regions_are_aligned() {
        let mem = SharedMemory::new_aligned(22).unwrap();
        assert_eq!(mem.mem_size(), 1 << 22);
        assert_eq!(mem.base_addr() % (1 << 22), 0);
    }

    #[test]
    fn accesses_are_bounds_checked() {
        let mem = SharedMemory::new_page().unwrap();
        mem.write::<u64>(8, 0xfeed).unwrap();
        assert_eq!(mem.read::<u64>(8).unwrap(), 0xfeed);
        assert!(mem.read::<u64>(PAGE_SIZE - 4).is_err());
        assert!(mem.write::<u32>(usize::MAX, 1).is_err());
        let mut buf = [0u8; 16];
        assert!(mem.copy_to_slice(&mut buf, PAGE_SIZE - 8).is_err());
        mem.copy_from_slice(&[1, 2, 3], 0).unwrap();
        mem.copy_to_slice(&mut buf[..3], 0).unwrap();
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn memfd_is_shared_between_mappings() {
        let mem = SharedMemory::new_page().unwrap();
        let fd = mem.try_clone_fd().unwrap();
        let other = unsafe {
            libc::mmap(
                null_mut(),
                PAGE_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        assert_ne!(other, libc::MAP_FAILED);
        mem.write::<u32>(0, 0xabcd).unwrap();
        assert_eq!(unsafe { *(other as *const u32) }, 0xabcd);
        unsafe { libc::munmap(other, PAGE_SIZE) };
    }

    #[test]
    fn rejects_nonsense_sizes() {
        assert!(SharedMemory::new_aligned(2).is_err());
        assert!(SharedMemory::new_aligned(200).is_err());
    }
}
