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

//! Routes the child's allocations into the shared heap.
//!
//! Once [`crate::bootstrap`] has installed the child heap, every allocation
//! made in the child comes from the sandbox's range: Rust code through
//! [`SharedHeapAlloc`], C code through the `malloc` family that
//! [`export_shared_heap_allocator!`](crate::export_shared_heap_allocator)
//! defines in the runner. Before that, and while a thread is inside the
//! child heap itself, allocations fall back to the C library's private heap.
//! Frees are routed by address, so either kind of pointer can be freed at any
//! time.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap;

/// Alignment `malloc` guarantees.
pub const MIN_ALIGN: usize = 16;

// glibc's own allocator, reachable even when `malloc` is interposed.
extern "C" {
    fn __libc_malloc(size: usize) -> *mut c_void;
    fn __libc_calloc(count: usize, size: usize) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
    fn __libc_memalign(align: usize, size: usize) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
}

static HEAP_START: AtomicUsize = AtomicUsize::new(0);
static HEAP_END: AtomicUsize = AtomicUsize::new(0);

/// Starts serving allocations from the shared heap `[start, end)`.
pub(crate) fn enable(start: usize, end: usize) {
    HEAP_START.store(start, Ordering::Release);
    HEAP_END.store(end, Ordering::Release);
}

/// Whether `addr` is inside the shared heap.
pub fn in_shared_heap(addr: usize) -> bool {
    addr >= HEAP_START.load(Ordering::Acquire) && addr < HEAP_END.load(Ordering::Acquire)
}

/// Runs `f` against the shared heap. `None` if the heap is not enabled yet
/// or this thread is already inside it, in which case the caller must use
/// the private heap.
fn with_shared<T>(f: impl FnOnce() -> T) -> Option<T> {
    if HEAP_END.load(Ordering::Acquire) == 0 || heap::inside_heap() {
        return None;
    }
    Some(f())
}

fn private_alloc(size: usize, align: usize) -> *mut u8 {
    // SAFETY: plain C allocator calls.
    unsafe {
        if align <= MIN_ALIGN {
            __libc_malloc(size).cast()
        } else {
            __libc_memalign(align, size).cast()
        }
    }
}

/// Allocates `size` bytes aligned to `align`, a power of two. Null when the
/// sandbox's range is exhausted or the host refuses the heap's Host Calls.
pub fn allocate(size: usize, align: usize) -> *mut u8 {
    let shared = with_shared(|| match heap::alloc(size.max(align)) {
        Ok(found) => found.map_or(ptr::null_mut(), NonNull::as_ptr),
        Err(e) => {
            log::error!("shared heap allocation of {} bytes failed: {:#}", size, e);
            ptr::null_mut()
        }
    });
    shared.unwrap_or_else(|| private_alloc(size, align))
}

/// Allocates `count * size` zeroed bytes. Null on overflow.
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    if HEAP_END.load(Ordering::Acquire) == 0 {
        // SAFETY: plain C allocator call.
        return unsafe { __libc_calloc(count, size).cast() };
    }
    let ptr = allocate(total, MIN_ALIGN);
    if !ptr.is_null() {
        // Chunks are recycled, so shared memory is not necessarily zero.
        // SAFETY: `ptr` has room for `total` bytes.
        unsafe { ptr.write_bytes(0, total) };
    }
    ptr
}

/// Frees `ptr`, wherever it came from.
///
/// # Safety
/// `ptr` must be null or a live allocation from this module or the C
/// library's allocator.
pub unsafe fn deallocate(ptr: *mut u8) {
    let Some(nonnull) = NonNull::new(ptr) else {
        return;
    };
    if !in_shared_heap(ptr as usize) {
        // SAFETY: not a shared heap pointer, so the C library owns it.
        unsafe { __libc_free(ptr.cast()) };
        return;
    }
    let freed = with_shared(|| {
        if let Err(e) = heap::free(nonnull) {
            log::warn!("{:#}", e);
        }
    });
    if freed.is_none() {
        log::warn!("leaking {:#x}, freed from inside the child heap", ptr as usize);
    }
}

/// Resizes `ptr` to `size` bytes, moving it if needed.
///
/// # Safety
/// As for [`deallocate`].
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(size, MIN_ALIGN);
    }
    if !in_shared_heap(ptr as usize) {
        // SAFETY: the C library owns `ptr`.
        return unsafe { __libc_realloc(ptr.cast(), size).cast() };
    }
    let Some(old_size) = usable_size(ptr) else {
        log::warn!("realloc of {:#x}, which the child heap did not hand out", ptr as usize);
        return ptr::null_mut();
    };
    if size <= old_size {
        return ptr;
    }
    let new = allocate(size, MIN_ALIGN);
    if !new.is_null() {
        // SAFETY: both blocks are live and at least `old_size` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size);
            deallocate(ptr);
        }
    }
    new
}

/// Allocates `size` bytes aligned to `align` for the C aligned allocation
/// functions. Null if `align` is not a power of two.
pub fn allocate_aligned(align: usize, size: usize) -> *mut u8 {
    if !align.is_power_of_two() {
        return ptr::null_mut();
    }
    allocate(size, align)
}

/// `posix_memalign`: stores an allocation of `size` bytes aligned to `align`
/// in `out`.
///
/// # Safety
/// `out` must be valid for a pointer write.
pub unsafe fn allocate_into(out: *mut *mut c_void, align: usize, size: usize) -> libc::c_int {
    if align % std::mem::size_of::<usize>() != 0 {
        return libc::EINVAL;
    }
    let ptr = allocate_aligned(align, size);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    // SAFETY: guaranteed by the caller.
    unsafe { out.write(ptr.cast()) };
    0
}

/// The usable size of a shared heap allocation made by the child.
pub fn usable_size(ptr: *mut u8) -> Option<usize> {
    with_shared(|| heap::usable_size(ptr as usize).ok().flatten()).flatten()
}

/// The child's Rust allocator.
pub struct SharedHeapAlloc;

unsafe impl GlobalAlloc for SharedHeapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate(layout.size(), layout.align())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = allocate(layout.size(), layout.align());
        if !ptr.is_null() {
            // SAFETY: `ptr` has room for the layout.
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc`.
        unsafe { deallocate(ptr) }
    }
}

/// Defines the C allocation functions in the calling binary, backed by the
/// shared heap.
///
/// Libraries the binary later `dlopen`s bind to these definitions as long as
/// the binary exports its dynamic symbols (`-Wl,--export-dynamic`).
#[macro_export]
macro_rules! export_shared_heap_allocator {
    () => {
        #[no_mangle]
        pub extern "C" fn malloc(size: usize) -> *mut ::std::ffi::c_void {
            $crate::allocator::allocate(size, $crate::allocator::MIN_ALIGN).cast()
        }

        #[no_mangle]
        pub extern "C" fn calloc(count: usize, size: usize) -> *mut ::std::ffi::c_void {
            $crate::allocator::allocate_zeroed(count, size).cast()
        }

        #[no_mangle]
        pub unsafe extern "C" fn realloc(
            ptr: *mut ::std::ffi::c_void,
            size: usize,
        ) -> *mut ::std::ffi::c_void {
            // SAFETY: the caller passes a pointer from this allocator.
            unsafe {
                if size == 0 {
                    $crate::allocator::deallocate(ptr.cast());
                    return ::std::ptr::null_mut();
                }
                $crate::allocator::reallocate(ptr.cast(), size).cast()
            }
        }

        #[no_mangle]
        pub unsafe extern "C" fn free(ptr: *mut ::std::ffi::c_void) {
            // SAFETY: the caller passes a pointer from this allocator.
            unsafe { $crate::allocator::deallocate(ptr.cast()) }
        }

        #[no_mangle]
        pub extern "C" fn memalign(align: usize, size: usize) -> *mut ::std::ffi::c_void {
            $crate::allocator::allocate_aligned(align, size).cast()
        }

        #[no_mangle]
        pub extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut ::std::ffi::c_void {
            $crate::allocator::allocate_aligned(align, size).cast()
        }

        #[no_mangle]
        pub unsafe extern "C" fn posix_memalign(
            out: *mut *mut ::std::ffi::c_void,
            align: usize,
            size: usize,
        ) -> ::std::ffi::c_int {
            // SAFETY: the caller passes a writable `out`.
            unsafe { $crate::allocator::allocate_into(out, align, size) }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // The child heap is never enabled in this test binary, so everything here
    // exercises the private fallback.

    #[test]
    fn allocations_fall_back_to_the_private_heap_before_bootstrap() {
        let ptr = allocate(64, MIN_ALIGN);
        assert!(!ptr.is_null());
        assert!(!in_shared_heap(ptr as usize));
        unsafe {
            ptr.write_bytes(0xa5, 64);
            let ptr = reallocate(ptr, 4096);
            assert!(!ptr.is_null());
            assert_eq!(*ptr.add(63), 0xa5);
            deallocate(ptr);
        }
    }

    #[test]
    fn aligned_and_zeroed_requests() {
        let ptr = allocate_aligned(4096, 100);
        assert_eq!(ptr as usize % 4096, 0);
        assert!(allocate_aligned(24, 100).is_null());
        unsafe { deallocate(ptr) };

        let zeroed = allocate_zeroed(16, 16);
        assert!(unsafe { std::slice::from_raw_parts(zeroed, 256) }
            .iter()
            .all(|b| *b == 0));
        unsafe { deallocate(zeroed) };
        assert!(allocate_zeroed(usize::MAX, 2).is_null());

        let mut out = ptr::null_mut();
        assert_eq!(unsafe { allocate_into(&mut out, 12, 8) }, libc::EINVAL);
        assert_eq!(unsafe { allocate_into(&mut out, 64, 8) }, 0);
        assert_eq!(out as usize % 64, 0);
        unsafe { deallocate(out.cast()) };
    }

    #[test]
    fn nothing_is_shared_until_enabled() {
        assert!(!in_shared_heap(0));
        assert!(!in_shared_heap(0x7f00_0000_0000));
        assert_eq!(with_shared(|| ()), None);
        unsafe { deallocate(ptr::null_mut()) };
    }
}
