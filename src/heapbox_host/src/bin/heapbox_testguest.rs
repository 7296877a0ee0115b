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

//! A runner with a built-in export table, used by the integration tests in
//! place of a real library.
//!
//! Index 0 is the built-in type query. Every export takes a frame of `u64`
//! slots:
//!
//! | index | export     | frame                                                  |
//! |-------|------------|--------------------------------------------------------|
//! | 1     | add        | `[0] = [1] + [2]`                                      |
//! | 2     | abort      | never returns                                          |
//! | 3     | exit       | `_exit([0])`                                           |
//! | 4     | alloc      | allocates `[0]` bytes filled with `0x5a`, `[1] = addr` |
//! | 5     | free       | frees `[0]`, `[1]` = 1 local, 2 remote, 0 on error     |
//! | 6     | raw_set    | Set Host Call with `[0]`, `[1]`, `[2] = error`         |
//! | 7     | entry      | `[1]` = pagemap byte for `[0]`                         |
//! | 8     | malloc     | `[1]` = `malloc([0])`, filled with `0x33`              |
//! | 9     | boxed      | `[1]` = address of a leaked `Vec` of `[0]` bytes       |

use std::ptr::NonNull;

use heapbox_common::host_call::HostCallKind;
use heapbox_guest::allocator::SharedHeapAlloc;
use heapbox_guest::heap::{self, Freed};
use heapbox_guest::logger::StderrLogger;
use heapbox_guest::{ExportEntry, bootstrap, fatal};
use log::LevelFilter;

#[global_allocator]
static ALLOCATOR: SharedHeapAlloc = SharedHeapAlloc;

heapbox_guest::export_shared_heap_allocator!();

fn slot(frame: *mut u8, n: usize) -> *mut u64 {
    frame.cast::<u64>().wrapping_add(n)
}

fn get(frame: *mut u8, n: usize) -> u64 {
    // SAFETY: the host hands over a frame inside the shared heap.
    unsafe { slot(frame, n).read_unaligned() }
}

fn set(frame: *mut u8, n: usize, value: u64) {
    // SAFETY: the host hands over a frame inside the shared heap.
    unsafe { slot(frame, n).write_unaligned(value) }
}

extern "C" fn add(frame: *mut u8) {
    set(frame, 0, get(frame, 1).wrapping_add(get(frame, 2)));
}

extern "C" fn abort(_frame: *mut u8) {
    std::process::abort();
}

extern "C" fn exit(frame: *mut u8) {
    // SAFETY: terminates the process immediately.
    unsafe { libc::_exit(get(frame, 0) as i32) }
}

extern "C" fn heap_alloc(frame: *mut u8) {
    let size = get(frame, 0) as usize;
    let addr = match heap::alloc(size) {
        Ok(Some(ptr)) => {
            // SAFETY: the allocation is at least `size` bytes.
            unsafe { ptr.as_ptr().write_bytes(0x5a, size) };
            ptr.as_ptr() as u64
        }
        Ok(None) => 0,
        Err(e) => fatal(e),
    };
    set(frame, 1, addr);
}

extern "C" fn heap_free(frame: *mut u8) {
    let outcome = match NonNull::new(get(frame, 0) as *mut u8).map(heap::free) {
        Some(Ok(Freed::Local)) => 1,
        Some(Ok(Freed::Remote)) => 2,
        Some(Err(e)) => {
            log::warn!("free failed: {:#}", e);
            0
        }
        None => 0,
    };
    set(frame, 1, outcome);
}

extern "C" fn raw_set(frame: *mut u8) {
    match heap::raw_host_call(HostCallKind::Set, get(frame, 0), get(frame, 1)) {
        Ok(response) => set(frame, 2, response.error),
        Err(e) => fatal(e),
    }
}

extern "C" fn entry(frame: *mut u8) {
    match heap::pagemap_entry(get(frame, 0) as usize) {
        Ok(entry) => set(frame, 1, entry.encode().into()),
        Err(e) => fatal(e),
    }
}

extern "C" fn c_malloc(frame: *mut u8) {
    let size = get(frame, 0) as usize;
    // SAFETY: resolves to the `malloc` this binary exports.
    let ptr = unsafe { libc::malloc(size) }.cast::<u8>();
    if !ptr.is_null() {
        // SAFETY: `malloc` returned at least `size` bytes.
        unsafe { ptr.write_bytes(0x33, size) };
    }
    set(frame, 1, ptr as u64);
}

extern "C" fn boxed(frame: *mut u8) {
    let bytes = vec![0x77u8; get(frame, 0) as usize].leak();
    set(frame, 1, bytes.as_ptr() as u64);
}

static EXPORTS: [ExportEntry; 9] = [
    ExportEntry::new(add, c"fn(u64, u64) -> u64"),
    ExportEntry::new(abort, c"fn() -> !"),
    ExportEntry::new(exit, c"fn(i32) -> !"),
    ExportEntry::new(heap_alloc, c"fn(usize) -> *mut u8"),
    ExportEntry::new(heap_free, c"fn(*mut u8) -> u64"),
    ExportEntry::untyped(raw_set),
    ExportEntry::untyped(entry),
    ExportEntry::new(c_malloc, c"fn(usize) -> *mut u8"),
    ExportEntry::new(boxed, c"fn(usize) -> *mut u8"),
];

fn main() {
    StderrLogger::initialize(LevelFilter::Warn);
    let guest = bootstrap().unwrap_or_else(|e| fatal(e));
    // SAFETY: the table and its strings are statics.
    let exports = unsafe { guest.exports(&EXPORTS) }.unwrap_or_else(|e| fatal(e));
    guest.run(&exports)
}
