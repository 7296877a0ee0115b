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

//! A library for the sandbox integration tests.
//!
//! Exports, as seen from the host (index 0 is the runner's type query):
//!
//! | index | export   | frame                                         |
//! |-------|----------|-----------------------------------------------|
//! | 1     | add      | `[0] = [1] + [2]`                             |
//! | 2     | crash    | aborts                                        |
//! | 3     | malloc42 | `[1]` = `malloc(42)`, filled with `0x2a`      |
//! | 4     | free     | `free([0])`                                   |

use heapbox_common::exports::ExportEntry;

/// Function indices the host calls this library's exports by.
pub mod index {
    pub const ADD: u32 = 1;
    pub const CRASH: u32 = 2;
    pub const MALLOC42: u32 = 3;
    pub const FREE: u32 = 4;
}

/// Type encoding of [`index::ADD`].
pub const ADD_TYPE: &str = "fn(u64, u64) -> u64";

fn slot(frame: *mut u8, n: usize) -> *mut u64 {
    frame.cast::<u64>().wrapping_add(n)
}

extern "C" fn add(frame: *mut u8) {
    // SAFETY: the runner passes a frame of at least three slots.
    unsafe {
        let sum = slot(frame, 1).read_unaligned().wrapping_add(slot(frame, 2).read_unaligned());
        slot(frame, 0).write_unaligned(sum);
    }
}

extern "C" fn crash(_frame: *mut u8) {
    std::process::abort();
}

extern "C" fn malloc42(frame: *mut u8) {
    // SAFETY: `malloc` binds to the runner's shared heap allocator.
    let ptr = unsafe { libc::malloc(42) }.cast::<u8>();
    if !ptr.is_null() {
        // SAFETY: 42 bytes were just allocated.
        unsafe { ptr.write_bytes(0x2a, 42) };
    }
    // SAFETY: as in `add`.
    unsafe { slot(frame, 1).write_unaligned(ptr as u64) };
}

extern "C" fn free(frame: *mut u8) {
    // SAFETY: the host passes back a pointer from `malloc42`.
    unsafe { libc::free(slot(frame, 0).read_unaligned() as *mut libc::c_void) };
}

static EXPORTS: [ExportEntry; 4] = [
    ExportEntry::new(add, c"fn(u64, u64) -> u64"),
    ExportEntry::new(crash, c"fn() -> !"),
    ExportEntry::new(malloc42, c"fn() -> *mut u8"),
    ExportEntry::untyped(free),
];

/// The table the runner looks up after loading this library.
///
/// # Safety
/// `count` must be writable.
#[no_mangle]
pub unsafe extern "C" fn heapbox_sandbox_exports(count: *mut usize) -> *const ExportEntry {
    // SAFETY: guaranteed by the caller.
    unsafe { count.write(EXPORTS.len()) };
    EXPORTS.as_ptr()
}
