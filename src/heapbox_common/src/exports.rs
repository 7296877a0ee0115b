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

//! The table a sandboxed library hands to the runner.
//!
//! A library exports one symbol, [`EXPORTS_SYMBOL`]:
//!
//! ```c
//! struct heapbox_export { void (*function)(void *frame); const char *type_encoding; };
//! const struct heapbox_export *heapbox_sandbox_exports(size_t *count);
//! ```
//!
//! Function index [`TYPE_ENCODING_FUNCTION`] is answered by the runner
//! itself. Library entry `i` is called as function index `i + 1`.

use std::ffi::{CStr, c_char};

/// An exported function. It receives the call's argument/result frame.
pub type ExportedFn = extern "C" fn(*mut u8);

/// Symbol a sandboxed library must export. Its signature is
/// `extern "C" fn(count: *mut usize) -> *const ExportEntry`.
pub const EXPORTS_SYMBOL: &CStr = c"heapbox_sandbox_exports";

/// Function index of the runner's built-in type encoding query.
pub const TYPE_ENCODING_FUNCTION: u32 = 0;
/// Function index of the library's first export.
pub const FIRST_LIBRARY_FUNCTION: u32 = 1;

/// Longest type encoding the runner copies into the shared heap.
pub const MAX_TYPE_ENCODING_LEN: usize = 4096;

/// Frame slot holding the function index a type encoding query asks about.
pub const TYPE_QUERY_FUNCTION_SLOT: usize = 0;
/// Frame slot the runner stores the encoding's address in, 0 if none.
pub const TYPE_QUERY_ADDR_SLOT: usize = 1;
/// Frame slot the runner stores the encoding's length in.
pub const TYPE_QUERY_LEN_SLOT: usize = 2;
/// `u64` slots in a type encoding query frame.
pub const TYPE_QUERY_SLOTS: usize = 3;

/// One entry of a library's export table.
///
/// `type_encoding` is a NUL terminated string describing the function's
/// frame, or null. The host compares it byte for byte against what a caller
/// expects; its format is up to the library and its callers.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ExportEntry {
    /// The function
    pub function: ExportedFn,
    /// Its type encoding, or null
    pub type_encoding: *const c_char,
}

// SAFETY: entries are immutable and the encoding is a static string.
unsafe impl Sync for ExportEntry {}
unsafe impl Send for ExportEntry {}

impl ExportEntry {
    /// An entry for `function` described by `type_encoding`.
    pub const fn new(function: ExportedFn, type_encoding: &'static CStr) -> Self {
        Self {
            function,
            type_encoding: type_encoding.as_ptr(),
        }
    }

    /// An entry without a type encoding.
    pub const fn untyped(function: ExportedFn) -> Self {
        Self {
            function,
            type_encoding: std::ptr::null(),
        }
    }

    /// The entry's type encoding bytes, without the terminator.
    ///
    /// # Safety
    /// `type_encoding` must be null or point to a NUL terminated string that
    /// outlives `'a`.
    pub unsafe fn type_encoding<'a>(&self) -> Option<&'a [u8]> {
        if self.type_encoding.is_null() {
            return None;
        }
        // SAFETY: guaranteed by the caller.
        Some(unsafe { CStr::from_ptr(self.type_encoding) }.to_bytes())
    }
}

/// The library export table index for `function_index`, if it names a
/// library export rather than a runner built-in.
pub fn library_index(function_index: u32) -> Option<usize> {
    function_index
        .checked_sub(FIRST_LIBRARY_FUNCTION)
        .map(|i| i as usize)
}
