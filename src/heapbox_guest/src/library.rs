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

use std::ffi::CStr;

use anyhow::{Result, bail};
use heapbox_common::exports::{EXPORTS_SYMBOL, ExportEntry};
use heapbox_common::fd_layout::ChildFd;

type ExportsFn = unsafe extern "C" fn(*mut usize) -> *const ExportEntry;

fn dlerror() -> String {
    // SAFETY: dlerror returns null or a valid C string.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return "unknown error".to_string();
    }
    // SAFETY: checked for null above.
    unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
}

/// Loads the library passed in [`ChildFd::MainLibrary`] and returns its
/// export table. The library stays loaded for the life of the process.
///
/// Must run after [`crate::bootstrap`], so that the library's own
/// initialisers already allocate from the shared heap.
pub fn load_exports() -> Result<&'static [ExportEntry]> {
    let path = format!("/proc/self/fd/{}\0", ChildFd::MainLibrary.raw());
    // SAFETY: `path` is NUL terminated.
    let handle = unsafe { libc::dlopen(path.as_ptr().cast(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
    if handle.is_null() {
        bail!("dlopen of the sandboxed library failed: {}", dlerror());
    }
    // SAFETY: `handle` is a live library handle.
    let sym = unsafe { libc::dlsym(handle, EXPORTS_SYMBOL.as_ptr()) };
    if sym.is_null() {
        bail!(
            "sandboxed library does not export {:?}: {}",
            EXPORTS_SYMBOL,
            dlerror()
        );
    }
    // SAFETY: the symbol is documented to have this signature.
    let entry: ExportsFn = unsafe { std::mem::transmute::<*mut libc::c_void, ExportsFn>(sym) };
    let mut count = 0usize;
    // SAFETY: `count` is a valid out pointer.
    let table = unsafe { entry(&mut count) };
    if table.is_null() && count != 0 {
        bail!("sandboxed library returned a null export table");
    }
    if count == 0 {
        return Ok(&[]);
    }
    // SAFETY: the library promises `count` entries that live as long as it does,
    // and it is never unloaded.
    Ok(unsafe { std::slice::from_raw_parts(table, count) })
}
