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

//! Entry point of a sandboxed child: sets up the shared heap, loads the
//! library handed over on descriptor 6 and serves calls into it.
//!
//! Once bootstrapped, every allocation in the child lands in the shared heap,
//! whether it comes from Rust code or from the library's own `malloc`.

use heapbox_guest::allocator::SharedHeapAlloc;
use heapbox_guest::library::load_exports;
use heapbox_guest::logger::StderrLogger;
use heapbox_guest::{bootstrap, fatal};
use log::LevelFilter;

#[global_allocator]
static ALLOCATOR: SharedHeapAlloc = SharedHeapAlloc;

heapbox_guest::export_shared_heap_allocator!();

fn main() {
    StderrLogger::initialize(LevelFilter::Warn);
    let guest = bootstrap().unwrap_or_else(|e| fatal(e));
    let entries = load_exports().unwrap_or_else(|e| fatal(e));
    // SAFETY: the library keeps its table and type strings alive while loaded,
    // and it is never unloaded.
    let exports = unsafe { guest.exports(entries) }.unwrap_or_else(|e| fatal(e));
    guest.run(&exports)
}
