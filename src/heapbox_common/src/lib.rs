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

//! Types and layouts shared by the heapbox host and the sandboxed child.
//!
//! Everything in this crate describes memory or messages that cross the
//! process boundary, so layouts are `repr(C)` and sizes are pinned with
//! compile-time assertions.

/// Size-class allocator used by both sides of the shared heap
pub mod alloc;
/// The export table ABI between the runner and a sandboxed library
pub mod exports;
/// The fixed descriptor layout a sandboxed child is started with
pub mod fd_layout;
/// Host Call request/response records exchanged over the pagemap channel
pub mod host_call;
/// Encoding of the shared region location passed through the environment
pub mod location;
/// Pagemap geometry and entry encoding
pub mod pagemap;
/// The header placed at the base of every shared memory region
pub mod region;
/// Cross-process wait/signal primitive
pub mod sync;

/// The size of a host page.
pub const PAGE_SIZE: usize = 0x1_000; // 4KB
