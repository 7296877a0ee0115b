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

/// The host side allocator for a sandbox's memory range
pub(crate) mod allocator;
/// The address span a sandbox's heap may occupy, and pointers into it
pub mod memory_range;
/// Bump allocation and free stacks of large blocks within a memory range
pub mod provider;
/// memfd-backed mappings shared with the child
pub mod shared_mem;
