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

#![no_main]

use heapbox_common::host_call::HostCallRequest;
use heapbox_common::pagemap::CHUNK_SIZE;
use heapbox_host::MemoryRange;
use heapbox_host::mem::provider::MemoryProvider;
use heapbox_host::mem::shared_mem::SharedMemory;
use heapbox_host::pagemap::service::{RangeState, process_request};
use heapbox_host::pagemap::table::PagemapTable;
use libfuzzer_sys::fuzz_target;

// A range one chunk into a 64MiB aligned block, like a freshly created sandbox.
const BASE: usize = (128 << 30) + CHUNK_SIZE;
const SIZE: usize = (64 << 20) - CHUNK_SIZE;

// Feeds sequences of arbitrary Host Calls to the validator and checks that no
// request ever touches the canonical pagemap outside the sandbox's range.
fuzz_target!(|requests: Vec<HostCallRequest>| {
    let Some(range) = MemoryRange::new(BASE, SIZE) else {
        return;
    };
    let Ok(page) = SharedMemory::new_page() else {
        return;
    };
    let mut table = PagemapTable::new();
    let mut state = RangeState::new(MemoryProvider::new(range), page);

    for request in &requests {
        let response = process_request(&mut table, &mut state, request);
        assert!(response.error <= 1);

        let addr = request.arg0 as usize;
        if !range.contains(addr, 1) {
            assert_eq!(table.get(addr), 0, "entry written outside the range: {:?}", request);
        }
        if response.is_ok() && response.result != 0 {
            assert!(range.contains(response.result as usize, CHUNK_SIZE));
        }
    }
    assert_eq!(table.get(range.base() - CHUNK_SIZE), 0);
    assert_eq!(table.get(range.end()), 0);
});
