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

use std::ptr;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, anyhow, bail};
use heapbox_common::exports::{
    ExportEntry, ExportedFn, MAX_TYPE_ENCODING_LEN, TYPE_ENCODING_FUNCTION, TYPE_QUERY_ADDR_SLOT,
    TYPE_QUERY_FUNCTION_SLOT, TYPE_QUERY_LEN_SLOT, library_index,
};
use heapbox_common::region::{CALL_OK, CALL_UNKNOWN_FUNCTION, SharedRegionHeader};
use heapbox_common::sync::ProcessSignal;

use crate::heap;

struct Export {
    function: ExportedFn,
    // address and length of the type encoding in the shared heap
    encoding: Option<(usize, usize)>,
}

/// A library's exports, with each type encoding copied into the shared heap
/// where the host can read it.
pub struct ExportTable {
    exports: Vec<Export>,
}

fn copy_to_shared(bytes: &[u8]) -> Result<(usize, usize)> {
    if bytes.len() > MAX_TYPE_ENCODING_LEN {
        bail!("type encoding of {} bytes is too long", bytes.len());
    }
    let ptr = heap::alloc(bytes.len().max(1))?
        .ok_or_else(|| anyhow!("no room in the shared heap for a type encoding"))?;
    // SAFETY: the allocation holds at least `bytes.len()` bytes.
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
    Ok((ptr.as_ptr() as usize, bytes.len()))
}

impl ExportTable {
    /// Builds the table for `entries`. Must run after [`crate::bootstrap`].
    ///
    /// # Safety
    /// Every non-null `type_encoding` in `entries` must point to a NUL
    /// terminated string.
    pub unsafe fn new(entries: &[ExportEntry]) -> Result<Self> {
        let exports = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                // SAFETY: guaranteed by the caller.
                let encoding = match unsafe { entry.type_encoding() } {
                    Some(bytes) => Some(
                        copy_to_shared(bytes)
                            .with_context(|| format!("exporting function {}", i))?,
                    ),
                    None => None,
                };
                Ok(Export {
                    function: entry.function,
                    encoding,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exports })
    }

    /// Number of library exports.
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Whether the library exports nothing.
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    fn get(&self, function_index: u32) -> Option<&Export> {
        self.exports.get(library_index(function_index)?)
    }

    /// Answers a type encoding query on `frame`.
    fn describe(&self, frame: *mut u64) {
        // SAFETY: the host hands over a frame of `TYPE_QUERY_SLOTS` slots
        // inside the shared heap.
        unsafe {
            let asked = frame.add(TYPE_QUERY_FUNCTION_SLOT).read_unaligned();
            let (addr, len) = u32::try_from(asked)
                .ok()
                .and_then(|index| self.get(index))
                .and_then(|export| export.encoding)
                .unwrap_or((0, 0));
            frame.add(TYPE_QUERY_ADDR_SLOT).write_unaligned(addr as u64);
            frame.add(TYPE_QUERY_LEN_SLOT).write_unaligned(len as u64);
        }
    }

    /// Runs `function_index` on `frame`. Returns the `CALL_*` status.
    fn dispatch(&self, function_index: u32, frame: *mut u8) -> u32 {
        if function_index == TYPE_ENCODING_FUNCTION {
            self.describe(frame.cast());
            return CALL_OK;
        }
        match self.get(function_index) {
            Some(export) => {
                (export.function)(frame);
                CALL_OK
            }
            None => {
                log::warn!("call to unknown function {}", function_index);
                CALL_UNKNOWN_FUNCTION
            }
        }
    }
}

/// Serves calls from the host until it asks the child to exit.
///
/// Each iteration waits for the host to signal that the child should run,
/// runs the requested export on the frame the host supplied, then signals
/// completion. The exit flag is checked on every wakeup.
pub fn run(header: &SharedRegionHeader, exports: &ExportTable) -> ! {
    loop {
        if let Err(e) = header.signal.wait(true) {
            crate::fatal(e.context("waiting for a call"));
        }
        if header.should_exit.load(Ordering::Acquire) {
            log::debug!("host requested exit");
            std::process::exit(0);
        }

        let index = header.function_index.load(Ordering::Acquire);
        let frame = header.msg_buffer.load(Ordering::Acquire) as *mut u8;
        header.call_status.store(CALL_OK, Ordering::Release);
        let status = exports.dispatch(index, frame);
        header.call_status.store(status, Ordering::Release);

        if let Err(e) = header.signal.signal(false) {
            crate::fatal(e.context("signalling call completion"));
        }
    }
}

#[cfg(test)]
mod tests {
    use heapbox_common::exports::{FIRST_LIBRARY_FUNCTION, TYPE_QUERY_SLOTS};

    use super::*;

    extern "C" fn double(frame: *mut u8) {
        let slot = frame.cast::<u64>();
        unsafe { slot.write(slot.read() * 2) };
    }

    fn table() -> ExportTable {
        // Encodings are left out: copying them needs a bootstrapped heap.
        ExportTable {
            exports: vec![
                Export {
                    function: double,
                    encoding: Some((0x4000_0010, 12)),
                },
                Export {
                    function: double,
                    encoding: None,
                },
            ],
        }
    }

    #[test]
    fn library_functions_are_offset_by_the_built_ins() {
        let table = table();
        let mut frame = [21u64; TYPE_QUERY_SLOTS];
        let status = table.dispatch(FIRST_LIBRARY_FUNCTION, frame.as_mut_ptr().cast());
        assert_eq!(status, CALL_OK);
        assert_eq!(frame[0], 42);
        assert_eq!(table.dispatch(3, frame.as_mut_ptr().cast()), CALL_UNKNOWN_FUNCTION);
        assert_eq!(frame[0], 42);
    }

    #[test]
    fn type_queries_report_the_shared_copy() {
        let table = table();
        let mut frame = [FIRST_LIBRARY_FUNCTION as u64, 7, 7];
        let status = table.dispatch(TYPE_ENCODING_FUNCTION, frame.as_mut_ptr().cast());
        assert_eq!(status, CALL_OK);
        assert_eq!(frame, [1, 0x4000_0010, 12]);

        // untyped, built-in and unknown functions have no encoding
        for asked in [2, 0, 9, u64::MAX] {
            let mut frame = [asked, 7, 7];
            table.dispatch(TYPE_ENCODING_FUNCTION, frame.as_mut_ptr().cast());
            assert_eq!(frame[1..], [0, 0], "function {}", asked);
        }
    }

    #[test]
    fn encodings_need_a_bootstrapped_heap() {
        let entries = [ExportEntry::new(double, c"fn(u64) -> u64")];
        assert!(unsafe { ExportTable::new(&entries) }.is_err());
        let untyped = [ExportEntry::untyped(double)];
        assert_eq!(unsafe { ExportTable::new(&untyped) }.unwrap().len(), 1);
    }
}
