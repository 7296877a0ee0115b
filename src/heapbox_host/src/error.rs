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

use std::error::Error;
use std::num::TryFromIntError;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{MutexGuard, PoisonError};

use thiserror::Error;

/// The error type for Heapbox operations
#[derive(Error, Debug)]
pub enum HeapboxError {
    /// Anyhow error
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// `element_size * count` does not fit in a `usize`
    #[error("Allocation of {1} elements of {0} bytes overflows")]
    AllocationOverflow(usize, usize),

    /// An address range reaches outside the sandbox's memory range
    #[error("Range {0:#x}+{1:#x} is outside the sandbox memory range")]
    BoundsCheckFailed(usize, usize),

    /// The sandboxed process exited while a call was in flight
    #[error("Sandboxed process exited during a call: {0}")]
    ChildExited(ExitStatus),

    /// The sandboxed process is no longer running
    #[error("Sandboxed process is not running")]
    ChildNotRunning(),

    /// CString conversion error
    #[error("Error converting CString {0:?}")]
    CStringConversionError(#[from] std::ffi::NulError),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// A pointer passed to a sandbox allocator was not allocated by it
    #[error("Pointer {0:#x} was not allocated by this sandbox")]
    ForeignPointer(usize),

    /// Reading Writing or Seeking data failed.
    #[error("Reading Writing or Seeking data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// Failed to convert to Integer
    #[error("Failed To Convert Size to usize")]
    IntConversionFailure(#[from] TryFromIntError),

    /// The library to sandbox could not be opened
    #[error("Cannot open library {0:?}: {1}")]
    LibraryOpenFailed(PathBuf, std::io::Error),

    /// The library to sandbox is not a regular file
    #[error("Library {0:?} is not a regular file")]
    LibraryNotAFile(PathBuf),

    /// A Mutex lock attempt failed
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// A function's declared type encoding is not the one the caller expected
    #[error("Function {0} has type encoding {2:?}, expected {1:?}")]
    FunctionTypeMismatch(u32, String, Option<String>),

    /// The child answered a type encoding query with something unusable
    #[error("Invalid type encoding reported for function {0}")]
    InvalidTypeEncoding(u32),

    /// mmap failed
    #[error("mmap failed with os error {0:?}")]
    MmapFailed(Option<i32>),

    /// The sandbox's memory range is exhausted
    #[error("Out of sandbox memory allocating {0} bytes")]
    OutOfSandboxMemory(usize),

    /// A memory range overlaps one already registered
    #[error("Memory range {0:#x}+{1:#x} overlaps a registered range")]
    RangeOverlap(usize, usize),

    /// The sandbox's range is not registered with the pagemap service
    #[error("Memory range is not registered with the pagemap service")]
    RangeNotRegistered(),

    /// The sandboxed process could not be started
    #[error("Failed to start the sandboxed process {0:?}: {1}")]
    SpawnFailed(PathBuf, std::io::Error),

    /// The child does not export the requested function
    #[error("Sandboxed library has no function with index {0}")]
    UnknownFunction(u32),
}

impl From<&str> for HeapboxError {
    fn from(s: &str) -> Self {
        HeapboxError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for HeapboxError {
    // Implemented this way rather than passing the error as a source to LockAttemptFailed as that would require
    // Box<dyn Error + Send + Sync> which is not easy to implement for PoisonError<MutexGuard<'_, T>>
    // This is a good enough solution and allows use to use the ? operator on lock() calls
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        HeapboxError::LockAttemptFailed(source)
    }
}

impl HeapboxError {
    /// Whether the error means the sandboxed process is gone, so every further
    /// call on the same sandbox will fail too.
    pub fn is_child_gone(&self) -> bool {
        // wildcard _ or matches! not used here purposefully to ensure that new error variants
        // are explicitly considered.
        match self {
            HeapboxError::ChildExited(_) | HeapboxError::ChildNotRunning() => true,

            HeapboxError::AnyhowError(_)
            | HeapboxError::AllocationOverflow(_, _)
            | HeapboxError::BoundsCheckFailed(_, _)
            | HeapboxError::CStringConversionError(_)
            | HeapboxError::Error(_)
            | HeapboxError::ForeignPointer(_)
            | HeapboxError::FunctionTypeMismatch(_, _, _)
            | HeapboxError::InvalidTypeEncoding(_)
            | HeapboxError::IOError(_)
            | HeapboxError::IntConversionFailure(_)
            | HeapboxError::LibraryOpenFailed(_, _)
            | HeapboxError::LibraryNotAFile(_)
            | HeapboxError::LockAttemptFailed(_)
            | HeapboxError::MmapFailed(_)
            | HeapboxError::OutOfSandboxMemory(_)
            | HeapboxError::RangeOverlap(_, _)
            | HeapboxError::RangeNotRegistered()
            | HeapboxError::SpawnFailed(_, _)
            | HeapboxError::UnknownFunction(_) => false,
        }
    }
}

/// Creates a `HeapboxError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::HeapboxError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::HeapboxError::Error(__err_msg)
    }};
}
