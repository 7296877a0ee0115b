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

#![warn(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! This crate contains an SDK that is used to load untrusted shared libraries
//! into isolated child processes which share a heap with the host.
//!
//! Each [`SandboxedLibrary`] owns one child process and one shared memory
//! region. The child's allocator asks the host, through the process-wide
//! [`PagemapService`], before it may change heap metadata, and every request
//! is checked against the address range that sandbox owns.

/// Dealing with errors, including errors across the process boundary
pub mod error;
/// Starting the sandboxed child process
pub mod launcher;
/// Shared memory mappings, address ranges and the host side allocator
pub mod mem;
/// Metric definitions and helpers
pub mod metrics;
/// The canonical pagemap and the service that keeps children in sync with it
pub mod pagemap;
/// The host-side handle for a sandboxed library
pub mod sandbox;

/// The re-export for the `HeapboxError` type
pub use error::HeapboxError;
/// The bounds-checked address type for sandbox memory
pub use mem::memory_range::{MemoryRange, SandboxPtr};
/// The pagemap synchronization service shared by every sandbox
pub use pagemap::service::{MalformedRequestPolicy, PagemapService, ServiceConfiguration};
/// Configuration for a sandbox
pub use sandbox::config::SandboxConfiguration;
/// A library loaded into a sandboxed child
pub use sandbox::sandboxed_library::SandboxedLibrary;

/// The universal `Result` type used throughout the Heapbox codebase.
pub type Result<T> = core::result::Result<T, error::HeapboxError>;

/// Logs an error then returns with it, more or less equivalent to the bail! macro in anyhow
/// but for HeapboxError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::HeapboxError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {{
        let __err = $err;
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($fmtstr:expr, $($arg:tt)*) => {
           let __err_msg = std::format!($fmtstr, $($arg)*);
           let __err = $crate::error::HeapboxError::Error(__err_msg);
           log::error!("{}", __err);
           return Err(__err);
    };
}
