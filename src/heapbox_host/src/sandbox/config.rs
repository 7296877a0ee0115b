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

use std::cmp::{max, min};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{Span, instrument};

use crate::launcher::DEFAULT_LIBRARY_DIRS;

/// The complete set of configuration needed to create a sandbox
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SandboxConfiguration {
    /// log2 of the size of the shared region, header chunk included.
    heap_size_bits: u8,
    /// How long a call waits on the condition variable before checking
    /// whether the child is still alive, in milliseconds.
    call_poll_interval: u16,
    /// How long each shutdown stage waits for the child, in milliseconds.
    shutdown_timeout: u16,
    /// The runner executable. `None` means `heapbox_runner` next to the
    /// current executable.
    runner_path: Option<PathBuf>,
    /// Directories handed to the child's run-time linker.
    library_dirs: Vec<PathBuf>,
}

fn clamp_millis(value: Duration, default: u16, minimum: u16, maximum: u16) -> u16 {
    match value.as_millis() {
        0 => default,
        1.. => min(maximum.into(), max(value.as_millis(), minimum.into())) as u16,
    }
}

impl SandboxConfiguration {
    /// The default shared region size (64MiB)
    pub const DEFAULT_HEAP_SIZE_BITS: u8 = 26;
    /// The smallest shared region: the header chunk plus one chunk of heap
    pub const MIN_HEAP_SIZE_BITS: u8 = 21;
    /// The largest shared region, which still fits in one pagemap page
    pub const MAX_HEAP_SIZE_BITS: u8 = 32;
    /// The default call poll interval (in milliseconds)
    pub const DEFAULT_CALL_POLL_INTERVAL: u16 = 100;
    /// The minimum call poll interval (in milliseconds)
    pub const MIN_CALL_POLL_INTERVAL: u16 = 1;
    /// The maximum call poll interval (in milliseconds)
    pub const MAX_CALL_POLL_INTERVAL: u16 = 1000;
    /// The default time each shutdown stage waits (in milliseconds)
    pub const DEFAULT_SHUTDOWN_TIMEOUT: u16 = 1000;
    /// The minimum time each shutdown stage waits (in milliseconds)
    pub const MIN_SHUTDOWN_TIMEOUT: u16 = 10;
    /// The maximum time each shutdown stage waits (in milliseconds)
    pub const MAX_SHUTDOWN_TIMEOUT: u16 = 60000;

    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the shared region to `1 << bits` bytes, clamped to
    /// `MIN_HEAP_SIZE_BITS..=MAX_HEAP_SIZE_BITS`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_heap_size_bits(&mut self, bits: u8) {
        self.heap_size_bits = bits.clamp(Self::MIN_HEAP_SIZE_BITS, Self::MAX_HEAP_SIZE_BITS);
    }

    /// Get log2 of the size of the shared region
    pub fn get_heap_size_bits(&self) -> u8 {
        self.heap_size_bits
    }

    /// Set how often a waiting call checks that the child is alive. If set
    /// to 0 the interval is reset to `DEFAULT_CALL_POLL_INTERVAL`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_call_poll_interval(&mut self, interval: Duration) {
        self.call_poll_interval = clamp_millis(
            interval,
            Self::DEFAULT_CALL_POLL_INTERVAL,
            Self::MIN_CALL_POLL_INTERVAL,
            Self::MAX_CALL_POLL_INTERVAL,
        );
    }

    /// Get how often a waiting call checks that the child is alive
    pub fn get_call_poll_interval(&self) -> Duration {
        Duration::from_millis(self.call_poll_interval.into())
    }

    /// Set how long each stage of shutdown waits for the child to exit. If
    /// set to 0 the timeout is reset to `DEFAULT_SHUTDOWN_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_shutdown_timeout(&mut self, timeout: Duration) {
        self.shutdown_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_SHUTDOWN_TIMEOUT,
            Self::MIN_SHUTDOWN_TIMEOUT,
            Self::MAX_SHUTDOWN_TIMEOUT,
        );
    }

    /// Get how long each stage of shutdown waits for the child to exit
    pub fn get_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout.into())
    }

    /// Use `path` as the runner executable
    pub fn set_runner_path(&mut self, path: impl AsRef<Path>) {
        self.runner_path = Some(path.as_ref().to_path_buf());
    }

    /// The runner executable, if one was set
    pub fn get_runner_path(&self) -> Option<&Path> {
        self.runner_path.as_deref()
    }

    /// Replace the library directories handed to the child
    pub fn set_library_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.library_dirs = dirs;
    }

    /// The library directories handed to the child
    pub fn get_library_dirs(&self) -> &[PathBuf] {
        &self.library_dirs
    }
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            heap_size_bits: Self::DEFAULT_HEAP_SIZE_BITS,
            call_poll_interval: Self::DEFAULT_CALL_POLL_INTERVAL,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
            runner_path: None,
            library_dirs: DEFAULT_LIBRARY_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}
