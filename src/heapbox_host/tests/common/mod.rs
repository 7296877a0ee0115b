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

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use heapbox_host::{PagemapService, SandboxConfiguration, SandboxPtr, SandboxedLibrary, ServiceConfiguration};

/// Export indices of the `heapbox_testguest` runner.
pub mod exports {
    pub const ADD: u32 = 1;
    pub const ABORT: u32 = 2;
    pub const EXIT: u32 = 3;
    pub const ALLOC: u32 = 4;
    pub const FREE: u32 = 5;
    pub const RAW_SET: u32 = 6;
    pub const ENTRY: u32 = 7;
    pub const MALLOC: u32 = 8;
    pub const BOXED: u32 = 9;
}

/// Number of `u64` slots in a test frame.
pub const FRAME_SLOTS: usize = 4;

/// The runner with the built-in test exports.
pub fn test_guest_path() -> &'static str {
    env!("CARGO_BIN_EXE_heapbox_testguest")
}

/// The real runner.
pub fn runner_path() -> &'static str {
    env!("CARGO_BIN_EXE_heapbox_runner")
}

/// The `heapbox_testlib` shared library built alongside the test binaries.
///
/// `HEAPBOX_TESTLIB` overrides the lookup. Otherwise the newest
/// `libheapbox_testlib*.so` next to the runner or in its `deps` directory
/// wins.
pub fn test_library_path() -> PathBuf {
    if let Some(path) = std::env::var_os("HEAPBOX_TESTLIB") {
        return path.into();
    }
    let target_dir = Path::new(runner_path()).parent().unwrap();
    [target_dir.to_path_buf(), target_dir.join("deps")]
        .iter()
        .filter_map(|dir| std::fs::read_dir(dir).ok())
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("libheapbox_testlib") && name.ends_with(".so")
        })
        .max_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok())
        .map(|entry| entry.path())
        .expect("libheapbox_testlib.so was not built")
}

/// One service shared by every sandbox in the test binary.
pub fn service() -> Arc<PagemapService> {
    static SERVICE: OnceLock<Arc<PagemapService>> = OnceLock::new();
    SERVICE
        .get_or_init(|| PagemapService::start(ServiceConfiguration::new()).unwrap())
        .clone()
}

/// A small configuration that runs the test guest.
pub fn test_config() -> SandboxConfiguration {
    let mut cfg = SandboxConfiguration::new();
    cfg.set_heap_size_bits(23);
    cfg.set_runner_path(test_guest_path());
    cfg
}

/// Creates a sandbox running the test guest.
pub fn new_sandbox() -> SandboxedLibrary {
    // The test guest ignores its library, but one must still be handed over.
    SandboxedLibrary::new(&service(), test_guest_path(), Some(test_config())).unwrap()
}

/// Creates a sandbox running the real runner on the test library.
pub fn new_library_sandbox() -> SandboxedLibrary {
    let mut cfg = SandboxConfiguration::new();
    cfg.set_heap_size_bits(23);
    cfg.set_runner_path(runner_path());
    SandboxedLibrary::new(&service(), test_library_path(), Some(cfg)).unwrap()
}

/// Creates a zeroed frame in `sandbox`.
pub fn new_frame(sandbox: &mut SandboxedLibrary) -> Frame {
    let frame = Frame(sandbox.alloc::<u64>(FRAME_SLOTS).unwrap());
    for n in 0..FRAME_SLOTS {
        frame.set(sandbox, n, 0);
    }
    frame
}

/// Runs a test with a fresh sandbox.
pub fn with_sandbox<F>(f: F)
where
    F: FnOnce(SandboxedLibrary),
{
    f(new_sandbox());
}

/// Runs a test with a fresh sandbox and a zeroed frame inside it.
pub fn with_sandbox_and_frame<F>(f: F)
where
    F: FnOnce(SandboxedLibrary, Frame),
{
    let mut sandbox = new_sandbox();
    let frame = new_frame(&mut sandbox);
    f(sandbox, frame);
}

/// An argument/result frame of `u64` slots in the shared heap.
#[derive(Clone, Copy, Debug)]
pub struct Frame(pub SandboxPtr);

impl Frame {
    fn slot(&self, sandbox: &SandboxedLibrary, n: usize) -> SandboxPtr {
        sandbox
            .range()
            .checked_ptr(self.0.addr() + n * 8, 8)
            .unwrap()
    }

    pub fn get(&self, sandbox: &SandboxedLibrary, n: usize) -> u64 {
        sandbox.read_u64(self.slot(sandbox, n)).unwrap()
    }

    pub fn set(&self, sandbox: &SandboxedLibrary, n: usize, value: u64) {
        sandbox.write_u64(self.slot(sandbox, n), value).unwrap()
    }
}
