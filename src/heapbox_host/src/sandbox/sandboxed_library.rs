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

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use heapbox_common::exports::{
    MAX_TYPE_ENCODING_LEN, TYPE_ENCODING_FUNCTION, TYPE_QUERY_ADDR_SLOT, TYPE_QUERY_FUNCTION_SLOT,
    TYPE_QUERY_LEN_SLOT, TYPE_QUERY_SLOTS,
};
use heapbox_common::location::RegionLocation;
use heapbox_common::region::{CALL_OK, CALL_UNKNOWN_FUNCTION, HEADER_RESERVED, SharedRegionHeader};
use heapbox_common::sync::ProcessSignal;
use log::{debug, error, warn};
use tracing::{Span, instrument};

use super::config::SandboxConfiguration;
use crate::HeapboxError::{
    AllocationOverflow, ChildExited, ChildNotRunning, FunctionTypeMismatch, InvalidTypeEncoding,
    UnknownFunction,
};
use crate::launcher::{ChildProcess, ChildStatus, LaunchSpec, default_runner, launch};
use crate::mem::allocator::SandboxAllocator;
use crate::mem::memory_range::{MemoryRange, SandboxPtr};
use crate::mem::provider::MemoryProvider;
use crate::mem::shared_mem::SharedMemory;
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::pagemap::service::{PagemapService, RangeHandle};
use crate::{Result, log_then_return, new_error};

fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: `fds` is a valid two element out array.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        log_then_return!(new_error!(
            "socketpair failed: {:?}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: socketpair succeeded, so both descriptors are fresh and ours.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn header(region: &SharedMemory) -> Result<&SharedRegionHeader> {
    // SAFETY: the header was initialised when the region was created and
    // the borrow keeps the mapping alive.
    Ok(unsafe { SharedRegionHeader::from_base(region.base_addr())? })
}

fn check_alive(child: &mut ChildProcess) -> Result<()> {
    if let Some(status) = child.try_wait()? {
        CounterMetric::child_exit_during_call().emit();
        error!(
            "sandbox child {} {} during a call",
            child.pid(),
            ChildStatus::from(status)
        );
        return Err(ChildExited(status));
    }
    Ok(())
}

/// Tells the child to start the current call, checking every
/// `poll_interval` that it is still alive while the signal lock is busy.
fn start_call(
    header: &SharedRegionHeader,
    child: &mut ChildProcess,
    poll_interval: Duration,
) -> Result<()> {
    while !header.signal.signal_timeout(true, poll_interval)? {
        check_alive(child)?;
    }
    Ok(())
}

/// Blocks until the child finishes the current call, checking every
/// `poll_interval` that it is still alive.
fn wait_for_call(
    header: &SharedRegionHeader,
    child: &mut ChildProcess,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        if header.signal.wait_timeout(false, poll_interval)? {
            return Ok(());
        }
        check_alive(child)?;
    }
}

fn poll_exit(child: &mut ChildProcess, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// A shared library running in its own process, sharing a heap with this
/// one.
///
/// Memory handed out by [`SandboxedLibrary::alloc_in_sandbox`] is visible
/// at the same address in the host and the child, so pointers into it can
/// be passed to the library's exported functions with
/// [`SandboxedLibrary::call`].
pub struct SandboxedLibrary {
    service: Arc<PagemapService>,
    handle: RangeHandle,
    range: MemoryRange,
    allocator: SandboxAllocator,
    child: Option<ChildProcess>,
    running: bool,
    config: SandboxConfiguration,
    type_encodings: HashMap<u32, Option<String>>,
    _fd_socket: OwnedFd,
    // Unmapped last, after the child is gone.
    region: SharedMemory,
}

impl std::fmt::Debug for SandboxedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedLibrary")
            .field("range", &self.range)
            .field("pid", &self.pid())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl SandboxedLibrary {
    /// Loads `library` into a new sandboxed child.
    ///
    /// A relative `library` path is resolved against the directory of the
    /// runner executable.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        service: &Arc<PagemapService>,
        library: impl AsRef<Path>,
        cfg: Option<SandboxConfiguration>,
    ) -> Result<Self> {
        let config = cfg.unwrap_or_default();
        let region = SharedMemory::new_aligned(config.get_heap_size_bits().into())?;
        let base = region.base_addr();
        let end = base + region.mem_size();
        let start = base + HEADER_RESERVED;
        // SAFETY: the region was just mapped and no child has it yet.
        unsafe { SharedRegionHeader::init(base, start, end)? };
        let range = MemoryRange::new(start, end - start)
            .ok_or_else(|| new_error!("invalid sandbox range {:#x}..{:#x}", start, end))?;

        let page = SharedMemory::new_page()?;
        let child_page = page.try_clone_fd()?;
        let (host_updates, child_updates) = seqpacket_pair()?;
        let (host_fd_socket, child_fd_socket) = seqpacket_pair()?;
        let handle = service.register(MemoryProvider::new(range), host_updates, page)?;

        let mut sandbox = Self {
            service: service.clone(),
            handle,
            range,
            allocator: SandboxAllocator::new(service.clone(), handle),
            child: None,
            running: false,
            config,
            type_encodings: HashMap::new(),
            _fd_socket: host_fd_socket,
            region,
        };

        let runner = match sandbox.config.get_runner_path() {
            Some(path) => path.to_path_buf(),
            None => default_runner()?,
        };
        let spec = LaunchSpec {
            runner,
            library: library.as_ref().to_path_buf(),
            library_dirs: sandbox.config.get_library_dirs().to_vec(),
            location: RegionLocation {
                base,
                size: sandbox.region.mem_size(),
            },
            shared_mem: sandbox.region.try_clone_fd()?,
            pagemap_page: child_page,
            pagemap_updates: child_updates,
            fd_socket: child_fd_socket,
        };
        // On failure `sandbox` drops here and releases the range.
        sandbox.child = Some(launch(spec)?);
        sandbox.running = true;
        debug!("sandbox {} created for {}", handle.id(), range);
        Ok(sandbox)
    }

    /// Allocates room for `count` elements of `element_size` bytes inside
    /// the sandbox. A zero-sized request still returns a distinct,
    /// minimum-sized allocation.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn alloc_in_sandbox(&mut self, element_size: usize, count: usize) -> Result<SandboxPtr> {
        let Some(total) = element_size.checked_mul(count) else {
            log_then_return!(AllocationOverflow(element_size, count));
        };
        let size = total.max(1);
        let addr = self
            .allocator
            .alloc_after_drain(header(&self.region)?, size)?;
        self.range.checked_ptr(addr, size)
    }

    /// Allocates room for `count` values of type `T` inside the sandbox.
    pub fn alloc<T>(&mut self, count: usize) -> Result<SandboxPtr> {
        self.alloc_in_sandbox(std::mem::size_of::<T>(), count)
    }

    /// Frees an allocation made by [`SandboxedLibrary::alloc_in_sandbox`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn dealloc_in_sandbox(&mut self, ptr: SandboxPtr) -> Result<()> {
        self.allocator.dealloc(ptr.addr())
    }

    /// Runs the library's exported function `function_index` with
    /// `msg_buffer` as its argument, and blocks until it returns.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn call(&mut self, function_index: u32, msg_buffer: SandboxPtr) -> Result<()> {
        if !self.running {
            return Err(ChildNotRunning());
        }
        let msg_buffer = self.range.checked_ptr(msg_buffer.addr(), 1)?;
        let header = header(&self.region)?;
        let Some(child) = self.child.as_mut() else {
            return Err(ChildNotRunning());
        };

        header.function_index.store(function_index, Ordering::Relaxed);
        header.msg_buffer.store(msg_buffer.addr(), Ordering::Relaxed);
        header.call_status.store(CALL_OK, Ordering::Relaxed);

        let poll_interval = self.config.get_call_poll_interval();
        let result = HistogramMetric::time_and_emit_sandbox_call(function_index, || -> Result<()> {
            start_call(header, child, poll_interval)?;
            wait_for_call(header, child, poll_interval)
        });
        if let Err(e) = result {
            if e.is_child_gone() {
                self.running = false;
            }
            return Err(e);
        }

        let freed = self.allocator.drain_remote_frees(header)?;
        if freed > 0 {
            debug!("freed {} host allocations released by the sandbox", freed);
        }
        match header.call_status.load(Ordering::Acquire) {
            CALL_UNKNOWN_FUNCTION => Err(UnknownFunction(function_index)),
            _ => Ok(()),
        }
    }

    /// Like [`SandboxedLibrary::call`], but first checks that the function
    /// declares `type_encoding`.
    #[instrument(err(Debug), skip(self, msg_buffer), parent = Span::current(), level = "Trace")]
    pub fn call_checked(
        &mut self,
        function_index: u32,
        type_encoding: &str,
        msg_buffer: SandboxPtr,
    ) -> Result<()> {
        let declared = self.type_encoding(function_index)?;
        if declared.as_deref() != Some(type_encoding) {
            log_then_return!(FunctionTypeMismatch(
                function_index,
                type_encoding.to_string(),
                declared
            ));
        }
        self.call(function_index, msg_buffer)
    }

    /// The type encoding the library declares for `function_index`, or
    /// `None` if it declares none or has no such function.
    ///
    /// The child is asked once per function; answers are cached.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn type_encoding(&mut self, function_index: u32) -> Result<Option<String>> {
        if let Some(known) = self.type_encodings.get(&function_index) {
            return Ok(known.clone());
        }
        let frame = self.alloc::<u64>(TYPE_QUERY_SLOTS)?;
        let answer = self.query_type_encoding(function_index, frame);
        self.dealloc_in_sandbox(frame)?;
        let encoding = answer?;
        self.type_encodings.insert(function_index, encoding.clone());
        Ok(encoding)
    }

    fn query_type_encoding(
        &mut self,
        function_index: u32,
        frame: SandboxPtr,
    ) -> Result<Option<String>> {
        let range = self.range;
        let slot = |n: usize| range.checked_ptr(frame.addr() + n * 8, 8);
        self.write_u64(slot(TYPE_QUERY_FUNCTION_SLOT)?, function_index.into())?;
        self.write_u64(slot(TYPE_QUERY_ADDR_SLOT)?, 0)?;
        self.write_u64(slot(TYPE_QUERY_LEN_SLOT)?, 0)?;
        self.call(TYPE_ENCODING_FUNCTION, frame)?;

        let addr = usize::try_from(self.read_u64(slot(TYPE_QUERY_ADDR_SLOT)?)?)?;
        let len = usize::try_from(self.read_u64(slot(TYPE_QUERY_LEN_SLOT)?)?)?;
        if addr == 0 {
            return Ok(None);
        }
        if len > MAX_TYPE_ENCODING_LEN {
            log_then_return!(InvalidTypeEncoding(function_index));
        }
        let encoding = range
            .checked_ptr(addr, len)
            .map_err(|_| InvalidTypeEncoding(function_index))?;
        let mut bytes = vec![0; len];
        self.read_bytes(encoding, &mut bytes)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| InvalidTypeEncoding(function_index))
    }

    fn offset_of(&self, ptr: SandboxPtr, len: usize) -> Result<usize> {
        let ptr = self.range.checked_ptr(ptr.addr(), len)?;
        Ok(ptr.addr() - self.region.base_addr())
    }

    /// Reads the `u64` at `ptr`.
    pub fn read_u64(&self, ptr: SandboxPtr) -> Result<u64> {
        self.region.read::<u64>(self.offset_of(ptr, 8)?)
    }

    /// Writes `value` at `ptr`.
    pub fn write_u64(&self, ptr: SandboxPtr, value: u64) -> Result<()> {
        self.region.write::<u64>(self.offset_of(ptr, 8)?, value)
    }

    /// Copies `buf.len()` bytes starting at `ptr` into `buf`.
    pub fn read_bytes(&self, ptr: SandboxPtr, buf: &mut [u8]) -> Result<()> {
        self.region.copy_to_slice(buf, self.offset_of(ptr, buf.len())?)
    }

    /// Copies `buf` into the sandbox starting at `ptr`.
    pub fn write_bytes(&self, ptr: SandboxPtr, buf: &[u8]) -> Result<()> {
        self.region.copy_from_slice(buf, self.offset_of(ptr, buf.len())?)
    }

    /// The address range of the sandbox's heap.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// The child's process id, while it has one.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(ChildProcess::pid)
    }

    /// Whether the child can still take calls.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Asks the child to exit and waits for it, escalating to `SIGTERM` and
    /// then `SIGKILL` if it does not.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn shutdown(mut self) -> Result<ExitStatus> {
        self.stop_child()?.ok_or(ChildNotRunning())
    }

    fn stop_child(&mut self) -> Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        self.running = false;
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        match header(&self.region) {
            Ok(header) => {
                header.should_exit.store(true, Ordering::Release);
                match header.signal.signal_timeout(true, self.config.get_shutdown_timeout()) {
                    Ok(true) => {}
                    Ok(false) => warn!("could not wake sandbox child {}: lock busy", child.pid()),
                    Err(e) => warn!("could not wake sandbox child {}: {}", child.pid(), e),
                }
            }
            Err(e) => warn!("sandbox header unusable, skipping exit request: {}", e),
        }
        let timeout = self.config.get_shutdown_timeout();
        if let Some(status) = poll_exit(&mut child, timeout)? {
            return Ok(Some(status));
        }

        warn!("sandbox child {} did not exit, sending SIGTERM", child.pid());
        child.send_signal(libc::SIGTERM)?;
        if let Some(status) = poll_exit(&mut child, timeout)? {
            return Ok(Some(status));
        }

        warn!("sandbox child {} ignored SIGTERM, sending SIGKILL", child.pid());
        child.send_signal(libc::SIGKILL)?;
        Ok(Some(child.wait()?))
    }
}

impl Drop for SandboxedLibrary {
    fn drop(&mut self) {
        if let Err(e) = self.stop_child() {
            error!("failed to stop sandbox child: {}", e);
        }
        if let Err(e) = self.service.deregister(&self.handle) {
            error!("failed to deregister sandbox {}: {}", self.handle.id(), e);
        }
        if let Ok(header) = header(&self.region) {
            // SAFETY: the child is gone and nothing else uses the primitives.
            unsafe { header.signal.destroy() };
        }
    }
}
