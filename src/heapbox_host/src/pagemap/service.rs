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
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use heapbox_common::host_call::{HostCallKind, HostCallRequest, HostCallResponse};
use heapbox_common::pagemap::{
    CHUNK_BITS, CHUNK_SIZE, Owner, PagemapEntry, is_large_class, large_class_size,
};
use log::{debug, error, warn};
use tracing::{Span, instrument};

use super::table::{PagemapTable, entries_for};
use crate::HeapboxError::{RangeNotRegistered, RangeOverlap};
use crate::mem::provider::MemoryProvider;
use crate::mem::shared_mem::SharedMemory;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::{Result, log_then_return, new_error};

/// What the service does when a child sends a record of the wrong size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MalformedRequestPolicy {
    /// Close that sandbox's channel and forget its range. Other sandboxes
    /// are unaffected.
    #[default]
    DisconnectSandbox,
    /// Abort the whole host process.
    AbortHost,
}

/// Settings for a [`PagemapService`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceConfiguration {
    malformed_request_policy: MalformedRequestPolicy,
}

impl ServiceConfiguration {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what happens when a child sends a malformed request
    pub fn set_malformed_request_policy(&mut self, policy: MalformedRequestPolicy) {
        self.malformed_request_policy = policy;
    }

    /// Get what happens when a child sends a malformed request
    pub fn get_malformed_request_policy(&self) -> MalformedRequestPolicy {
        self.malformed_request_policy
    }
}

/// The host-side state for one registered range.
#[derive(Debug)]
pub struct RangeState {
    pub(crate) provider: MemoryProvider,
    pub(crate) page: SharedMemory,
}

impl RangeState {
    /// State for a range served from `provider` whose child maps `page`.
    pub fn new(provider: MemoryProvider, page: SharedMemory) -> Self {
        Self { provider, page }
    }

    /// The provider handing out blocks of this range.
    pub fn provider(&self) -> &MemoryProvider {
        &self.provider
    }

    /// Copies `entries` canonical entries starting at `addr` into the page
    /// the child reads.
    pub(crate) fn publish(&mut self, table: &PagemapTable, addr: usize, entries: usize) {
        table.copy_into(self.page.as_mut_slice(), addr, entries);
    }
}

/// Identifies one registration with the service.
///
/// The generation id makes a handle useless once its registration is gone,
/// even if the kernel hands the same descriptor number to a later sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHandle {
    fd: RawFd,
    id: u64,
}

impl RangeHandle {
    /// The generation id of the registration.
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Registration {
    id: u64,
    channel: UnixStream,
    state: RangeState,
}

#[derive(Default)]
struct Registry {
    table: PagemapTable,
    by_fd: HashMap<RawFd, Registration>,
    next_id: u64,
}

impl Registry {
    fn lookup(&mut self, handle: &RangeHandle) -> Option<&mut Registration> {
        self.by_fd
            .get_mut(&handle.fd)
            .filter(|registration| registration.id == handle.id)
    }

    fn remove(&mut self, fd: RawFd) {
        if let Some(registration) = self.by_fd.remove(&fd) {
            let range = registration.state.provider.range();
            self.table
                .clear(range.base(), range.size().div_ceil(CHUNK_SIZE));
            debug!("sandbox {} deregistered from {}", registration.id, range);
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    stop: AtomicBool,
    wake: OwnedFd,
    config: ServiceConfiguration,
}

impl Shared {
    fn wake(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live local. The pipe is non-blocking
        // so a full pipe just means a wakeup is already pending.
        unsafe { libc::write(self.wake.as_raw_fd(), (&byte as *const u8).cast(), 1) };
    }
}

/// The process-wide service that applies Host Calls to the canonical
/// pagemap.
///
/// One background thread polls the channel of every registered sandbox.
/// Each request is checked against the range of the sandbox that sent it
/// before anything changes, and every request gets exactly one response.
pub struct PagemapService {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PagemapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagemapService")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

fn wake_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: `fds` is a valid two element out array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        log_then_return!(new_error!(
            "Failed to create the pagemap service wake pipe: {:?}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and ours.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

impl PagemapService {
    /// Starts the service thread.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn start(config: ServiceConfiguration) -> Result<Arc<Self>> {
        let (wake_read, wake_write) = wake_pipe()?;
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            stop: AtomicBool::new(false),
            wake: wake_write,
            config,
        });
        let thread = thread::Builder::new()
            .name("heapbox-pagemap".to_string())
            .spawn({
                let shared = shared.clone();
                move || run(&shared, wake_read)
            })?;
        Ok(Arc::new(Self {
            shared,
            thread: Some(thread),
        }))
    }

    /// Starts serving Host Calls arriving on `channel` for the range of
    /// `provider`. `page` is the pagemap page the sandbox maps read-only.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn register(
        &self,
        provider: MemoryProvider,
        channel: OwnedFd,
        page: SharedMemory,
    ) -> Result<RangeHandle> {
        let range = provider.range();
        let channel = UnixStream::from(channel);
        channel.set_nonblocking(true)?;
        let fd = channel.as_raw_fd();

        let handle = {
            let mut registry = self.shared.registry.lock()?;
            if registry
                .by_fd
                .values()
                .any(|r| r.state.provider.range().overlaps(&range))
            {
                log_then_return!(RangeOverlap(range.base(), range.size()));
            }
            registry.next_id += 1;
            let id = registry.next_id;
            registry.by_fd.insert(
                fd,
                Registration {
                    id,
                    channel,
                    state: RangeState::new(provider, page),
                },
            );
            RangeHandle { fd, id }
        };
        debug!("sandbox {} registered for {}", handle.id, range);
        self.shared.wake();
        Ok(handle)
    }

    /// Stops serving the registration behind `handle` and closes its
    /// channel. Does nothing if it is already gone.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn deregister(&self, handle: &RangeHandle) -> Result<()> {
        {
            let mut registry = self.shared.registry.lock()?;
            if registry.lookup(handle).is_some() {
                registry.remove(handle.fd);
            }
        }
        self.shared.wake();
        Ok(())
    }

    /// Whether `handle` still names a live registration.
    pub fn is_registered(&self, handle: &RangeHandle) -> Result<bool> {
        Ok(self.shared.registry.lock()?.lookup(handle).is_some())
    }

    /// Runs `f` with the canonical table and the state of `handle`'s range,
    /// while no Host Call can be served.
    pub fn with_range<R>(
        &self,
        handle: &RangeHandle,
        f: impl FnOnce(&mut PagemapTable, &mut RangeState) -> R,
    ) -> Result<R> {
        let mut registry = self.shared.registry.lock()?;
        let Registry { table, by_fd, .. } = &mut *registry;
        match by_fd.get_mut(&handle.fd) {
            Some(registration) if registration.id == handle.id => {
                Ok(f(table, &mut registration.state))
            }
            _ => Err(RangeNotRegistered()),
        }
    }
}

impl Drop for PagemapService {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("pagemap service thread panicked");
            }
        }
    }
}

fn run(shared: &Shared, wake: OwnedFd) {
    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut ids: Vec<u64> = Vec::new();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        pollfds.clear();
        ids.clear();
        pollfds.push(libc::pollfd {
            fd: wake.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        match shared.registry.lock() {
            Ok(registry) => {
                for (fd, registration) in registry.by_fd.iter() {
                    pollfds.push(libc::pollfd {
                        fd: *fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    ids.push(registration.id);
                }
            }
            Err(e) => {
                error!("pagemap registry poisoned, stopping service: {}", e);
                return;
            }
        }

        // SAFETY: `pollfds` is a live, correctly sized array.
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("pagemap service poll failed, stopping service: {:?}", err);
            return;
        }

        if pollfds[0].revents != 0 {
            drain_wake_pipe(&wake);
        }

        let Ok(mut registry) = shared.registry.lock() else {
            error!("pagemap registry poisoned, stopping service");
            return;
        };
        for (pollfd, id) in pollfds[1..].iter().zip(&ids) {
            if pollfd.revents != 0 {
                serve(&mut registry, pollfd.fd, *id, shared.config.malformed_request_policy);
            }
        }
    }
}

fn drain_wake_pipe(wake: &OwnedFd) {
    let mut buf = [0u8; 64];
    // SAFETY: reads into a live local buffer of the stated length.
    while unsafe { libc::read(wake.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
}

enum Outcome {
    Served,
    Idle,
    Closed,
    Malformed(usize),
    Failed(std::io::Error),
}

fn serve(registry: &mut Registry, fd: RawFd, id: u64, policy: MalformedRequestPolicy) {
    let Registry { table, by_fd, .. } = &mut *registry;
    // A registration replaced since the poll snapshot is not the one that
    // became ready.
    let Some(registration) = by_fd.get_mut(&fd).filter(|r| r.id == id) else {
        return;
    };

    let mut buf = [0u8; HostCallRequest::SIZE + 1];
    let outcome = match registration.channel.read(&mut buf) {
        Ok(0) => Outcome::Closed,
        Ok(n) => match HostCallRequest::from_bytes(&buf[..n]) {
            Some(request) => {
                let response = process_request(table, &mut registration.state, &request);
                if !response.is_ok() {
                    let kind = request.kind().map_or("unknown", HostCallKind::name);
                    warn!(
                        "rejected {} from sandbox {}: arg0={:#x} arg1={:#x}",
                        kind, id, request.arg0, request.arg1
                    );
                    CounterMetric::host_call_rejection(kind).emit();
                }
                match registration.channel.write_all(response.as_bytes()) {
                    Ok(()) => Outcome::Served,
                    Err(e) => Outcome::Failed(e),
                }
            }
            None => Outcome::Malformed(n),
        },
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Outcome::Idle
        }
        Err(e) => Outcome::Failed(e),
    };

    match outcome {
        Outcome::Served | Outcome::Idle => {}
        Outcome::Closed => {
            debug!("sandbox {} closed its host call channel", id);
            registry.remove(fd);
        }
        Outcome::Malformed(len) => {
            error!(
                "malformed host call of {} bytes from sandbox {}, expected {}",
                len,
                id,
                HostCallRequest::SIZE
            );
            CounterMetric::malformed_request().emit();
            match policy {
                MalformedRequestPolicy::DisconnectSandbox => registry.remove(fd),
                MalformedRequestPolicy::AbortHost => std::process::abort(),
            }
        }
        Outcome::Failed(e) => {
            error!("host call channel of sandbox {} failed: {:?}", id, e);
            registry.remove(fd);
        }
    }
}

/// Validates `request` against the range of `state` and applies it.
///
/// Every address the child supplies must fall inside its own range, and
/// every class must be valid, or nothing changes and the response carries
/// an error.
pub fn process_request(
    table: &mut PagemapTable,
    state: &mut RangeState,
    request: &HostCallRequest,
) -> HostCallResponse {
    let Ok(kind) = request.kind() else {
        return HostCallResponse::rejected();
    };
    let (Ok(addr), Ok(arg1)) = (usize::try_from(request.arg0), usize::try_from(request.arg1))
    else {
        return HostCallResponse::rejected();
    };

    match kind {
        HostCallKind::PushLargeStack => {
            let Some(size) = large_class_size(arg1) else {
                return HostCallResponse::rejected();
            };
            if !state.provider.contains(addr, size) {
                return HostCallResponse::rejected();
            }
            state.provider.push_large_stack(addr, arg1);
            HostCallResponse::ok(0)
        }
        HostCallKind::PopLargeStack => {
            if !is_large_class(arg1) {
                return HostCallResponse::rejected();
            }
            HostCallResponse::ok(state.provider.pop_large_stack(arg1).unwrap_or(0) as u64)
        }
        HostCallKind::Reserve => {
            if !is_large_class(arg1) {
                return HostCallResponse::rejected();
            }
            HostCallResponse::ok(state.provider.reserve(arg1).unwrap_or(0) as u64)
        }
        HostCallKind::Set => {
            if !state.provider.contains(addr, CHUNK_SIZE) {
                return HostCallResponse::rejected();
            }
            let entry = match u8::try_from(arg1).ok().and_then(PagemapEntry::decode) {
                Some(entry @ (PagemapEntry::Unused | PagemapEntry::Slab(Owner::Child))) => entry,
                _ => return HostCallResponse::rejected(),
            };
            table.set(addr, entry);
            state.publish(table, addr, 1);
            HostCallResponse::ok(0)
        }
        HostCallKind::SetRange | HostCallKind::ClearRange => {
            if !(CHUNK_BITS..usize::BITS as usize).contains(&arg1) {
                return HostCallResponse::rejected();
            }
            let size = 1usize << arg1;
            if !state.provider.contains(addr, size) {
                return HostCallResponse::rejected();
            }
            let entries = entries_for(addr, arg1);
            if kind == HostCallKind::SetRange {
                if !is_large_class(arg1 - CHUNK_BITS) {
                    return HostCallResponse::rejected();
                }
                table.set_large(addr, arg1, Owner::Child);
            } else {
                table.clear(addr, entries);
            }
            state.publish(table, addr, entries);
            HostCallResponse::ok(0)
        }
    }
}
