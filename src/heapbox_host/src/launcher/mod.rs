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

//! Starting sandboxed children.
//!
//! A child starts from a clean slate: an empty environment apart from the
//! region location, and exactly the descriptors its role table lists, each
//! in a fixed slot and narrowed to the access it needs.
//!
//! Children are forked from a single `heapbox-launcher` thread that lives as
//! long as the host process. The kernel delivers a child's
//! `PR_SET_PDEATHSIG` when the thread that forked it exits, so forking from
//! whichever thread created the sandbox would kill the child as soon as that
//! thread ended.

use std::fs::File;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::Sender;

use heapbox_common::location::{RegionLocation, SANDBOX_LOCATION};
use log::{debug, error};
use tracing::{Span, instrument};

use crate::HeapboxError::{LibraryNotAFile, LibraryOpenFailed, SpawnFailed};
use crate::Result;

/// Tracking a launched child
pub mod child;
mod manifest;
mod restrictor;

pub use child::{ChildProcess, ChildStatus};
use manifest::DescriptorManifest;
use restrictor::DescriptorRestrictor;

/// File name of the runner binary, looked for next to the host executable.
pub const RUNNER_NAME: &str = "heapbox_runner";

/// Directories handed to the child for its run-time linker.
pub const DEFAULT_LIBRARY_DIRS: [&str; 3] = ["/lib", "/usr/lib", "/usr/local/lib"];

/// Everything needed to start one sandboxed child.
#[derive(Debug)]
pub struct LaunchSpec {
    /// The runner executable
    pub runner: PathBuf,
    /// The library to load, absolute or relative to the runner's directory
    pub library: PathBuf,
    /// Library search directories; missing ones are skipped
    pub library_dirs: Vec<PathBuf>,
    /// Where the child must map the shared region
    pub location: RegionLocation,
    /// The shared region's memfd
    pub shared_mem: OwnedFd,
    /// The pagemap page's memfd
    pub pagemap_page: OwnedFd,
    /// The child end of the Host Call channel
    pub pagemap_updates: OwnedFd,
    /// The child end of the descriptor-passing socket
    pub fd_socket: OwnedFd,
}

/// `heapbox_runner` next to the current executable.
pub fn default_runner() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| crate::new_error!("{} has no parent directory", exe.display()))?;
    Ok(dir.join(RUNNER_NAME))
}

/// Resolves `library` against the directory holding `runner`.
pub fn resolve_library(runner: &Path, library: &Path) -> PathBuf {
    if library.is_absolute() {
        return library.to_path_buf();
    }
    runner
        .parent()
        .map_or_else(|| library.to_path_buf(), |dir| dir.join(library))
}

fn open_library(path: &Path) -> Result<OwnedFd> {
    let file = File::options()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| LibraryOpenFailed(path.to_path_buf(), e))?;
    let metadata = file
        .metadata()
        .map_err(|e| LibraryOpenFailed(path.to_path_buf(), e))?;
    if !metadata.is_file() {
        return Err(LibraryNotAFile(path.to_path_buf()));
    }
    Ok(file.into())
}

fn open_library_dirs(dirs: &[PathBuf]) -> Vec<OwnedFd> {
    dirs.iter()
        .filter_map(|dir| {
            match File::options()
                .read(true)
                .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
                .open(dir)
            {
                Ok(file) => Some(file.into()),
                Err(e) => {
                    debug!("skipping library directory {}: {}", dir.display(), e);
                    None
                }
            }
        })
        .collect()
}

type SpawnRequest = (Command, Sender<io::Result<Child>>);

static LAUNCHER: Mutex<Option<Sender<SpawnRequest>>> = Mutex::new(None);

fn launcher() -> io::Result<Sender<SpawnRequest>> {
    let mut launcher = LAUNCHER
        .lock()
        .map_err(|_| io::Error::other("launcher lock poisoned"))?;
    if let Some(requests) = launcher.as_ref() {
        return Ok(requests.clone());
    }
    let (requests, incoming) = crossbeam_channel::unbounded::<SpawnRequest>();
    thread::Builder::new()
        .name("heapbox-launcher".to_string())
        .spawn(move || {
            for (mut command, reply) in incoming {
                if reply.send(command.spawn()).is_err() {
                    error!("launch requester went away; its child is left running");
                }
            }
        })?;
    *launcher = Some(requests.clone());
    Ok(requests)
}

/// Spawns `command` from the launcher thread.
fn spawn_from_launcher(command: Command) -> io::Result<Child> {
    let (reply, result) = crossbeam_channel::bounded(1);
    launcher()?
        .send((command, reply))
        .map_err(|_| io::Error::other("the launcher thread is gone"))?;
    result
        .recv()
        .map_err(|_| io::Error::other("the launcher thread is gone"))?
}

/// Starts the runner with the fixed descriptor layout.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub fn launch(spec: LaunchSpec) -> Result<ChildProcess> {
    let library_path = resolve_library(&spec.runner, &spec.library);
    let library = open_library(&library_path)?;
    let library_dirs = open_library_dirs(&spec.library_dirs);

    let manifest = DescriptorManifest::new(
        spec.shared_mem,
        spec.pagemap_page,
        spec.fd_socket,
        library,
        spec.pagemap_updates,
        library_dirs,
    )?;
    let restrictor = DescriptorRestrictor::new(&manifest.roles())?;
    let moves = manifest.moves();
    let mut moved: Vec<RawFd> = vec![-1; moves.len()];
    let last_slot = manifest.last_slot();

    let mut command = Command::new(&spec.runner);
    command
        .arg0(RUNNER_NAME)
        .env_clear()
        .env(SANDBOX_LOCATION, spec.location.encode())
        .stdin(Stdio::null());
    // SAFETY: the closure only makes system calls and touches memory that
    // was allocated before the fork.
    unsafe {
        command.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            // Clear every slot first so no source is clobbered by an earlier dup2.
            for (i, (_, source)) in moves.iter().enumerate() {
                let fd = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, last_slot + 1);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                moved[i] = fd;
            }
            for ((slot, _), fd) in moves.iter().zip(&moved) {
                if libc::dup2(*fd, *slot) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            restrictor.apply()?;
            cloexec_fds_from(last_slot + 1)
        })
    };

    let child =
        spawn_from_launcher(command).map_err(|e| SpawnFailed(spec.runner.clone(), e))?;
    // The child has its copies; ours close here.
    drop(manifest);
    debug!(
        "launched sandbox child {} running {} at {}",
        child.id(),
        library_path.display(),
        spec.location.encode()
    );
    Ok(ChildProcess::new(child))
}

fn parse_fd(name: &[u8]) -> Option<RawFd> {
    let mut fd: RawFd = 0;
    let mut digits = 0;
    for &byte in name.iter().take_while(|b| **b != 0) {
        if !byte.is_ascii_digit() {
            return None;
        }
        fd = fd.checked_mul(10)?.checked_add(RawFd::from(byte - b'0'))?;
        digits += 1;
    }
    (digits > 0).then_some(fd)
}

// From linux/close_range.h.
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Marks every descriptor numbered `first` or higher close-on-exec, so the
/// runner starts with nothing but the fixed slots. The descriptors stay open
/// until exec, which keeps the spawn error pipe of `Command` working.
///
/// # Safety
/// Runs between fork and exec, so it must not allocate.
unsafe fn cloexec_fds_from(first: RawFd) -> io::Result<()> {
    // Fast path for new kernels.
    // SAFETY: close_range with CLOSE_RANGE_CLOEXEC only changes descriptor flags.
    if unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    } == 0
    {
        return Ok(());
    }

    // Slow path for old kernels.
    // SAFETY: opening a constant path.
    let dir = unsafe {
        libc::open(
            c"/proc/self/fd".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if dir < 0 {
        return Err(io::Error::last_os_error());
    }
    // d_ino (8) + d_off (8) + d_reclen (2) + d_type (1), then the name
    const NAME_OFFSET: usize = 19;
    let mut buf = [0u8; 1024];
    loop {
        // SAFETY: `buf` is a live buffer of the stated length.
        let read = unsafe { libc::syscall(libc::SYS_getdents64, dir, buf.as_mut_ptr(), buf.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: `dir` is ours.
            unsafe { libc::close(dir) };
            return Err(err);
        }
        if read == 0 {
            break;
        }
        let read = read as usize;
        let mut offset = 0;
        while offset + NAME_OFFSET <= read {
            let reclen = usize::from(u16::from_ne_bytes([buf[offset + 16], buf[offset + 17]]));
            if reclen < NAME_OFFSET || offset + reclen > read {
                break;
            }
            if let Some(fd) = parse_fd(&buf[offset + NAME_OFFSET..offset + reclen]) {
                if fd >= first && fd != dir {
                    // SAFETY: only sets a descriptor flag.
                    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
                }
            }
            offset += reclen;
        }
    }
    // SAFETY: `dir` is ours.
    unsafe { libc::close(dir) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_libraries_resolve_next_to_the_runner() {
        let runner = Path::new("/opt/heapbox/bin/heapbox_runner");
        assert_eq!(
            resolve_library(runner, Path::new("libfoo.so")),
            PathBuf::from("/opt/heapbox/bin/libfoo.so")
        );
        assert_eq!(
            resolve_library(runner, Path::new("/usr/lib/libbar.so")),
            PathBuf::from("/usr/lib/libbar.so")
        );
    }

    #[test]
    fn children_outlive_the_thread_that_asked_for_them() {
        let mut child = thread::spawn(|| {
            let mut command = Command::new("sleep");
            command.arg("30");
            // SAFETY: prctl only.
            unsafe {
                command.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                })
            };
            spawn_from_launcher(command).unwrap()
        })
        .join()
        .unwrap();

        thread::sleep(std::time::Duration::from_millis(200));
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn proc_fd_names_parse() {
        assert_eq!(parse_fd(b"17\0\0\0"), Some(17));
        assert_eq!(parse_fd(b".\0"), None);
        assert_eq!(parse_fd(b"..\0"), None);
        assert_eq!(parse_fd(b"\0"), None);
        assert_eq!(parse_fd(b"99999999999\0"), None);
    }

    #[test]
    fn libraries_must_be_regular_files() {
        assert!(matches!(
            open_library(Path::new("/")),
            Err(crate::HeapboxError::LibraryNotAFile(_))
        ));
        assert!(matches!(
            open_library(Path::new("/nonexistent/libheapbox_missing.so")),
            Err(crate::HeapboxError::LibraryOpenFailed(_, _))
        ));
    }

    #[test]
    fn missing_library_dirs_are_skipped() {
        let dirs = vec![PathBuf::from("/"), PathBuf::from("/nonexistent/heapbox/lib")];
        assert_eq!(open_library_dirs(&dirs).len(), 1);
    }
}
