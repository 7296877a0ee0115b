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

// This crate contains testing utilities which need to be shared across multiple
// crates in this project.
use std::os::fd::{FromRawFd, OwnedFd};

use anyhow::{Result, anyhow};

pub mod simplelogger;

/// Creates a connected `SOCK_SEQPACKET` Unix socket pair, the transport the
/// pagemap service uses for Host Calls.
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
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
        return Err(anyhow!(
            "socketpair failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: socketpair succeeded, so both descriptors are fresh and ours.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Number of open descriptors in this process, from `/proc/self/fd`.
pub fn open_fd_count() -> Result<usize> {
    Ok(std::fs::read_dir("/proc/self/fd")?.count())
}
