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

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;

use heapbox_common::fd_layout::{ChildFd, Rights};

use crate::Result;

struct Narrowing {
    slot: RawFd,
    rights: Rights,
    path: CString,
}

/// Narrows each child slot to the access its role needs.
///
/// Linux has no per-descriptor capability rights, so the closest fit is the
/// access mode: a read-write descriptor whose role never writes is reopened
/// read-only through `/proc/self/fd`, and one that never reads is reopened
/// write-only. A read-only memfd cannot be mapped writable, which is what
/// keeps the child's pagemap page read-only.
///
/// Everything is prepared in the parent; [`DescriptorRestrictor::apply`]
/// only makes system calls, so it may run between fork and exec.
pub(crate) struct DescriptorRestrictor {
    narrowings: Vec<Narrowing>,
}

impl DescriptorRestrictor {
    pub(crate) fn new(roles: &[ChildFd]) -> Result<Self> {
        let narrowings = roles
            .iter()
            .map(|role| -> Result<Narrowing> {
                Ok(Narrowing {
                    slot: role.raw(),
                    rights: role.rights(),
                    path: CString::new(format!("/proc/self/fd/{}", role.raw()))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { narrowings })
    }

    /// Applies every narrowing to the descriptors already in their slots.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child, after the slots are
    /// populated. Replaces descriptors in place.
    pub(crate) unsafe fn apply(&self) -> io::Result<()> {
        for narrowing in &self.narrowings {
            // SAFETY: F_GETFL on any descriptor number is harmless.
            let flags = unsafe { libc::fcntl(narrowing.slot, libc::F_GETFL) };
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if flags & libc::O_ACCMODE != libc::O_RDWR {
                continue;
            }
            let mode = if !narrowing.rights.allows_write() {
                libc::O_RDONLY
            } else if !narrowing.rights.allows_read() {
                libc::O_WRONLY
            } else {
                continue;
            };

            // SAFETY: `path` is a valid C string built in the parent.
            let reopened = unsafe { libc::open(narrowing.path.as_ptr(), mode | libc::O_CLOEXEC) };
            if reopened < 0 {
                let err = io::Error::last_os_error();
                // Sockets cannot be reopened through /proc, and inherited
                // streams may belong to someone else.
                if matches!(err.raw_os_error(), Some(libc::ENXIO | libc::EACCES)) {
                    continue;
                }
                return Err(err);
            }
            // SAFETY: both descriptors are open; dup2 clears O_CLOEXEC on the slot.
            let rc = unsafe { libc::dup2(reopened, narrowing.slot) };
            // SAFETY: `reopened` is ours and no longer needed.
            unsafe { libc::close(reopened) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_gets_a_proc_path() {
        let roles = ChildFd::layout(2);
        let restrictor = DescriptorRestrictor::new(&roles).unwrap();
        assert_eq!(restrictor.narrowings.len(), roles.len());
        assert_eq!(
            restrictor.narrowings[4].path.to_str().unwrap(),
            "/proc/self/fd/4"
        );
        assert_eq!(restrictor.narrowings[4].rights, Rights::MMAP_R);
    }
}
