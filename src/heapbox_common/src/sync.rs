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

//! A mutex/condition-variable pair that works across processes.
//!
//! [`CallSignal`] lives inside the shared memory region. Both the mutex and
//! the condition variable are initialised `PTHREAD_PROCESS_SHARED`, the mutex
//! is robust so a child dying while holding it cannot wedge the host, and the
//! condition variable waits against `CLOCK_MONOTONIC`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};

/// Wait/signal on the "child is executing" flag.
///
/// Implementations must make both operations usable by two independently
/// scheduled processes mapping the same memory.
pub trait ProcessSignal {
    /// Sets the flag to `child_executing` and wakes every waiter.
    fn signal(&self, child_executing: bool) -> Result<()>;
    /// Like `signal`, but gives up if the flag's lock cannot be taken
    /// within `timeout`. Returns whether the flag was set.
    fn signal_timeout(&self, child_executing: bool, timeout: Duration) -> Result<bool>;
    /// Blocks until the flag equals `expected`.
    fn wait(&self, expected: bool) -> Result<()>;
    /// Blocks until the flag equals `expected` or `timeout` elapses on the
    /// monotonic clock. Returns whether the expected state was observed.
    fn wait_timeout(&self, expected: bool, timeout: Duration) -> Result<bool>;
}

/// Process-shared wait/signal state. Must only be used in place, inside
/// memory mapped by every participating process.
#[repr(C)]
pub struct CallSignal {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    // Only read or written with `mutex` held, by `signal` and the waits.
    is_child_executing: AtomicBool,
}

// SAFETY: all access to the pthread objects goes through the pthread API,
// which synchronises internally.
unsafe impl Sync for CallSignal {}
unsafe impl Send for CallSignal {}

fn check(what: &str, rc: libc::c_int) -> Result<()> {
    if rc != 0 {
        bail!("{} failed: {}", what, std::io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

struct Locked<'a>(&'a CallSignal);

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        // SAFETY: the mutex was locked by this thread in `CallSignal::lock`.
        unsafe {
            libc::pthread_mutex_unlock(self.0.mutex.get());
        }
    }
}

impl CallSignal {
    /// Initialises a `CallSignal` in place.
    ///
    /// # Safety
    /// `this` must point to writable memory large enough for a `CallSignal`
    /// that no other thread or process is using yet.
    pub unsafe fn init(this: *mut CallSignal) -> Result<()> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut mattr))?;
            check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED),
            )?;
            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(&mut mattr, libc::PTHREAD_MUTEX_ROBUST),
            )?;
            let rc = libc::pthread_mutex_init(std::ptr::addr_of_mut!((*this).mutex).cast(), &mattr);
            libc::pthread_mutexattr_destroy(&mut mattr);
            check("pthread_mutex_init", rc)?;

            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            check("pthread_condattr_init", libc::pthread_condattr_init(&mut cattr))?;
            check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED),
            )?;
            check(
                "pthread_condattr_setclock",
                libc::pthread_condattr_setclock(&mut cattr, libc::CLOCK_MONOTONIC),
            )?;
            let rc = libc::pthread_cond_init(std::ptr::addr_of_mut!((*this).cond).cast(), &cattr);
            libc::pthread_condattr_destroy(&mut cattr);
            check("pthread_cond_init", rc)?;

            std::ptr::addr_of_mut!((*this).is_child_executing).write(AtomicBool::new(false));
        }
        Ok(())
    }

    /// Tears down the mutex and condition variable.
    ///
    /// # Safety
    /// No other process may be using this `CallSignal`, and it must not be
    /// used again afterwards.
    pub unsafe fn destroy(&self) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            libc::pthread_cond_destroy(self.cond.get());
            libc::pthread_mutex_destroy(self.mutex.get());
        }
    }

    fn lock(&self) -> Result<Locked<'_>> {
        // SAFETY: the mutex was initialised by `init`.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        self.locked("pthread_mutex_lock", rc)?
            .ok_or_else(|| anyhow::anyhow!("pthread_mutex_lock timed out"))
    }

    /// Like `lock`, but gives up at `deadline` on `CLOCK_REALTIME`, so a
    /// live process sitting on the mutex cannot block the caller forever.
    fn lock_until(&self, deadline: &libc::timespec) -> Result<Option<Locked<'_>>> {
        // SAFETY: the mutex was initialised by `init`.
        let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex.get(), deadline) };
        self.locked("pthread_mutex_timedlock", rc)
    }

    fn locked(&self, what: &str, rc: libc::c_int) -> Result<Option<Locked<'_>>> {
        match rc {
            0 => Ok(Some(Locked(self))),
            libc::ETIMEDOUT => Ok(None),
            libc::EOWNERDEAD => {
                // The previous owner died with the lock held. The state it
                // protects is a single flag, which is always consistent.
                let guard = Locked(self);
                self.make_consistent()?;
                Ok(Some(guard))
            }
            rc => bail!("{} failed: {}", what, std::io::Error::from_raw_os_error(rc)),
        }
    }

    fn make_consistent(&self) -> Result<()> {
        log::warn!("recovering call signal mutex from a dead owner");
        // SAFETY: only called after EOWNERDEAD, with the lock held.
        check("pthread_mutex_consistent", unsafe {
            libc::pthread_mutex_consistent(self.mutex.get())
        })
    }

    fn flag(&self) -> bool {
        self.is_child_executing.load(Ordering::Acquire)
    }

    // Caller holds the lock.
    fn set_and_broadcast(&self, child_executing: bool) -> Result<()> {
        self.is_child_executing
            .store(child_executing, Ordering::Release);
        // SAFETY: initialised by `init`, lock held.
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.cond.get())
        })
    }
}

fn deadline_after(clock: libc::clockid_t, timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out pointer.
    if unsafe { libc::clock_gettime(clock, &mut now) } != 0 {
        bail!("clock_gettime failed: {}", std::io::Error::last_os_error());
    }
    let mut sec = now.tv_sec.saturating_add(timeout.as_secs() as libc::time_t);
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

impl ProcessSignal for CallSignal {
    fn signal(&self, child_executing: bool) -> Result<()> {
        let _guard = self.lock()?;
        self.set_and_broadcast(child_executing)
    }

    fn signal_timeout(&self, child_executing: bool, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(libc::CLOCK_REALTIME, timeout)?;
        let Some(_guard) = self.lock_until(&deadline)? else {
            return Ok(false);
        };
        self.set_and_broadcast(child_executing)?;
        Ok(true)
    }

    fn wait(&self, expected: bool) -> Result<()> {
        let _guard = self.lock()?;
        while self.flag() != expected {
            // SAFETY: initialised by `init`, lock held.
            let rc = unsafe { libc::pthread_cond_wait(self.cond.get(), self.mutex.get()) };
            match rc {
                0 => {}
                libc::EOWNERDEAD => self.make_consistent()?,
                rc => check("pthread_cond_wait", rc)?,
            }
        }
        Ok(())
    }

    fn wait_timeout(&self, expected: bool, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(libc::CLOCK_MONOTONIC, timeout)?;
        // pthread_mutex_timedlock only takes CLOCK_REALTIME deadlines.
        let lock_deadline = deadline_after(libc::CLOCK_REALTIME, timeout)?;
        let Some(_guard) = self.lock_until(&lock_deadline)? else {
            log::warn!("call signal mutex still held at the deadline");
            return Ok(self.flag() == expected);
        };
        while self.flag() != expected {
            // SAFETY: initialised by `init`, lock held.
            let rc = unsafe {
                libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &deadline)
            };
            match rc {
                0 => {}
                libc::ETIMEDOUT => return Ok(self.flag() == expected),
                libc::EOWNERDEAD => self.make_consistent()?,
                rc => check("pthread_cond_timedwait", rc)?,
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    struct SharedSignal {
        ptr: *mut CallSignal,
        len: usize,
    }

    impl SharedSignal {
        fn new() -> Self {
            let len = std::mem::size_of::<CallSignal>();
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(ptr, libc::MAP_FAILED);
            let ptr = ptr.cast::<CallSignal>();
            unsafe { CallSignal::init(ptr).unwrap() };
            Self { ptr, len }
        }

        fn get(&self) -> &CallSignal {
            unsafe { &*self.ptr }
        }
    }

    impl Drop for SharedSignal {
        fn drop(&mut self) {
            unsafe {
                self.get().destroy();
                libc::munmap(self.ptr.cast(), self.len);
            }
        }
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let shared = SharedSignal::new();
        let start = Instant::now();
        let observed = shared
            .get()
            .wait_timeout(true, Duration::from_millis(50))
            .unwrap();
        assert!(!observed);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_returns_immediately_when_state_matches() {
        let shared = SharedSignal::new();
        assert!(shared
            .get()
            .wait_timeout(false, Duration::from_secs(5))
            .unwrap());
        shared.get().signal(true).unwrap();
        shared.get().wait(true).unwrap();
    }

    #[test]
    fn signal_crosses_process_boundary() {
        let shared = SharedSignal::new();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // child: wait to be told to run, then report completion
            let signal = shared.get();
            let ok = signal.wait(true).is_ok() && signal.signal(false).is_ok();
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        let signal = shared.get();
        signal.signal(true).unwrap();
        assert!(signal.wait_timeout(false, Duration::from_secs(10)).unwrap());
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn wait_timeout_gives_up_while_another_process_holds_the_lock() {
        let shared = SharedSignal::new();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // child: take the lock, tell the parent, then never let go
            let guard = shared.get().lock();
            let held = guard.is_ok();
            std::mem::forget(guard);
            unsafe {
                libc::write(fds[1], [held as u8].as_ptr().cast(), 1);
                libc::sleep(30);
                libc::_exit(0);
            }
        }
        let mut held = [0u8];
        assert_eq!(unsafe { libc::read(fds[0], held.as_mut_ptr().cast(), 1) }, 1);
        assert_eq!(held[0], 1);

        let start = Instant::now();
        let observed = shared
            .get()
            .wait_timeout(true, Duration::from_millis(100))
            .unwrap();
        let delivered = shared
            .get()
            .signal_timeout(true, Duration::from_millis(100))
            .unwrap();
        let elapsed = start.elapsed();

        unsafe {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, std::ptr::null_mut(), 0);
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        assert!(!observed);
        assert!(!delivered);
        assert!(elapsed < Duration::from_secs(3), "waited {:?}", elapsed);
        assert!(!shared.get().flag());

        // the dead owner's lock is recovered
        assert!(shared
            .get()
            .wait_timeout(false, Duration::from_secs(1))
            .unwrap());
    }
}
