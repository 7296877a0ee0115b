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

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};

use log::{debug, warn};

use crate::{Result, log_then_return, new_error};

/// What became of a sandboxed child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStatus {
    /// Still running.
    Running,
    /// Exited normally with this status.
    Exited(i32),
    /// Killed by this signal.
    ExitedDueToSignal(i32),
}

impl ChildStatus {
    /// Whether the child is still running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl From<ExitStatus> for ChildStatus {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildStatus::Exited(code),
            (None, Some(signal)) => ChildStatus::ExitedDueToSignal(signal),
            (None, None) => ChildStatus::Exited(-1),
        }
    }
}

struct Signal(i32);

impl fmt::Display for Signal {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            libc::SIGABRT => "SIGABRT",
            libc::SIGBUS => "SIGBUS",
            libc::SIGFPE => "SIGFPE",
            libc::SIGILL => "SIGILL",
            libc::SIGKILL => "SIGKILL",
            libc::SIGPIPE => "SIGPIPE",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGSYS => "SIGSYS",
            libc::SIGTERM => "SIGTERM",
            libc::SIGTRAP => "SIGTRAP",
            _ => return write!(fmt, "{}", self.0),
        };
        fmt.write_str(name)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Running => fmt.write_str("running"),
            ChildStatus::Exited(code) => write!(fmt, "exited (status = {code})"),
            ChildStatus::ExitedDueToSignal(signum) => {
                write!(fmt, "exited due to signal (signal = {})", Signal(*signum))
            }
        }
    }
}

/// A launched sandbox process. Killed and reaped on drop if it is still
/// around.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exit: Option<ExitStatus>,
}

impl ChildProcess {
    pub(crate) fn new(child: Child) -> Self {
        Self { child, exit: None }
    }

    /// The child's process id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The exit status, without blocking. `None` while the child runs.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    /// Blocks until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.exit = Some(status);
        Ok(status)
    }

    /// The current status, without blocking.
    pub fn status(&mut self) -> Result<ChildStatus> {
        Ok(self
            .try_wait()?
            .map_or(ChildStatus::Running, ChildStatus::from))
    }

    /// Sends `signal` to the child. Does nothing once the child is reaped.
    pub fn send_signal(&mut self, signal: i32) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let pid = libc::pid_t::try_from(self.child.id())?;
        // SAFETY: `pid` is our unreaped child, so the id cannot have been
        // reused by another process.
        if unsafe { libc::kill(pid, signal) } != 0 {
            log_then_return!(new_error!(
                "Failed to send signal {} to sandbox child {}: {:?}",
                Signal(signal),
                pid,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit.is_some() {
            return;
        }
        debug!("killing sandbox child {}", self.child.id());
        if self.send_signal(libc::SIGKILL).is_ok() {
            // Reap the zombie process.
            if let Err(e) = self.wait() {
                warn!("failed to reap sandbox child: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn status_follows_the_process() {
        let mut child = ChildProcess::new(Command::new("sleep").arg("30").spawn().unwrap());
        assert!(child.status().unwrap().is_running());
        child.send_signal(libc::SIGTERM).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(ChildStatus::from(status), ChildStatus::ExitedDueToSignal(libc::SIGTERM));
        assert_eq!(
            child.status().unwrap().to_string(),
            "exited due to signal (signal = SIGTERM)"
        );
        // signalling a reaped child is a no-op
        child.send_signal(libc::SIGKILL).unwrap();
    }

    #[test]
    fn exit_codes_are_reported() {
        let mut child = ChildProcess::new(Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap());
        assert_eq!(ChildStatus::from(child.wait().unwrap()), ChildStatus::Exited(7));
        assert_eq!(child.status().unwrap().to_string(), "exited (status = 7)");
    }
}
