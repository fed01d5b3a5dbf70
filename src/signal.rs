//! Termination of processes by pid.
//!
//! Pids come from the settings store, so the process may belong to a previous
//! run of the shell or may already be gone. Callers need to tell "no such
//! process" apart from a real failure; `TerminateError::NotFound` carries that.

use std::io;
use std::time::Duration;

use thiserror::Error;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The termination request was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated {
    pub pid: u32,
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("process {0} does not exist")]
    NotFound(u32),
    #[error("failed to terminate process {pid}: {source}")]
    Failed {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// A process addressed by pid.
pub trait ProcessHandle: Send + Sync {
    /// Asks the process to exit.
    fn terminate(&self) -> Result<Terminated, TerminateError>;
    /// Ends the process without giving it a chance to clean up.
    fn force_kill(&self) -> Result<Terminated, TerminateError>;
    fn is_alive(&self) -> bool;
}

/// A process of the host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsProcess {
    pid: u32,
}

impl OsProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[cfg(unix)]
impl OsProcess {
    // Children are spawned as process group leaders, so the group is signalled
    // as well to take down anything they forked.
    fn send(&self, signal: libc::c_int) -> Result<Terminated, TerminateError> {
        let pid = self.pid as libc::pid_t;
        if pid <= 0 {
            return Err(TerminateError::NotFound(self.pid));
        }
        // Never init: its negated pid would address every process.
        if pid == 1 {
            return Err(TerminateError::Failed {
                pid: self.pid,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        unsafe {
            let _ = libc::kill(-pid, signal);
            if libc::kill(pid, signal) == 0 {
                return Ok(Terminated { pid: self.pid });
            }
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(TerminateError::NotFound(self.pid))
        } else {
            Err(TerminateError::Failed {
                pid: self.pid,
                source: err,
            })
        }
    }
}

#[cfg(unix)]
impl ProcessHandle for OsProcess {
    fn terminate(&self) -> Result<Terminated, TerminateError> {
        self.send(libc::SIGTERM)
    }

    fn force_kill(&self) -> Result<Terminated, TerminateError> {
        self.send(libc::SIGKILL)
    }

    fn is_alive(&self) -> bool {
        let pid = self.pid as libc::pid_t;
        if pid <= 0 {
            return false;
        }
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
impl OsProcess {
    fn terminate_process(&self) -> Result<Terminated, TerminateError> {
        use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_INVALID_PARAMETER};
        use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, self.pid);
            if handle == 0 {
                if GetLastError() == ERROR_INVALID_PARAMETER {
                    return Err(TerminateError::NotFound(self.pid));
                }
                return Err(TerminateError::Failed {
                    pid: self.pid,
                    source: io::Error::last_os_error(),
                });
            }
            let ok = TerminateProcess(handle, 1);
            let err = io::Error::last_os_error();
            CloseHandle(handle);
            if ok == 0 {
                return Err(TerminateError::Failed {
                    pid: self.pid,
                    source: err,
                });
            }
        }
        Ok(Terminated { pid: self.pid })
    }
}

#[cfg(windows)]
impl ProcessHandle for OsProcess {
    // Windows has no SIGTERM; a console-less server can only be terminated.
    fn terminate(&self) -> Result<Terminated, TerminateError> {
        self.terminate_process()
    }

    fn force_kill(&self) -> Result<Terminated, TerminateError> {
        self.terminate_process()
    }

    fn is_alive(&self) -> bool {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };
        const STILL_ACTIVE: u32 = 259;

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, self.pid);
            if handle == 0 {
                return false;
            }
            let mut code = 0u32;
            let ok = GetExitCodeProcess(handle, &mut code);
            CloseHandle(handle);
            ok != 0 && code == STILL_ACTIVE
        }
    }
}

/// Polls until the process is gone. Returns `false` on timeout.
pub async fn wait_for_exit(process: &dyn ProcessHandle, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process.is_alive() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminates_a_live_process_and_reports_missing_ones() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let process = OsProcess::new(pid);
        assert!(process.is_alive());
        assert_eq!(process.terminate().unwrap(), Terminated { pid });
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(wait_for_exit(&process, Duration::from_secs(2)).await);
        assert!(matches!(process.terminate(), Err(TerminateError::NotFound(p)) if p == pid));
    }

    #[test]
    fn init_is_never_signalled() {
        let process = OsProcess::new(1);
        assert!(matches!(
            process.terminate(),
            Err(TerminateError::Failed { pid: 1, .. })
        ));
        assert!(matches!(
            process.force_kill(),
            Err(TerminateError::Failed { pid: 1, .. })
        ));
    }

    #[test]
    fn invalid_pid_is_not_found() {
        let process = OsProcess::new(0);
        assert!(!process.is_alive());
        assert!(matches!(process.terminate(), Err(TerminateError::NotFound(0))));
    }
}
