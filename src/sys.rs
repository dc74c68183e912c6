use crate::dispatch::Console;
use std::io;
use std::time::Duration;

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;

    /// Probe a PID with signal 0. EPERM still means the process exists.
    pub fn check_pid(pid: u32) -> io::Result<bool> {
        let raw = i32::try_from(pid).map_err(io::Error::other)?;
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(nix::errno::Errno::EPERM) => Ok(true),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Resolves on SIGTERM or SIGINT.
    pub async fn signal_shutdown() -> io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        Ok(())
    }
}

// =========================================================================
// Fallback implementation
// =========================================================================

#[cfg(not(unix))]
mod platform {
    use super::*;

    pub fn check_pid(pid: u32) -> io::Result<bool> {
        use sysinfo::{Pid, ProcessesToUpdate, System};

        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(system.process(pid).is_some())
    }

    pub async fn signal_shutdown() -> io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}

pub use platform::*;

// =========================================================================
// Game console
// =========================================================================

/// How long a single `screen` invocation may take before it is killed.
pub const CONSOLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Types into the game server's `screen` session.
#[derive(Debug, Clone)]
pub struct ScreenConsole {
    session: String,
    program: String,
    timeout: Duration,
}

impl ScreenConsole {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            program: "screen".to_string(),
            timeout: CONSOLE_TIMEOUT,
        }
    }

    /// Run `program` in place of `screen`, with the same arguments.
    pub fn with_program(mut self, program: impl Into<String>, timeout: Duration) -> Self {
        self.program = program.into();
        self.timeout = timeout;
        self
    }
}

impl Console for ScreenConsole {
    async fn send_keys(&self, text: &str) -> io::Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(["-S", &self.session, "-X", "stuff", text])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();
        let status = tokio::time::timeout(self.timeout, status)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} did not finish within {:?}", self.program, self.timeout),
                )
            })??;

        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("screen exited with {status}")))
        }
    }
}
