use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PID_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum PidError {
    #[error("timed out after {waited:?} waiting for PID file at {}", .path.display())]
    Timeout { path: PathBuf, waited: Duration },
}

/// Parse PID file contents. Anything but a positive integer counts as "not
/// written yet".
pub fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse().ok().filter(|pid| *pid > 0)
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| parse_pid(&s))
}

/// Poll `path` until the game server has written its PID, or give up after
/// `timeout`.
pub async fn wait_for_pid_file(path: &Path, timeout: Duration) -> Result<u32, PidError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(pid) = read_pid_file(path) {
            return Ok(pid);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PidError::Timeout {
                path: path.to_path_buf(),
                waited: timeout,
            });
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
}
