use crate::protocol::Outbound;
use crate::session::Session;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fallback re-check interval when no file notification arrives.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How far into which file the agent has read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub offset: u64,
    pub file_id: Option<u64>,
}

#[derive(Debug, Default)]
pub struct History {
    pub lines: Vec<String>,
    pub cursor: LogCursor,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

// ---------------------------------------------------------------------------
// read_history — everything written before the agent started
// ---------------------------------------------------------------------------

/// Read the whole log file. A missing file is an empty history.
pub async fn read_history(path: &Path) -> io::Result<History> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(History::default()),
        Err(e) => return Err(e),
    };

    let meta = file.metadata().await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let lines = String::from_utf8_lossy(&buf)
        .lines()
        .map(String::from)
        .collect();
    Ok(History {
        lines,
        cursor: LogCursor {
            offset: buf.len() as u64,
            file_id: file_id(&meta),
        },
    })
}

// ---------------------------------------------------------------------------
// LogFollower — yields lines appended after the cursor
// ---------------------------------------------------------------------------

/// Follows appended lines. Tolerates the file not existing yet, and starts
/// over from the top when the file is truncated or replaced (rotation).
pub struct LogFollower {
    path: PathBuf,
    cursor: LogCursor,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    wakeups: Option<mpsc::Receiver<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl LogFollower {
    pub fn open(path: impl Into<PathBuf>, cursor: LogCursor) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let (watcher, wakeups) = match watch_parent(&path, tx) {
            Ok(w) => (Some(w), Some(rx)),
            Err(e) => {
                tracing::debug!(path = %path.display(), "file notifications unavailable, polling: {e}");
                (None, None)
            }
        };

        Self {
            path,
            cursor,
            partial: Vec::new(),
            ready: VecDeque::new(),
            wakeups,
            _watcher: watcher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next complete line. Trailing `\r` is stripped; a line
    /// without its newline yet is held back.
    pub async fn next_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(line);
            }
            self.poll().await?;
            if self.ready.is_empty() {
                self.wait_for_change().await;
            }
        }
    }

    async fn wait_for_change(&mut self) {
        let watcher_gone = match self.wakeups.as_mut() {
            Some(rx) => tokio::select! {
                woke = rx.recv() => woke.is_none(),
                _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => false,
            },
            None => {
                tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
                false
            }
        };
        if watcher_gone {
            self.wakeups = None;
        }
    }

    async fn poll(&mut self) -> io::Result<()> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let id = file_id(&meta);
        if self.cursor.file_id.is_some() && id != self.cursor.file_id {
            tracing::debug!(path = %self.path.display(), "log file replaced, reading new file");
            self.restart();
        } else if meta.len() < self.cursor.offset {
            tracing::debug!(path = %self.path.display(), "log file truncated, reading from start");
            self.restart();
        }
        self.cursor.file_id = id;

        if meta.len() == self.cursor.offset {
            return Ok(());
        }

        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        file.seek(io::SeekFrom::Start(self.cursor.offset)).await?;
        let mut buf = Vec::new();
        let n = file.read_to_end(&mut buf).await?;
        self.cursor.offset += n as u64;
        self.absorb(&buf);
        Ok(())
    }

    fn restart(&mut self) {
        self.cursor.offset = 0;
        self.partial.clear();
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.ready
                .push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// Watch the directory rather than the file so creation and rotation wake
/// us too.
fn watch_parent(path: &Path, tx: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            // A full slot already means "look again".
            let _ = tx.try_send(());
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Publish the existing log content as one HISTORY_DUMP (skipped when empty)
/// and return where following should pick up.
pub async fn publish_history(session: &Session, path: &Path) -> LogCursor {
    let history = match read_history(path).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(path = %path.display(), "error reading initial log file: {e}");
            return LogCursor::default();
        }
    };

    if !history.lines.is_empty() {
        tracing::info!(lines = history.lines.len(), "sending log history");
        if let Err(e) = session.publish(Outbound::HistoryDump(history.lines)).await {
            tracing::warn!("could not queue log history: {e}");
        }
    }
    history.cursor
}

pub fn spawn_log_follower(session: Arc<Session>, mut follower: LogFollower) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = session.cancellation();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                line = follower.next_line() => line,
            };

            match next {
                Ok(line) => {
                    if let Err(e) = session.publish(Outbound::Log(line)).await {
                        tracing::debug!("log follower stopping: {e}");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %follower.path().display(), "error following log file: {e}");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
