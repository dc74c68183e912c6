use crate::protocol::{Inbound, ScriptPayload};
use std::future::Future;
use std::io;
use std::path::PathBuf;

pub const FALLBACK_SCRIPT_NAME: &str = "script";
pub const SCRIPT_EXTENSION: &str = "lua";

/// Delivers text to the game server's interactive console as if typed.
pub trait Console {
    fn send_keys(&self, text: &str) -> impl Future<Output = io::Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// Script naming
// ---------------------------------------------------------------------------

/// Strip everything but ASCII letters and digits, so the name cannot escape
/// the script directory.
pub fn sanitize_script_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        FALLBACK_SCRIPT_NAME.to_string()
    } else {
        cleaned
    }
}

pub fn script_file_name(name: &str, seq: u64) -> String {
    format!("{}_{seq}.{SCRIPT_EXTENSION}", sanitize_script_name(name))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Executes worker commands. Lives on the control loop, so the script
/// counter needs no synchronization.
pub struct Dispatcher<C> {
    console: C,
    script_dir: PathBuf,
    scripts_received: u64,
}

impl<C: Console> Dispatcher<C> {
    pub fn new(console: C, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            console,
            script_dir: script_dir.into(),
            scripts_received: 0,
        }
    }

    /// Failures are logged and never propagate: one bad command must not
    /// affect the connection or later messages.
    pub async fn dispatch(&mut self, msg: Inbound) {
        match msg {
            Inbound::Command(command) => self.run_command(&command).await,
            Inbound::Script(script) => {
                if let Err(e) = self.save_script(script).await {
                    tracing::warn!("error writing script file: {e}");
                }
            }
        }
    }

    async fn run_command(&self, command: &str) {
        tracing::info!(command, "executing command");
        if let Err(e) = self.console.send_keys(&format!("{command}\n")).await {
            tracing::warn!(command, "error executing command: {e}");
        }
    }

    async fn save_script(&mut self, script: ScriptPayload) -> io::Result<PathBuf> {
        self.scripts_received += 1;
        let path = self
            .script_dir
            .join(script_file_name(&script.name, self.scripts_received));

        tracing::info!(path = %path.display(), bytes = script.content.len(), "saving script");
        tokio::fs::write(&path, script.content.as_bytes()).await?;
        Ok(path)
    }
}
