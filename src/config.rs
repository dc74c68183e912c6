use crate::cli::Cli;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const WORKER_PATH: &str = "/ws/agent";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid worker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Everything the agent needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub worker_url: String,
    pub session_id: String,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub metadata_dir: PathBuf,
    pub script_dir: PathBuf,
    pub screen_session: String,
    pub disk_path: PathBuf,
    pub health_interval: Duration,
    pub pid_timeout: Duration,
}

impl From<Cli> for AgentConfig {
    fn from(cli: Cli) -> Self {
        Self {
            worker_url: cli.worker_url,
            session_id: cli.session_id,
            log_file: cli.log_file,
            pid_file: cli.pid_file,
            metadata_dir: cli.metadata_dir,
            script_dir: cli.script_dir,
            screen_session: cli.screen_session,
            disk_path: cli.disk_path,
            health_interval: Duration::from_millis(cli.health_interval_ms),
            pid_timeout: Duration::from_secs(cli.pid_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Container metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub branch: String,
    pub game_version: String,
    pub container_tag: String,
}

impl Metadata {
    /// Read the metadata files written by the image build. Missing files are
    /// reported and left empty.
    pub fn load(dir: &Path) -> Self {
        Self {
            branch: read_metadata_file(dir, "game_branch.txt"),
            game_version: read_metadata_file(dir, "game_version.txt"),
            container_tag: read_metadata_file(dir, "container_tag.txt"),
        }
    }

    /// Branch label used to tag the connection, e.g. `x86-64`.
    pub fn kind(&self) -> String {
        self.branch.trim().to_lowercase()
    }

    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("branch".to_string(), self.branch.clone()),
            ("gameVersion".to_string(), self.game_version.clone()),
            ("containerTag".to_string(), self.container_tag.clone()),
        ])
    }
}

fn read_metadata_file(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(content) => content.trim().to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read metadata file: {e}");
            String::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Worker endpoint
// ---------------------------------------------------------------------------

/// Build the agent socket URL from the worker's base URL. Plain `http://` and
/// `ws://` bases keep an unencrypted socket; anything else is upgraded to `wss`.
pub fn worker_endpoint(base: &str, session_id: &str, kind: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: base.to_string(),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        _ => "wss",
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot use scheme '{scheme}'")))?;
    url.set_path(WORKER_PATH);
    url.set_fragment(None);

    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("session", session_id);
        if !kind.is_empty() {
            query.append_pair("type", kind);
        }
    }
    Ok(url)
}
