use clap::Parser;
use clap::builder::NonEmptyStringValueParser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gmod-agent",
    about = "Sidecar that streams a game server's logs and health to its worker",
    version
)]
pub struct Cli {
    /// Base URL of the worker to report to
    #[arg(long, env = "WORKER_URL", value_parser = NonEmptyStringValueParser::new())]
    pub worker_url: String,

    /// Session this agent belongs to
    #[arg(long, env = "SESSION_ID", value_parser = NonEmptyStringValueParser::new())]
    pub session_id: String,

    /// Game server console log to stream
    #[arg(
        long,
        env = "AGENT_LOG_FILE",
        default_value = "/home/steam/gmodserver/garrysmod/console.log"
    )]
    pub log_file: PathBuf,

    /// File the game server writes its PID to
    #[arg(
        long,
        env = "AGENT_PID_FILE",
        default_value = "/home/steam/gmodserver/garrysmod/gmod.pid"
    )]
    pub pid_file: PathBuf,

    /// Directory holding game_branch.txt, game_version.txt and container_tag.txt
    #[arg(long, env = "AGENT_METADATA_DIR", default_value = "/home/steam/metadata")]
    pub metadata_dir: PathBuf,

    /// Where scripts pushed by the worker are saved
    #[arg(
        long,
        env = "AGENT_SCRIPT_DIR",
        default_value = "/home/steam/gmodserver/garrysmod/lua/gluadev"
    )]
    pub script_dir: PathBuf,

    /// screen session running the game server console
    #[arg(long, env = "AGENT_SCREEN_SESSION", default_value = "gmod")]
    pub screen_session: String,

    /// Filesystem whose usage is reported
    #[arg(long, env = "AGENT_DISK_PATH", default_value = "/")]
    pub disk_path: PathBuf,

    /// Milliseconds between health samples
    #[arg(
        long,
        env = "AGENT_HEALTH_INTERVAL_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub health_interval_ms: u64,

    /// Seconds to wait for the PID file before giving up
    #[arg(long, env = "AGENT_PID_TIMEOUT_SECS", default_value_t = 30)]
    pub pid_timeout_secs: u64,
}
