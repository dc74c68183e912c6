use clap::Parser;
use gmod_agent::cli::Cli;
use gmod_agent::config::AgentConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();

    let config = AgentConfig::from(Cli::parse());
    tracing::info!(session = %config.session_id, "agent starting");
    gmod_agent::agent::run(config, Box::new(exit_process)).await
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
