use clap::Parser;
use remote_agent::{run_agent, AgentConfig, BuiltinHandler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "remote-agent")]
struct Args {
    #[arg(long, env = "REMOTE_RELAY_URL", default_value = "ws://127.0.0.1:8765/ws")]
    relay_url: String,
    #[arg(long, env = "REMOTE_IDENTITY_FILE", default_value = "agent.json")]
    identity_file: PathBuf,
    #[arg(long, default_value_t = 5)]
    heartbeat_seconds: u64,
    #[arg(long, default_value_t = 5)]
    reconnect_seconds: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let relay_url = match Url::parse(&args.relay_url) {
        Ok(url) => url,
        Err(err) => {
            error!(event = "invalid_relay_url", url = %args.relay_url, error = %err);
            return;
        }
    };
    let mut config = AgentConfig::new(relay_url, args.identity_file);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_seconds.max(1));
    config.reconnect_delay = Duration::from_secs(args.reconnect_seconds.max(1));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "agent_shutdown");
        let _ = shutdown_tx.send(true);
    });

    info!(event = "agent_start", url = %config.relay_url, identity_file = %config.identity_file.display());
    run_agent(config, Arc::new(BuiltinHandler), shutdown_rx).await;
}
