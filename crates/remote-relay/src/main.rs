use clap::Parser;
use remote_relay::config::{load_config, Args};
use remote_relay::logging::init_logging;
use remote_relay::{serve, Relay};
use remote_storage::SqliteStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    let _log_guard = init_logging(config.debug, &config.log_dir, "remote-relay");
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "store_open_error", path = %config.db_path.display(), error = %err);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err);
            return;
        }
    };

    info!(
        event = "relay_start",
        addr = %addr,
        db = %config.db_path.display(),
        data_dir = %config.data_dir.display()
    );
    let relay = Arc::new(Relay::new(config, store));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "relay_shutdown");
    };

    if let Err(err) = serve(listener, relay, shutdown).await {
        error!(event = "relay_error", error = %err);
    }
}
