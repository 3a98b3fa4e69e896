use clap::Parser;
use remote_core::DEFAULT_MAX_FRAME_BYTES;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8765";
pub const DEFAULT_DB_PATH: &str = "remote.db";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PROBE_ACTION: &str = "snip";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub debug: bool,
    /// Window after accept in which the handshake must complete.
    pub grace_period: Duration,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    /// Action sent to an agent after each heartbeat. Empty disables probing.
    pub probe_action: String,
    pub probe_timeout: Duration,
    pub snapshot_keep: usize,
    pub in_flight_limit: usize,
    pub allow_remote_backend: bool,
    pub log_dir: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            debug: false,
            grace_period: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: Duration::from_secs(30),
            queue_capacity: 256,
            probe_action: DEFAULT_PROBE_ACTION.to_string(),
            probe_timeout: Duration::from_secs(30),
            snapshot_keep: 10,
            in_flight_limit: 1024,
            allow_remote_backend: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "remote-relay")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub db: String,
    #[arg(long, default_value = "")]
    pub data_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 30)]
    pub grace_seconds: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
    #[arg(long, default_value_t = 30)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value = DEFAULT_PROBE_ACTION)]
    pub probe_action: String,
    #[arg(long, default_value_t = 30)]
    pub probe_timeout: u64,
    #[arg(long, default_value_t = 10)]
    pub snapshot_keep: usize,
    #[arg(long, default_value_t = 1024)]
    pub in_flight_limit: usize,
    #[arg(long, default_value_t = false)]
    pub allow_remote_backend: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config(args: Args) -> RelayConfig {
    RelayConfig {
        addr: resolve_value(&args.addr, "REMOTE_RELAY_ADDR", DEFAULT_ADDR),
        db_path: PathBuf::from(resolve_value(&args.db, "REMOTE_DB", DEFAULT_DB_PATH)),
        data_dir: PathBuf::from(resolve_value(
            &args.data_dir,
            "REMOTE_DATA_DIR",
            DEFAULT_DATA_DIR,
        )),
        debug: args.debug || env_true("REMOTE_RELAY_DEBUG"),
        grace_period: Duration::from_secs(args.grace_seconds),
        max_frame_bytes: args.max_frame_bytes.max(1024),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity.max(1),
        probe_action: args.probe_action.trim().to_string(),
        probe_timeout: Duration::from_secs(args.probe_timeout.max(1)),
        snapshot_keep: args.snapshot_keep,
        in_flight_limit: args.in_flight_limit.max(1),
        allow_remote_backend: args.allow_remote_backend || env_true("REMOTE_ALLOW_REMOTE_BACKEND"),
        log_dir: resolve_value(&args.log_dir, "REMOTE_LOG_DIR", ""),
    }
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

pub(crate) fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
