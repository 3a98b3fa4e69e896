pub mod auth;
pub mod config;
pub mod files;
pub mod heartbeat;
pub mod logging;
pub mod registry;
pub mod router;
pub mod server;

pub use config::RelayConfig;
pub use server::{app, serve, Relay};
