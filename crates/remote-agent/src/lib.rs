pub mod client;
pub mod handler;
pub mod identity_file;

pub use client::{run_agent, run_session, AgentConfig, ClientError, SessionEnd};
pub use handler::{ActionHandler, BuiltinHandler};
