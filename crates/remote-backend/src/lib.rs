//! Client side of the relay for the privileged backend: authenticates with the
//! reserved identity and correlates command replies by token.

mod client;
mod error;

pub use client::{BackendClient, BackendConfig};
pub use error::CommandError;
