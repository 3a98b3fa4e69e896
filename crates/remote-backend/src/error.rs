use remote_core::{Identity, PendingError, ProtocolError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("target {0} is offline")]
    TargetOffline(Identity),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("relay connection lost before the reply arrived")]
    Disconnected,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("relay rejected the request: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for CommandError {
    fn from(err: ProtocolError) -> Self {
        CommandError::Protocol(err.to_string())
    }
}

impl From<PendingError> for CommandError {
    fn from(err: PendingError) -> Self {
        match err {
            PendingError::Timeout { timeout, .. } => CommandError::Timeout(timeout),
            // A slot only disappears early when the connection dropped and
            // every outstanding token was cancelled.
            PendingError::Cancelled(_) | PendingError::Unknown(_) => CommandError::Disconnected,
            PendingError::AlreadyAwaited(token) => {
                CommandError::Protocol(format!("token {token} awaited twice"))
            }
        }
    }
}
