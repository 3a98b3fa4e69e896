use crate::handler::ActionHandler;
use crate::identity_file::{clear_identity, load_identity, save_identity};
use futures_util::{SinkExt, StreamExt};
use remote_core::{decode, encode, Envelope, Identity, ProtocolError, DEFAULT_MAX_FRAME_BYTES};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_url: Url,
    pub identity_file: PathBuf,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl AgentConfig {
    pub fn new(relay_url: Url, identity_file: impl Into<PathBuf>) -> Self {
        Self {
            relay_url,
            identity_file: identity_file.into(),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("identity file error: {0}")]
    IdentityFile(#[from] io::Error),
    #[error("relay rejected identity {0}")]
    Rejected(Identity),
    #[error("relay closed the connection during the handshake")]
    HandshakeClosed,
    #[error("handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
    #[error("unexpected {0} during the handshake")]
    UnexpectedReply(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Keeps the agent connected until `shutdown` flips or its sender is dropped.
/// Each session runs setup (first start only), hello, then heartbeats and
/// action replies; any failure waits `reconnect_delay` and starts over.
pub async fn run_agent(
    config: AgentConfig,
    handler: Arc<dyn ActionHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match run_session(&config, handler.as_ref(), &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => {
                info!(event = "agent_stopped");
                return;
            }
            Ok(SessionEnd::Disconnected) => {
                info!(event = "relay_disconnected", url = %config.relay_url);
            }
            Err(ClientError::Rejected(identity)) => {
                warn!(event = "identity_rejected", identity = %identity);
                if let Err(err) = clear_identity(&config.identity_file) {
                    warn!(event = "identity_file_error", error = %err);
                }
            }
            Err(err) => {
                warn!(event = "relay_session_error", url = %config.relay_url, error = %err);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => {
                info!(event = "agent_stopped");
                return;
            }
        }
    }
}

pub async fn run_session(
    config: &AgentConfig,
    handler: &dyn ActionHandler,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, ClientError> {
    let max = config.max_frame_bytes;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(max);
    ws_config.max_frame_size = Some(max);
    let (mut ws, _) =
        connect_async_with_config(config.relay_url.as_str(), Some(ws_config), false).await?;
    info!(event = "relay_connected", url = %config.relay_url);

    let identity = match load_identity(&config.identity_file)? {
        Some(identity) => identity,
        None => {
            send_envelope(&mut ws, &Envelope::Setup { identity: None }, max).await?;
            let identity = match await_handshake(&mut ws, config, "setup").await? {
                Envelope::Setup {
                    identity: Some(identity),
                } => identity,
                other => return Err(ClientError::UnexpectedReply(other.kind().to_string())),
            };
            save_identity(&config.identity_file, &identity)?;
            info!(event = "identity_assigned", identity = %identity);
            identity
        }
    };

    send_envelope(
        &mut ws,
        &Envelope::Hello {
            identity: identity.clone(),
        },
        max,
    )
    .await?;
    match await_handshake(&mut ws, config, "welcome").await {
        Ok(Envelope::Welcome { .. }) => {}
        Ok(other) => return Err(ClientError::UnexpectedReply(other.kind().to_string())),
        Err(ClientError::HandshakeClosed) => return Err(ClientError::Rejected(identity)),
        Err(err) => return Err(err),
    }
    info!(event = "agent_authenticated", identity = %identity);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            next = ws.next() => {
                let data = match next {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err.into()),
                };
                if let Some(reply) = handle_frame(handler, &data, max) {
                    send_envelope(&mut ws, &reply, max).await?;
                }
            }
            _ = heartbeat.tick() => {
                send_envelope(&mut ws, &Envelope::Heartbeat, max).await?;
            }
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

/// Turns a relay frame into the reply to send, if any.
pub fn handle_frame(handler: &dyn ActionHandler, data: &[u8], max: usize) -> Option<Envelope> {
    let envelope = match decode(data, max) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "message_invalid", error = %err);
            return None;
        }
    };
    match envelope {
        Envelope::Action(request) => {
            debug!(
                event = "action_received",
                kind = %request.kind,
                token = request.token.as_ref().map(|token| token.as_str()).unwrap_or("-")
            );
            let mut reply = handler.handle(&request);
            reply.token = request.token;
            reply.from = None;
            Some(Envelope::Action(reply))
        }
        Envelope::Failure(failure) => {
            warn!(
                event = "relay_error",
                code = failure.code.as_str(),
                message = %failure.message
            );
            None
        }
        other => {
            debug!(event = "message_ignored", kind = other.kind());
            None
        }
    }
}

async fn await_handshake(
    ws: &mut Socket,
    config: &AgentConfig,
    expected: &'static str,
) -> Result<Envelope, ClientError> {
    let deadline = Instant::now() + config.handshake_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ClientError::HandshakeTimeout(expected))?;
        let data = match next {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::HandshakeClosed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        };
        match decode(&data, config.max_frame_bytes)? {
            Envelope::Failure(failure) => {
                warn!(event = "relay_error", code = failure.code.as_str(), message = %failure.message);
            }
            envelope if envelope.kind() == expected => return Ok(envelope),
            other => {
                debug!(event = "handshake_skipped", kind = other.kind(), expected = expected);
            }
        }
    }
}

async fn send_envelope(ws: &mut Socket, envelope: &Envelope, max: usize) -> Result<(), ClientError> {
    let text = encode(envelope, max)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BuiltinHandler;
    use remote_core::{Action, CorrelationToken};
    use serde_json::json;

    #[test]
    fn action_reply_carries_request_token_and_no_from() {
        let request = Envelope::Action(
            Action::new("echo_back")
                .with_token(CorrelationToken::from("tok-1"))
                .with_field("text", json!("hi")),
        );
        let frame = encode(&request, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let reply = handle_frame(&BuiltinHandler, frame.as_bytes(), DEFAULT_MAX_FRAME_BYTES)
            .expect("reply");

        let Envelope::Action(reply) = reply else {
            panic!("expected action reply");
        };
        assert_eq!(reply.token, Some(CorrelationToken::from("tok-1")));
        assert_eq!(reply.from, None);
        assert_eq!(reply.field_str("text"), Some("hi"));
    }

    #[test]
    fn control_frames_need_no_reply() {
        let frame = json!({"type": "hosts", "hosts": []}).to_string();
        assert!(handle_frame(&BuiltinHandler, frame.as_bytes(), DEFAULT_MAX_FRAME_BYTES).is_none());
        assert!(handle_frame(&BuiltinHandler, b"not json", DEFAULT_MAX_FRAME_BYTES).is_none());
    }
}
