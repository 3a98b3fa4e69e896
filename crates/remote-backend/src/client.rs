use crate::error::CommandError;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use remote_core::{
    decode, encode, Action, Command, CorrelationToken, Envelope, FailureCode, Identity,
    PendingRequestTable, DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{protocol::WebSocketConfig, Message};
use tokio_tungstenite::connect_async_with_config;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub relay_url: Url,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
}

impl BackendConfig {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            reconnect_delay: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            queue_capacity: 256,
        }
    }
}

struct Shared {
    config: BackendConfig,
    pending: PendingRequestTable<Envelope>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach(&self, sender: mpsc::Sender<String>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        self.connected.send_replace(true);
    }

    fn detach(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.connected.send_replace(false);
        let abandoned = self.pending.cancel_all();
        if abandoned > 0 {
            warn!(event = "pending_abandoned", count = abandoned);
        }
    }
}

/// Handle to the backend's relay connection.
///
/// The connection is maintained by a background task that re-authenticates
/// after every transport loss. Requests issued while disconnected fail with
/// `NotConnected`; requests in flight when the link drops fail with
/// `Disconnected`.
pub struct BackendClient {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackendClient {
    pub fn spawn(config: BackendConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            pending: PendingRequestTable::new(),
            outbound: Mutex::new(None),
            connected,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(shared.clone(), shutdown_rx));
        Self {
            shared,
            shutdown,
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Waits until the relay has welcomed the backend. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.shared.connected.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, connected.wait_for(|value| *value)).await,
            Ok(Ok(_))
        );
        ready
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Sends `action` to `target` and waits for the agent's reply.
    pub async fn command(
        &self,
        target: &Identity,
        action: &str,
        fields: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Action, CommandError> {
        let token = self.shared.pending.issue();
        let envelope = Envelope::Command(Command {
            target: target.clone(),
            token: token.clone(),
            action: action.to_string(),
            fields,
        });
        match self.request(&token, &envelope, timeout).await? {
            Envelope::Action(reply) => Ok(reply),
            Envelope::Failure(failure) => match failure.code {
                FailureCode::TargetOffline => Err(CommandError::TargetOffline(
                    failure.target.unwrap_or_else(|| target.clone()),
                )),
                FailureCode::DeliveryFailed => Err(CommandError::Rejected(failure.message)),
            },
            other => Err(unexpected(&other)),
        }
    }

    /// Runs the same command against every target concurrently.
    pub async fn command_many(
        &self,
        targets: &[Identity],
        action: &str,
        fields: Map<String, Value>,
        timeout: Duration,
    ) -> BTreeMap<Identity, Result<Action, CommandError>> {
        let requests = targets.iter().map(|target| {
            let fields = fields.clone();
            async move {
                let outcome = self.command(target, action, fields, timeout).await;
                (target.clone(), outcome)
            }
        });
        join_all(requests).await.into_iter().collect()
    }

    pub async fn hosts(&self, timeout: Duration) -> Result<Vec<Identity>, CommandError> {
        let token = self.shared.pending.issue();
        let envelope = Envelope::Hosts {
            token: Some(token.clone()),
            hosts: None,
        };
        match self.request(&token, &envelope, timeout).await? {
            Envelope::Hosts {
                hosts: Some(hosts), ..
            } => Ok(hosts),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn echo(&self, message: Value, timeout: Duration) -> Result<Value, CommandError> {
        let token = self.shared.pending.issue();
        let envelope = Envelope::Echo {
            message,
            token: Some(token.clone()),
        };
        match self.request(&token, &envelope, timeout).await? {
            Envelope::Echo { message, .. } => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    async fn request(
        &self,
        token: &CorrelationToken,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CommandError> {
        let Some(sender) = self.shared.sender() else {
            self.shared.pending.cancel(token);
            return Err(CommandError::NotConnected);
        };
        let frame = match encode(envelope, self.shared.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.pending.cancel(token);
                return Err(err.into());
            }
        };
        if sender.send(frame).await.is_err() {
            self.shared.pending.cancel(token);
            return Err(CommandError::Disconnected);
        }
        Ok(self.shared.pending.wait(token, timeout).await?)
    }
}

fn unexpected(envelope: &Envelope) -> CommandError {
    CommandError::Protocol(format!("unexpected {} reply", envelope.kind()))
}

async fn connection_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let url = shared.config.relay_url.clone();
    loop {
        match session(&shared, &mut shutdown).await {
            Ok(true) => {
                shared.detach();
                info!(event = "backend_stopped");
                return;
            }
            Ok(false) => info!(event = "relay_disconnected", url = %url),
            Err(err) => warn!(event = "relay_session_error", url = %url, error = %err),
        }
        shared.detach();

        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = shutdown.changed() => {
                info!(event = "backend_stopped");
                return;
            }
        }
    }
}

/// One authenticated session. Returns `Ok(true)` when shutdown was requested.
async fn session(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, CommandError> {
    let config = &shared.config;
    let max = config.max_frame_bytes;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(max);
    ws_config.max_frame_size = Some(max);
    let (mut ws, _) = connect_async_with_config(config.relay_url.as_str(), Some(ws_config), false)
        .await
        .map_err(|_| CommandError::NotConnected)?;

    let hello = encode(
        &Envelope::Hello {
            identity: Identity::backend(),
        },
        max,
    )?;
    ws.send(Message::Text(hello))
        .await
        .map_err(|_| CommandError::Disconnected)?;

    let deadline = tokio::time::Instant::now() + config.handshake_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| CommandError::Timeout(config.handshake_timeout))?;
        match next {
            Some(Ok(Message::Text(text))) => match decode(text.as_bytes(), max)? {
                Envelope::Welcome { .. } => break,
                other => debug!(event = "handshake_skipped", kind = other.kind()),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(CommandError::Rejected("backend hello refused".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(_)) => return Err(CommandError::Disconnected),
        }
    }

    let (tx, mut rx) = mpsc::channel::<String>(config.queue_capacity);
    shared.attach(tx);
    info!(event = "backend_authenticated", url = %config.relay_url);

    loop {
        tokio::select! {
            next = ws.next() => {
                let data = match next {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => return Ok(false),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(event = "read_error", error = %err);
                        return Ok(false);
                    }
                };
                match decode(&data, max) {
                    Ok(envelope) => deliver(shared, envelope),
                    Err(err) => warn!(event = "message_invalid", error = %err),
                }
            }
            Some(frame) = rx.recv() => {
                if let Err(err) = ws.send(Message::Text(frame)).await {
                    warn!(event = "write_error", error = %err);
                    return Ok(false);
                }
            }
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                return Ok(true);
            }
        }
    }
}

fn deliver(shared: &Shared, envelope: Envelope) {
    let Some(token) = envelope.token().cloned() else {
        debug!(event = "unsolicited_message", kind = envelope.kind());
        return;
    };
    shared.pending.resolve(&token, envelope);
}
