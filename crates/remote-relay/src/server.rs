use crate::auth::{with_store, Admission, AuthGate, Screen};
use crate::config::RelayConfig;
use crate::files::FileStore;
use crate::heartbeat::HeartbeatTracker;
use crate::registry::{Connection, ConnectionRegistry};
use crate::router::Router;
use axum::{
    extract::{
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use remote_core::{decode, Envelope, Identity, PendingRequestTable};
use remote_storage::IdentityStore;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Relay {
    config: RelayConfig,
    conn_counter: AtomicU64,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn IdentityStore>,
    admission: Admission,
    router: Router,
}

impl Relay {
    pub fn new(config: RelayConfig, store: Arc<dyn IdentityStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let probes = Arc::new(PendingRequestTable::new());
        let files = Arc::new(FileStore::new(
            config.data_dir.clone(),
            config.snapshot_keep,
        ));
        let heartbeat = HeartbeatTracker::new(
            registry.clone(),
            store.clone(),
            probes.clone(),
            config.probe_action.clone(),
            config.probe_timeout,
        );
        Self {
            admission: Admission::new(store.clone(), config.allow_remote_backend),
            router: Router::new(registry.clone(), heartbeat, probes, files),
            conn_counter: AtomicU64::new(0),
            registry,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let conn = Arc::new(Connection::new(
            self.next_conn_id(),
            remote,
            tx,
            self.config.max_frame_bytes,
            self.config.in_flight_limit,
        ));
        let mut gate = AuthGate::new(Instant::now(), self.config.grace_period);
        info!(event = "connection_open", conn_id = %conn.conn_id, remote = %remote);

        loop {
            let next = tokio::select! {
                next = ws_receiver.next() => next,
                _ = conn.closed() => {
                    info!(event = "connection_shutdown", conn_id = %conn.conn_id);
                    break;
                }
                _ = tokio::time::sleep_until(gate.deadline()), if !gate.is_authenticated() => {
                    warn!(event = "handshake_deadline", conn_id = %conn.conn_id, remote = %remote);
                    conn.close(close_code::POLICY, "authentication deadline exceeded");
                    break;
                }
            };
            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                    break;
                }
                None => break,
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %conn.conn_id, size = data.len());
            }
            let envelope = match decode(&data, self.config.max_frame_bytes) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn.conn_id, error = %err);
                    continue;
                }
            };

            match gate.screen(&envelope, Instant::now()) {
                Screen::Admit(identity) => self.router.dispatch(&identity, &conn, envelope).await,
                Screen::Handshake => {
                    if self.handshake(&mut gate, &conn, envelope).await.is_break() {
                        break;
                    }
                }
                Screen::Reject => {
                    warn!(
                        event = "unauthenticated_message",
                        conn_id = %conn.conn_id,
                        kind = envelope.kind()
                    );
                }
                Screen::Expire => {
                    warn!(event = "handshake_deadline", conn_id = %conn.conn_id, remote = %remote);
                    conn.close(close_code::POLICY, "authentication deadline exceeded");
                    break;
                }
            }
        }

        self.teardown(&gate, &conn).await;
        gate.close();
        drop(conn);
        let _ = write_task.await;
    }

    async fn handshake(
        &self,
        gate: &mut AuthGate,
        conn: &Arc<Connection>,
        envelope: Envelope,
    ) -> ControlFlow<()> {
        match envelope {
            Envelope::Setup { .. } => match self.admission.setup().await {
                Ok(identity) => {
                    info!(event = "identity_minted", conn_id = %conn.conn_id, identity = %identity);
                    gate.identified(identity.clone());
                    conn.send(&Envelope::Setup {
                        identity: Some(identity),
                    });
                }
                Err(err) => {
                    error!(event = "setup_failed", conn_id = %conn.conn_id, error = %err);
                }
            },
            Envelope::Hello { identity } => {
                if let Err(err) = self.admission.verify(&identity, conn.remote).await {
                    warn!(
                        event = "hello_rejected",
                        conn_id = %conn.conn_id,
                        identity = %identity,
                        error = %err
                    );
                    conn.close(close_code::POLICY, "authentication failed");
                    gate.close();
                    return ControlFlow::Break(());
                }
                self.admit(gate, conn, identity).await;
            }
            other => {
                debug!(event = "handshake_ignored", conn_id = %conn.conn_id, kind = other.kind());
            }
        }
        ControlFlow::Continue(())
    }

    async fn admit(&self, gate: &mut AuthGate, conn: &Arc<Connection>, identity: Identity) {
        gate.authenticated(identity.clone());
        // Welcome is queued before registration; the peer's own next frame is read only after
        // admit returns, but other peers may briefly find the identity unroutable.
        conn.send(&Envelope::Welcome {
            identity: identity.clone(),
        });

        let displaced = if identity.is_backend() {
            self.registry.set_backend(conn.clone()).await
        } else {
            let now = Utc::now();
            let displaced = self
                .registry
                .register(identity.clone(), conn.clone(), now)
                .await;
            self.persist_last_seen(&identity, now).await;
            displaced
        };
        if let Some(previous) = displaced {
            info!(
                event = "connection_replaced",
                identity = %identity,
                previous = %previous.conn_id,
                conn_id = %conn.conn_id
            );
            previous.close(close_code::NORMAL, "replaced by a newer connection");
        }
        info!(event = "client_authenticated", conn_id = %conn.conn_id, identity = %identity);
    }

    async fn teardown(&self, gate: &AuthGate, conn: &Arc<Connection>) {
        let Some(identity) = gate.identity() else {
            info!(event = "connection_closed", conn_id = %conn.conn_id, authenticated = false);
            return;
        };
        let released = if identity.is_backend() {
            self.registry.release_backend(conn).await
        } else {
            let released = self.registry.release(identity, conn).await;
            if released {
                self.persist_last_seen(identity, Utc::now()).await;
            }
            released
        };
        info!(
            event = "connection_closed",
            conn_id = %conn.conn_id,
            identity = %identity,
            released = released
        );
    }

    async fn persist_last_seen(&self, identity: &Identity, at: chrono::DateTime<Utc>) {
        let id = identity.clone();
        if let Err(err) = with_store(&self.store, move |store| store.touch_host(&id, at)).await {
            warn!(event = "last_seen_persist_error", identity = %identity, error = %err);
        }
    }
}

pub fn app(relay: Arc<Relay>) -> axum::Router {
    axum::Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(relay)
}

pub async fn serve<F>(listener: TcpListener, relay: Arc<Relay>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    let max = relay.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            relay.handle_socket(socket, addr).await;
        })
}
