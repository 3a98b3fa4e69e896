use crate::files::FileStore;
use crate::heartbeat::HeartbeatTracker;
use crate::registry::{Connection, ConnectionRegistry};
use chrono::Utc;
use remote_core::{
    Action, Command, CorrelationToken, Envelope, FailureCode, Identity, PendingRequestTable,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("target {0} is not online")]
    TargetOffline(Identity),
    #[error("delivery to {0} failed")]
    DeliveryFailed(Identity),
}

impl RoutingError {
    pub fn code(&self) -> FailureCode {
        match self {
            RoutingError::TargetOffline(_) => FailureCode::TargetOffline,
            RoutingError::DeliveryFailed(_) => FailureCode::DeliveryFailed,
        }
    }
}

/// Dispatches envelopes from authenticated peers.
///
/// Control types are answered locally. `cmd` is forwarded to its target as a
/// bare action carrying the issuer's token. Actions arriving from agents are
/// replies: they settle a relay probe or travel on to the backend tagged with
/// the replying identity.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    heartbeat: HeartbeatTracker,
    probes: Arc<PendingRequestTable<Action>>,
    files: Arc<FileStore>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        heartbeat: HeartbeatTracker,
        probes: Arc<PendingRequestTable<Action>>,
        files: Arc<FileStore>,
    ) -> Self {
        Self {
            registry,
            heartbeat,
            probes,
            files,
        }
    }

    pub async fn dispatch(&self, sender: &Identity, conn: &Arc<Connection>, envelope: Envelope) {
        match envelope {
            Envelope::Heartbeat => {
                if sender.is_backend() {
                    debug!(event = "backend_heartbeat", conn_id = %conn.conn_id);
                    return;
                }
                self.heartbeat.on_heartbeat(sender, conn).await;
            }
            Envelope::Hosts { token, hosts: None } => {
                let hosts = self.registry.list_identities().await;
                conn.send(&Envelope::Hosts {
                    token,
                    hosts: Some(hosts),
                });
            }
            Envelope::Echo { message, token } => {
                conn.send(&Envelope::Echo { message, token });
            }
            Envelope::Note { message } => {
                info!(event = "peer_note", conn_id = %conn.conn_id, identity = %sender, message = %message);
            }
            Envelope::Command(command) => {
                let token = command.token.clone();
                let target = command.target.clone();
                if let Err(err) = self.route_command(command).await {
                    warn!(
                        event = "route_failed",
                        conn_id = %conn.conn_id,
                        identity = %sender,
                        target = %target,
                        token = %token,
                        error = %err
                    );
                    conn.send(&Envelope::failure(
                        err.code(),
                        err.to_string(),
                        Some(token),
                        Some(target),
                    ));
                }
            }
            Envelope::Action(action) if !sender.is_backend() => {
                self.handle_agent_reply(sender, conn, action).await;
            }
            other => {
                warn!(
                    event = "unexpected_message",
                    conn_id = %conn.conn_id,
                    identity = %sender,
                    kind = other.kind()
                );
            }
        }
    }

    /// Forwards the inner action of `command` to its target. Nothing is
    /// queued when the target is offline.
    pub async fn route_command(&self, command: Command) -> Result<(), RoutingError> {
        let Command {
            target,
            token,
            action,
            fields,
        } = command;
        let Some(conn) = self.registry.lookup(&target).await else {
            return Err(RoutingError::TargetOffline(target));
        };

        conn.track(token.clone(), &action);
        let forward = Envelope::Action(Action {
            kind: action,
            token: Some(token.clone()),
            from: None,
            fields,
        });
        if !conn.send(&forward) {
            conn.settle(&token);
            return Err(RoutingError::DeliveryFailed(target));
        }
        debug!(event = "command_forwarded", conn_id = %conn.conn_id, target = %target, token = %token);
        Ok(())
    }

    async fn handle_agent_reply(&self, identity: &Identity, conn: &Arc<Connection>, action: Action) {
        let token = match action.token.clone() {
            Some(token) => {
                conn.settle(&token);
                Some(token)
            }
            None => conn.next_in_flight(&action.kind),
        };

        if action.kind == "upload" {
            self.serve_upload(identity, conn, action, token);
            return;
        }

        self.persist_payload(identity, &action);

        let probe_token = token.as_ref().filter(|token| {
            self.heartbeat.is_probe_kind(&action.kind) && self.probes.is_pending(token)
        });
        if let Some(token) = probe_token {
            self.probes.resolve(token, action);
            return;
        }

        let Some(backend) = self.registry.backend().await else {
            warn!(
                event = "backend_absent",
                identity = %identity,
                kind = %action.kind,
                token = %display_token(token.as_ref())
            );
            return;
        };
        let kind = action.kind.clone();
        let reply = Envelope::Action(Action {
            from: Some(identity.clone()),
            token,
            ..action
        });
        if !backend.send(&reply) {
            warn!(event = "backend_send_error", conn_id = %backend.conn_id, identity = %identity, kind = %kind);
        }
    }

    /// Answers an agent's `upload` with the requested file from its own files
    /// directory attached as base64 `data`. Uploads stay between relay and
    /// agent.
    fn serve_upload(
        &self,
        identity: &Identity,
        conn: &Arc<Connection>,
        request: Action,
        token: Option<CorrelationToken>,
    ) {
        let Some(filename) = request.field_str("filename").map(str::to_string) else {
            warn!(event = "upload_missing_filename", identity = %identity);
            return;
        };
        let files = self.files.clone();
        let identity = identity.clone();
        let conn = conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut reply = Action {
                token,
                from: None,
                ..request
            };
            match files.load_file(&identity, &filename) {
                Ok((name, data)) => {
                    reply.fields.insert("filename".to_string(), Value::from(name));
                    reply.fields.insert("data".to_string(), Value::from(data));
                }
                Err(err) => {
                    warn!(event = "upload_error", identity = %identity, filename = %filename, error = %err);
                    reply.fields.remove("data");
                    reply.fields.insert("error".to_string(), Value::from(err.to_string()));
                }
            }
            if !conn.send(&Envelope::Action(reply)) {
                warn!(event = "upload_send_error", conn_id = %conn.conn_id, identity = %identity);
            }
        });
    }

    fn persist_payload(&self, identity: &Identity, action: &Action) {
        let Some(data) = action.field_str("data") else {
            return;
        };
        let filename = match action.kind.as_str() {
            "snip" => None,
            "download" => match action.field_str("filename") {
                Some(name) => Some(name.to_string()),
                None => return,
            },
            _ => return,
        };

        let files = self.files.clone();
        let identity = identity.clone();
        let data = data.to_string();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || {
            let result = match &filename {
                Some(name) => files.store_file(&identity, name, &data),
                None => files.store_snapshot(&identity, &data, now),
            };
            match result {
                Ok(path) => {
                    debug!(event = "payload_saved", identity = %identity, path = %path.display())
                }
                Err(err) => warn!(event = "payload_save_error", identity = %identity, error = %err),
            }
        });
    }
}

fn display_token(token: Option<&CorrelationToken>) -> &str {
    token.map(CorrelationToken::as_str).unwrap_or("-")
}
