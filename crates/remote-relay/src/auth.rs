use chrono::Utc;
use remote_core::{Envelope, Identity};
use remote_storage::{IdentityStore, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown identity {0}")]
    UnknownIdentity(Identity),
    #[error("backend identity refused from non-loopback peer {0}")]
    BackendNotLocal(SocketAddr),
    #[error("identity store error: {0}")]
    Store(#[from] StoreError),
    #[error("identity store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Open,
    /// Holds an identity minted by `setup`; still unauthenticated.
    Identified(Identity),
    Authenticated(Identity),
    Closed,
}

/// What the connection loop should do with an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Handshake,
    Admit(Identity),
    Reject,
    Expire,
}

/// Per-connection admission state machine.
#[derive(Debug)]
pub struct AuthGate {
    state: AuthState,
    opened_at: Instant,
    grace: Duration,
}

impl AuthGate {
    pub fn new(opened_at: Instant, grace: Duration) -> Self {
        Self {
            state: AuthState::Open,
            opened_at,
            grace,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            AuthState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated(_))
    }

    pub fn deadline(&self) -> Instant {
        self.opened_at + self.grace
    }

    pub fn screen(&self, envelope: &Envelope, now: Instant) -> Screen {
        match &self.state {
            AuthState::Authenticated(identity) => Screen::Admit(identity.clone()),
            AuthState::Closed => Screen::Expire,
            AuthState::Open | AuthState::Identified(_) => {
                if now >= self.deadline() {
                    Screen::Expire
                } else if envelope.is_handshake() {
                    Screen::Handshake
                } else {
                    Screen::Reject
                }
            }
        }
    }

    pub fn identified(&mut self, identity: Identity) {
        if matches!(self.state, AuthState::Open | AuthState::Identified(_)) {
            self.state = AuthState::Identified(identity);
        }
    }

    pub fn authenticated(&mut self, identity: Identity) {
        if !matches!(self.state, AuthState::Closed) {
            self.state = AuthState::Authenticated(identity);
        }
    }

    pub fn close(&mut self) {
        self.state = AuthState::Closed;
    }
}

/// Store-backed checks behind `setup` and `hello`.
pub struct Admission {
    store: Arc<dyn IdentityStore>,
    allow_remote_backend: bool,
}

impl Admission {
    pub fn new(store: Arc<dyn IdentityStore>, allow_remote_backend: bool) -> Self {
        Self {
            store,
            allow_remote_backend,
        }
    }

    pub async fn setup(&self) -> Result<Identity, AuthError> {
        let record = with_store(&self.store, |store| store.create_host(Utc::now())).await?;
        Ok(record.identity)
    }

    pub async fn verify(&self, identity: &Identity, remote: SocketAddr) -> Result<(), AuthError> {
        if identity.is_backend() {
            if self.allow_remote_backend || remote.ip().is_loopback() {
                return Ok(());
            }
            return Err(AuthError::BackendNotLocal(remote));
        }
        let lookup = identity.clone();
        match with_store(&self.store, move |store| store.get_host(&lookup)).await? {
            Some(_) => Ok(()),
            None => Err(AuthError::UnknownIdentity(identity.clone())),
        }
    }
}

/// Runs a store call on the blocking pool.
pub(crate) async fn with_store<F, R>(store: &Arc<dyn IdentityStore>, op: F) -> Result<R, AuthError>
where
    F: FnOnce(&dyn IdentityStore) -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|err| AuthError::Task(err.to_string()))?
        .map_err(AuthError::from)
}
