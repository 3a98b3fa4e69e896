use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reserved identity the control backend authenticates with.
pub const BACKEND_IDENTITY: &str = "backend";

/// Opaque identifier of an authenticated peer.
///
/// Agents receive a relay-minted identity during `setup` and reuse it on every
/// reconnect. The backend uses [`BACKEND_IDENTITY`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn backend() -> Self {
        Self(BACKEND_IDENTITY.to_string())
    }

    pub fn is_backend(&self) -> bool {
        self.0 == BACKEND_IDENTITY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key tying a request to its asynchronous reply. Never reused once consumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
