//! Wire format shared by the relay, agents and the backend.
//!
//! Every message is one flat JSON object carried in a single websocket text
//! frame. The mandatory `type` field selects the variant; every other field is
//! type dependent. Types the relay does not consume itself are actions and
//! keep their fields opaque.

use crate::identity::{CorrelationToken, Identity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Frames up to 100 MiB are accepted so snapshots and file payloads fit.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Types the relay consumes itself. An action may not reuse one of these names.
pub const CONTROL_TYPES: &[&str] = &[
    "setup",
    "hello",
    "welcome",
    "heartbeat",
    "hosts",
    "cmd",
    "echo",
    "msg",
    "error",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes exceeds max {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing message type")]
    MissingType,
    #[error("{kind}: missing required field '{field}'")]
    MissingField { kind: String, field: &'static str },
    #[error("{kind}: invalid field '{field}': {reason}")]
    InvalidField {
        kind: String,
        field: &'static str,
        reason: String,
    },
    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The addressed agent has no live registry entry.
    TargetOffline,
    /// The agent is registered but its outbound queue refused the frame.
    DeliveryFailed,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::TargetOffline => "target_offline",
            FailureCode::DeliveryFailed => "delivery_failed",
        }
    }
}

/// A routed request: deliver `action` with `fields` to `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: Identity,
    pub token: CorrelationToken,
    pub action: String,
    pub fields: Map<String, Value>,
}

/// An opaque action request or reply.
///
/// `from` is only set by the relay when it forwards an agent reply to the
/// backend; anything an agent puts there is overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: String,
    pub token: Option<CorrelationToken>,
    pub from: Option<Identity>,
    pub fields: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            token: None,
            from: None,
            fields: Map::new(),
        }
    }

    pub fn with_token(mut self, token: CorrelationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub code: FailureCode,
    pub message: String,
    pub token: Option<CorrelationToken>,
    pub target: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Agent to relay without an identity; relay to agent with the minted one.
    Setup { identity: Option<Identity> },
    Hello { identity: Identity },
    Welcome { identity: Identity },
    Heartbeat,
    /// A request when `hosts` is `None`, the relay's answer otherwise.
    Hosts {
        token: Option<CorrelationToken>,
        hosts: Option<Vec<Identity>>,
    },
    Command(Command),
    Echo {
        message: Value,
        token: Option<CorrelationToken>,
    },
    Note { message: Value },
    Failure(Failure),
    Action(Action),
}

impl Envelope {
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Setup { .. } => "setup",
            Envelope::Hello { .. } => "hello",
            Envelope::Welcome { .. } => "welcome",
            Envelope::Heartbeat => "heartbeat",
            Envelope::Hosts { .. } => "hosts",
            Envelope::Command(_) => "cmd",
            Envelope::Echo { .. } => "echo",
            Envelope::Note { .. } => "msg",
            Envelope::Failure(_) => "error",
            Envelope::Action(action) => &action.kind,
        }
    }

    pub fn token(&self) -> Option<&CorrelationToken> {
        match self {
            Envelope::Hosts { token, .. } | Envelope::Echo { token, .. } => token.as_ref(),
            Envelope::Command(command) => Some(&command.token),
            Envelope::Failure(failure) => failure.token.as_ref(),
            Envelope::Action(action) => action.token.as_ref(),
            _ => None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Envelope::Setup { .. } | Envelope::Hello { .. })
    }

    pub fn failure(
        code: FailureCode,
        message: impl Into<String>,
        token: Option<CorrelationToken>,
        target: Option<Identity>,
    ) -> Self {
        Envelope::Failure(Failure {
            code,
            message: message.into(),
            token,
            target,
        })
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Envelope::Setup { identity } => {
                if let Some(identity) = identity {
                    map.insert("identity".to_string(), Value::from(identity.as_str()));
                }
            }
            Envelope::Hello { identity } | Envelope::Welcome { identity } => {
                map.insert("identity".to_string(), Value::from(identity.as_str()));
            }
            Envelope::Heartbeat => {}
            Envelope::Hosts { token, hosts } => {
                insert_token(&mut map, token.as_ref());
                if let Some(hosts) = hosts {
                    let list = hosts
                        .iter()
                        .map(|identity| Value::from(identity.as_str()))
                        .collect();
                    map.insert("hosts".to_string(), Value::Array(list));
                }
            }
            Envelope::Command(command) => {
                map.extend(command.fields.clone());
                map.insert("target".to_string(), Value::from(command.target.as_str()));
                map.insert("action".to_string(), Value::from(command.action.as_str()));
                insert_token(&mut map, Some(&command.token));
            }
            Envelope::Echo { message, token } => {
                map.insert("message".to_string(), message.clone());
                insert_token(&mut map, token.as_ref());
            }
            Envelope::Note { message } => {
                map.insert("message".to_string(), message.clone());
            }
            Envelope::Failure(failure) => {
                map.insert("code".to_string(), Value::from(failure.code.as_str()));
                map.insert("message".to_string(), Value::from(failure.message.as_str()));
                insert_token(&mut map, failure.token.as_ref());
                if let Some(target) = &failure.target {
                    map.insert("target".to_string(), Value::from(target.as_str()));
                }
            }
            Envelope::Action(action) => {
                map.extend(action.fields.clone());
                insert_token(&mut map, action.token.as_ref());
                match &action.from {
                    Some(from) => {
                        map.insert("from".to_string(), Value::from(from.as_str()));
                    }
                    None => {
                        map.remove("from");
                    }
                }
            }
        }
        map.insert("type".to_string(), Value::from(self.kind()));
        map
    }

    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, ProtocolError> {
        let kind = match map.remove("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            Some(Value::String(_)) | None => return Err(ProtocolError::MissingType),
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    kind: String::new(),
                    field: "type",
                    reason: "must be a string".to_string(),
                })
            }
        };

        let envelope = match kind.as_str() {
            "setup" => Envelope::Setup {
                identity: optional_string(&mut map, &kind, "identity")?.map(Identity::from),
            },
            "hello" => Envelope::Hello {
                identity: Identity::from(required_string(&mut map, &kind, "identity")?),
            },
            "welcome" => Envelope::Welcome {
                identity: Identity::from(required_string(&mut map, &kind, "identity")?),
            },
            "heartbeat" => Envelope::Heartbeat,
            "hosts" => Envelope::Hosts {
                token: optional_token(&mut map, &kind)?,
                hosts: optional_identity_list(&mut map, &kind, "hosts")?,
            },
            "cmd" => {
                let target = Identity::from(required_string(&mut map, &kind, "target")?);
                let token = CorrelationToken::new(required_string(&mut map, &kind, "token")?);
                let action = required_string(&mut map, &kind, "action")?;
                if CONTROL_TYPES.contains(&action.as_str()) {
                    return Err(ProtocolError::InvalidField {
                        kind,
                        field: "action",
                        reason: format!("'{action}' is reserved"),
                    });
                }
                Envelope::Command(Command {
                    target,
                    token,
                    action,
                    fields: map,
                })
            }
            "echo" => Envelope::Echo {
                message: required_value(&mut map, &kind, "message")?,
                token: optional_token(&mut map, &kind)?,
            },
            "msg" => Envelope::Note {
                message: required_value(&mut map, &kind, "message")?,
            },
            "error" => {
                let code_raw = required_value(&mut map, &kind, "code")?;
                let code = serde_json::from_value::<FailureCode>(code_raw).map_err(|err| {
                    ProtocolError::InvalidField {
                        kind: kind.clone(),
                        field: "code",
                        reason: err.to_string(),
                    }
                })?;
                Envelope::Failure(Failure {
                    code,
                    message: required_string(&mut map, &kind, "message")?,
                    token: optional_token(&mut map, &kind)?,
                    target: optional_string(&mut map, &kind, "target")?.map(Identity::from),
                })
            }
            _ => {
                let token = optional_token(&mut map, &kind)?;
                let from = optional_string(&mut map, &kind, "from")?.map(Identity::from);
                Envelope::Action(Action {
                    kind,
                    token,
                    from,
                    fields: map,
                })
            }
        };
        Ok(envelope)
    }
}

pub fn encode(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, ProtocolError> {
    let encoded = serde_json::to_string(&Value::Object(envelope.to_map()))
        .map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(ProtocolError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode(bytes: &[u8], max_frame_bytes: usize) -> Result<Envelope, ProtocolError> {
    if bytes.len() > max_frame_bytes {
        return Err(ProtocolError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    match value {
        Value::Object(map) => Envelope::from_map(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

fn insert_token(map: &mut Map<String, Value>, token: Option<&CorrelationToken>) {
    match token {
        Some(token) => {
            map.insert("token".to_string(), Value::from(token.as_str()));
        }
        None => {
            map.remove("token");
        }
    }
}

fn required_value(
    map: &mut Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<Value, ProtocolError> {
    match map.remove(field) {
        Some(Value::Null) | None => Err(ProtocolError::MissingField {
            kind: kind.to_string(),
            field,
        }),
        Some(value) => Ok(value),
    }
}

fn required_string(
    map: &mut Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    optional_string(map, kind, field)?.ok_or_else(|| ProtocolError::MissingField {
        kind: kind.to_string(),
        field,
    })
}

// Empty strings count as absent.
fn optional_string(
    map: &mut Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(ProtocolError::InvalidField {
            kind: kind.to_string(),
            field,
            reason: "must be a string".to_string(),
        }),
    }
}

fn optional_token(
    map: &mut Map<String, Value>,
    kind: &str,
) -> Result<Option<CorrelationToken>, ProtocolError> {
    Ok(optional_string(map, kind, "token")?.map(CorrelationToken::new))
}

fn optional_identity_list(
    map: &mut Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<Option<Vec<Identity>>, ProtocolError> {
    let items = match map.remove(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                kind: kind.to_string(),
                field,
                reason: "must be an array".to_string(),
            })
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(value) => Ok(Identity::from(value)),
            _ => Err(ProtocolError::InvalidField {
                kind: kind.to_string(),
                field,
                reason: "entries must be strings".to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
