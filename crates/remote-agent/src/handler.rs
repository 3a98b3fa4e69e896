use remote_core::Action;
use serde_json::Value;

/// Executes actions forwarded by the relay. The returned reply is sent back
/// with the request's correlation token attached.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, request: &Action) -> Action;
}

/// Diagnostic actions only: `echo_back` returns the request fields and `ping`
/// answers `pong`. Everything else is reported as unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHandler;

impl ActionHandler for BuiltinHandler {
    fn handle(&self, request: &Action) -> Action {
        match request.kind.as_str() {
            "echo_back" => {
                let mut reply = Action::new("echo_back");
                reply.fields = request.fields.clone();
                reply
            }
            "ping" => Action::new("ping").with_field("pong", Value::Bool(true)),
            other => Action::new(other).with_field("status", Value::from("unsupported")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn echo_back_returns_request_fields() {
        let request = Action::new("echo_back").with_field("text", json!("hi"));
        let reply = BuiltinHandler.handle(&request);
        assert_eq!(reply.kind, "echo_back");
        assert_eq!(reply.field_str("text"), Some("hi"));
    }

    #[test]
    fn unknown_action_is_unsupported() {
        let reply = BuiltinHandler.handle(&Action::new("hotkey"));
        assert_eq!(reply.kind, "hotkey");
        assert_eq!(reply.field_str("status"), Some("unsupported"));
    }
}
