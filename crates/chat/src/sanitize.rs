use echo_llm::{WireMessage, WireRole};
use serde_json::Value;

/// True iff the value is an object with a `role` from the wire vocabulary and a
/// textual `content`.
pub fn validate(message: &Value) -> bool {
    let Some(object) = message.as_object() else {
        return false;
    };
    let role_ok = object
        .get("role")
        .and_then(Value::as_str)
        .and_then(WireRole::parse)
        .is_some();
    let content_ok = object.get("content").is_some_and(Value::is_string);
    role_ok && content_ok
}

/// Validates loosely-typed messages and converts the survivors. Content is trimmed and
/// messages left blank are dropped. Order is preserved.
pub fn sanitize_json(messages: &[Value]) -> Vec<WireMessage> {
    let valid = messages
        .iter()
        .filter(|message| validate(message))
        .filter_map(|message| {
            let role = message.get("role").and_then(Value::as_str).and_then(WireRole::parse)?;
            let content = message.get("content").and_then(Value::as_str)?;
            Some(WireMessage::new(role, content))
        })
        .collect();
    sanitize(valid)
}

/// Trims content and drops blank messages. Never reorders or deduplicates.
pub fn sanitize(messages: Vec<WireMessage>) -> Vec<WireMessage> {
    let before = messages.len();
    let kept = messages
        .into_iter()
        .filter_map(|message| {
            let content = message.content.trim();
            if content.is_empty() {
                None
            } else {
                Some(WireMessage::new(message.role, content))
            }
        })
        .collect::<Vec<_>>();

    if kept.len() != before {
        tracing::debug!(dropped = before - kept.len(), "sanitizer dropped blank messages");
    }
    kept
}
