use echo_llm::{WireMessage, WireRole};
use echo_storage::{MessageRecord, MessageRole, NewMessage};
use serde::{Deserialize, Serialize};

/// What to do with stored roles outside {human, assistant, system}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownRolePolicy {
    #[default]
    MapToUser,
    Drop,
}

pub fn wire_role(role: &MessageRole, policy: UnknownRolePolicy) -> Option<WireRole> {
    match role {
        MessageRole::Human => Some(WireRole::User),
        MessageRole::Assistant => Some(WireRole::Assistant),
        MessageRole::System => Some(WireRole::System),
        MessageRole::Other(raw) => match policy {
            UnknownRolePolicy::MapToUser => {
                tracing::debug!(role = %raw, "mapping unknown stored role to user");
                Some(WireRole::User)
            }
            UnknownRolePolicy::Drop => {
                tracing::debug!(role = %raw, "dropping message with unknown stored role");
                None
            }
        },
    }
}

/// Converts stored records to wire messages, skipping blank content. Order is kept.
pub fn to_wire_format(messages: &[MessageRecord], policy: UnknownRolePolicy) -> Vec<WireMessage> {
    messages
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .filter_map(|message| {
            wire_role(&message.role, policy)
                .map(|role| WireMessage::new(role, message.content.clone()))
        })
        .collect()
}

/// Reverse mapping. Assistant rows are tagged with `model_tag`.
pub fn from_wire_format(messages: &[WireMessage], model_tag: &str) -> Vec<NewMessage> {
    messages
        .iter()
        .map(|message| match message.role {
            WireRole::User => NewMessage::human(message.content.clone()),
            WireRole::System => NewMessage::system(message.content.clone()),
            WireRole::Assistant => NewMessage::assistant(message.content.clone(), model_tag),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use echo_storage::{MessageId, RoomId};

    use super::*;

    fn record(id: i64, role: MessageRole, content: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId(id),
            room_id: RoomId::new_v4(),
            model_tag: role.as_str().to_string(),
            role,
            content: content.to_string(),
            timestamp_unix_micros: id as u64,
        }
    }

    #[test]
    fn roles_map_to_wire_vocabulary() {
        let records = vec![
            record(1, MessageRole::System, "rules"),
            record(2, MessageRole::Human, "hi"),
            record(3, MessageRole::Assistant, "hello"),
        ];
        assert_eq!(
            to_wire_format(&records, UnknownRolePolicy::default()),
            vec![
                WireMessage::system("rules"),
                WireMessage::user("hi"),
                WireMessage::assistant("hello"),
            ]
        );
    }

    #[test]
    fn blank_content_is_skipped() {
        let records = vec![
            record(1, MessageRole::Human, "   "),
            record(2, MessageRole::Assistant, ""),
            record(3, MessageRole::Human, "kept"),
        ];
        assert_eq!(
            to_wire_format(&records, UnknownRolePolicy::MapToUser),
            vec![WireMessage::user("kept")]
        );
    }

    #[test]
    fn unknown_roles_follow_policy() {
        let records = vec![record(1, MessageRole::Other("tool".into()), "output")];
        assert_eq!(
            to_wire_format(&records, UnknownRolePolicy::MapToUser),
            vec![WireMessage::user("output")]
        );
        assert!(to_wire_format(&records, UnknownRolePolicy::Drop).is_empty());
    }

    #[test]
    fn reverse_mapping_tags_assistant_rows() {
        let rows = from_wire_format(
            &[WireMessage::user("q"), WireMessage::assistant("a")],
            "model-x",
        );
        assert_eq!(rows[0], NewMessage::human("q"));
        assert_eq!(rows[1], NewMessage::assistant("a", "model-x"));
    }
}
