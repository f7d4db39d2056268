//! Canonical shapes for domain events.
//!
//! Servers broadcast the same logical event under several names and with
//! several field aliases (`content`/`text`/`body`, `message_id`/`id`). Every
//! inbound domain frame is normalized here once so consumers depend on a
//! single shape.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Message,
    MessageRead,
    Typing,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatMessage {
    pub id: Option<String>,
    pub content: Option<String>,
    pub sender_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadReceipt {
    pub message_id: Option<String>,
    pub reader_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    Message(ChatMessage),
    MessageRead(ReadReceipt),
    Typing(TypingIndicator),
    Other,
}

/// Strip namespaces (`App\Events\MessageSent`), Echo's leading `.`, case and
/// punctuation so `message.sent`, `MessageSent` and `.message-sent` compare equal.
fn fold_event_name(event: &str) -> String {
    let name = event.rsplit('\\').next().unwrap_or(event);
    name.trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn classify_event(event: &str) -> EventClass {
    let folded = fold_event_name(event);
    if folded.contains("typing") {
        return EventClass::Typing;
    }
    match folded.as_str() {
        "messageread" | "messagesread" | "messageseen" | "clientmessageread" | "read" => {
            EventClass::MessageRead
        }
        "messagesent" | "messageprocessed" | "messagecreated" | "messagereceived"
        | "newmessage" | "message" => EventClass::Message,
        _ => EventClass::Other,
    }
}

/// Read the first present key as a string; numbers are stringified.
fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    let lookup = |obj: &Value| {
        keys.iter().find_map(|key| match obj.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    // Some broadcasts wrap the payload in `{"message": {...}}`.
    lookup(data).or_else(|| data.get("message").filter(|m| m.is_object()).and_then(lookup))
}

fn bool_field(data: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| data.get(*key)?.as_bool())
}

impl DomainEvent {
    pub fn normalize(event: &str, data: &Value) -> Self {
        match classify_event(event) {
            EventClass::Message => DomainEvent::Message(ChatMessage {
                id: string_field(data, &["message_id", "id"]),
                content: string_field(data, &["content", "text", "body"]),
                sender_id: string_field(data, &["sender_id", "user_id"]),
                conversation_id: string_field(data, &["conversation_id", "session_id"]),
            }),
            EventClass::MessageRead => DomainEvent::MessageRead(ReadReceipt {
                message_id: string_field(data, &["message_id", "id"]),
                reader_id: string_field(data, &["reader_id", "user_id"]),
            }),
            EventClass::Typing => {
                let stopped = fold_event_name(event).contains("stop");
                DomainEvent::Typing(TypingIndicator {
                    user_id: string_field(data, &["user_id", "id"]),
                    user_name: string_field(data, &["user_name", "name"]),
                    is_typing: bool_field(data, &["is_typing", "typing"]).unwrap_or(!stopped),
                })
            }
            EventClass::Other => DomainEvent::Other,
        }
    }

    /// Identity used to collapse the same chat message arriving under
    /// different event names.
    pub fn dedup_id(&self) -> Option<&str> {
        match self {
            DomainEvent::Message(message) => message.id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_names_fold_across_conventions() {
        for name in [
            "MessageSent",
            "message.sent",
            ".message-sent",
            "App\\Events\\MessageSent",
            "message.processed",
            "MessageProcessed",
        ] {
            assert_eq!(classify_event(name), EventClass::Message, "{name}");
        }
        assert_eq!(classify_event("message.read"), EventClass::MessageRead);
        assert_eq!(classify_event("client-typing"), EventClass::Typing);
        assert_eq!(classify_event("typing-indicator"), EventClass::Typing);
        assert_eq!(classify_event("ConversationAssigned"), EventClass::Other);
    }

    #[test]
    fn message_fields_accept_aliases() {
        let event = DomainEvent::normalize(
            "message.processed",
            &json!({"id": 17, "text": "hi", "user_id": "u1", "session_id": "s9"}),
        );
        assert_eq!(
            event,
            DomainEvent::Message(ChatMessage {
                id: Some("17".into()),
                content: Some("hi".into()),
                sender_id: Some("u1".into()),
                conversation_id: Some("s9".into()),
            })
        );
        assert_eq!(event.dedup_id(), Some("17"));
    }

    #[test]
    fn message_id_wins_over_id() {
        let event = DomainEvent::normalize("MessageSent", &json!({"message_id": "m1", "id": "row-5"}));
        assert_eq!(event.dedup_id(), Some("m1"));
    }

    #[test]
    fn wrapped_message_payload_is_unwrapped() {
        let event = DomainEvent::normalize(
            "MessageSent",
            &json!({"message": {"id": "m2", "content": "wrapped"}}),
        );
        assert_eq!(event.dedup_id(), Some("m2"));
    }

    #[test]
    fn typing_defaults_and_stop_events() {
        let started = DomainEvent::normalize("client-typing", &json!({"user_id": 4, "name": "Ana"}));
        assert_eq!(
            started,
            DomainEvent::Typing(TypingIndicator {
                user_id: Some("4".into()),
                user_name: Some("Ana".into()),
                is_typing: true,
            })
        );

        let stopped = DomainEvent::normalize("typing.stopped", &json!({"user_id": 4}));
        assert!(matches!(stopped, DomainEvent::Typing(TypingIndicator { is_typing: false, .. })));

        let explicit = DomainEvent::normalize("client-typing", &json!({"is_typing": false}));
        assert!(matches!(explicit, DomainEvent::Typing(TypingIndicator { is_typing: false, .. })));
    }
}
