use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent FROM client TO server over the WebSocket.
///
/// Clients may include `from` or `timestamp`; those fields are ignored and
/// restamped by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Direct message, `to` is the recipient's username.
    Chat { to: String, content: String },

    /// Message to a group, `to` is the group conversation id.
    GroupMessage { to: Uuid, content: String },

    /// Recall one of the caller's own messages.
    Recall { message_id: Uuid },
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Server accepted the connection
    Ready { user_id: Uuid, username: String },

    /// A direct message, delivered to the recipient and echoed to the sender
    Chat {
        message_id: Uuid,
        conversation_id: Uuid,
        to: String,
        from: Uuid,
        from_username: String,
        content: String,
        timestamp: i64,
    },

    /// A group message, delivered to every member including the sender
    GroupMessage {
        message_id: Uuid,
        conversation_id: Uuid,
        to: Uuid,
        group_name: Option<String>,
        from: Uuid,
        from_username: String,
        content: String,
        timestamp: i64,
    },

    /// A message was recalled by its sender; `content` is the placeholder
    MessageRecalled {
        message_id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        timestamp: i64,
    },

    /// The receiving user was added to a new group
    GroupCreated {
        conversation_id: Uuid,
        group_name: String,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_frame_ignores_client_stamped_fields() {
        let raw = r#"{"type":"chat","to":"bob","content":"hey","from":"spoofed","timestamp":1}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Chat {
                to: "bob".into(),
                content: "hey".into()
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"typing"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"recall"}"#).is_err());
    }

    #[test]
    fn events_are_flat_with_type_tag() {
        let id = Uuid::new_v4();
        let event = ServerEvent::MessageRecalled {
            message_id: id,
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            content: "[message recalled]".into(),
            timestamp: 1_700_000_000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message_recalled");
        assert_eq!(value["message_id"], id.to_string());
        assert_eq!(value["timestamp"], 1_700_000_000);
    }
}
