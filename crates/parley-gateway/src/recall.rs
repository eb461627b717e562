//! Message lifecycle: `sent` -> `recalled`.
//!
//! Only the sender may recall, only once. The content swap and status flip are
//! persisted by a single conditional update, then a `message_recalled` event
//! goes to every current member of the conversation.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{Message, MessageStatus, RECALL_PLACEHOLDER};

use crate::registry::{ConnectionRegistry, FanoutReport};
use crate::router::encode_event;
use crate::store::{Stores, blocking};

#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("message {0} was sent by someone else")]
    Forbidden(Uuid),

    #[error("message {0} is already recalled")]
    AlreadyRecalled(Uuid),

    #[error("storage failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whether `caller` may move `message` to `recalled`.
pub fn check_transition(message: &Message, caller: Uuid) -> Result<(), RecallError> {
    if message.sender_id != caller {
        return Err(RecallError::Forbidden(message.id));
    }
    match message.status {
        MessageStatus::Sent => Ok(()),
        MessageStatus::Recalled => Err(RecallError::AlreadyRecalled(message.id)),
    }
}

/// Recall `message_id` on behalf of `caller` and broadcast the change.
/// Returns the message as persisted after the transition.
pub async fn recall_message(
    stores: &Stores,
    registry: &ConnectionRegistry,
    caller: Uuid,
    message_id: Uuid,
) -> Result<(Message, FanoutReport), RecallError> {
    let messages = stores.messages.clone();
    let message = blocking(move || messages.message(message_id))
        .await?
        .ok_or(RecallError::NotFound(message_id))?;

    check_transition(&message, caller)?;

    let messages = stores.messages.clone();
    let changed = blocking(move || messages.mark_recalled(message_id, RECALL_PLACEHOLDER)).await?;
    if !changed {
        // Lost a race with a concurrent recall of the same message.
        return Err(RecallError::AlreadyRecalled(message_id));
    }

    let recalled = Message {
        content: RECALL_PLACEHOLDER.to_string(),
        status: MessageStatus::Recalled,
        ..message
    };

    let conversations = stores.conversations.clone();
    let conversation_id = recalled.conversation_id;
    let members = blocking(move || conversations.members(conversation_id)).await?;

    let payload = encode_event(&ServerEvent::MessageRecalled {
        message_id,
        conversation_id,
        sender_id: caller,
        content: RECALL_PLACEHOLDER.to_string(),
        timestamp: Utc::now().timestamp(),
    })?;
    let report = registry.send_many(members.iter().map(|m| m.user_id), &payload);

    info!(
        "{} recalled message {} in {} ({} of {} members reached)",
        caller,
        message_id,
        conversation_id,
        report.queued,
        report.attempted()
    );
    Ok((recalled, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: Uuid, status: MessageStatus) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: sender,
            content: "hello".into(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sender_may_recall_sent_message() {
        let sender = Uuid::new_v4();
        assert!(check_transition(&message(sender, MessageStatus::Sent), sender).is_ok());
    }

    #[test]
    fn others_may_not_recall() {
        let msg = message(Uuid::new_v4(), MessageStatus::Sent);
        assert!(matches!(
            check_transition(&msg, Uuid::new_v4()),
            Err(RecallError::Forbidden(id)) if id == msg.id
        ));
    }

    #[test]
    fn recalled_is_terminal() {
        let sender = Uuid::new_v4();
        let msg = message(sender, MessageStatus::Recalled);
        assert!(matches!(
            check_transition(&msg, sender),
            Err(RecallError::AlreadyRecalled(_))
        ));
    }
}
