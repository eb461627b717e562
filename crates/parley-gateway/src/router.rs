use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::events::{ClientFrame, ServerEvent};
use parley_types::models::{Conversation, ConversationKind, Message, User};

use crate::recall::{self, RecallError};
use crate::registry::{ConnectionRegistry, FanoutReport, Payload};
use crate::store::{Stores, blocking};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown recipient '{0}'")]
    UnknownRecipient(String),

    #[error("conversation {0} not found")]
    UnknownConversation(Uuid),

    #[error("{user_id} is not a member of {conversation_id}")]
    NotMember { conversation_id: Uuid, user_id: Uuid },

    #[error("storage failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Recall(#[from] RecallError),
}

/// What a successfully routed frame did.
#[derive(Debug)]
pub enum Routed {
    Sent { message: Message, report: FanoutReport },
    Recalled { message: Message, report: FanoutReport },
}

pub fn encode_event(event: &ServerEvent) -> Result<Payload, serde_json::Error> {
    Ok(serde_json::to_string(event)?.into())
}

/// Persists inbound messages and fans them out through the registry.
///
/// Every path stores before it delivers: nothing reaches a recipient's queue
/// unless `save_message` has already returned.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    stores: Stores,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, stores: Stores) -> Self {
        Self { registry, stores }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Handle one text frame from `sender`'s socket. Fire-and-forget: failures
    /// are logged and the frame dropped, the connection is never affected.
    pub async fn handle_frame(&self, sender: &User, raw: &str) -> Option<Routed> {
        let result = match serde_json::from_str::<ClientFrame>(raw) {
            Ok(frame) => self.dispatch(sender, frame).await,
            Err(e) => Err(RouteError::Malformed(e.to_string())),
        };

        match result {
            Ok(routed) => Some(routed),
            Err(e) => {
                log_dropped(sender, raw, &e);
                None
            }
        }
    }

    async fn dispatch(&self, sender: &User, frame: ClientFrame) -> Result<Routed, RouteError> {
        match frame {
            ClientFrame::Chat { to, content } => {
                let (message, report) = self.send_direct(sender, &to, content).await?;
                Ok(Routed::Sent { message, report })
            }
            ClientFrame::GroupMessage { to, content } => {
                let (message, report) = self.send_group(sender, to, content).await?;
                Ok(Routed::Sent { message, report })
            }
            ClientFrame::Recall { message_id } => {
                let (message, report) = self.recall(sender.id, message_id).await?;
                Ok(Routed::Recalled { message, report })
            }
        }
    }

    /// Store a direct message to the user named `to`, then deliver it to them
    /// and echo it back to the sender.
    pub async fn send_direct(
        &self,
        sender: &User,
        to: &str,
        content: String,
    ) -> Result<(Message, FanoutReport), RouteError> {
        check_content(&content)?;

        let users = self.stores.users.clone();
        let username = to.to_string();
        let recipient = blocking(move || users.user_by_username(&username))
            .await?
            .filter(|r| r.id != sender.id)
            .ok_or_else(|| RouteError::UnknownRecipient(to.to_string()))?;

        let conversations = self.stores.conversations.clone();
        let (sender_id, recipient_id) = (sender.id, recipient.id);
        let conversation = blocking(move || {
            conversations.get_or_create_single_conversation(sender_id, recipient_id)
        })
        .await?;

        let message = self.save(conversation.id, sender.id, content).await?;

        let payload = encode_event(&ServerEvent::Chat {
            message_id: message.id,
            conversation_id: conversation.id,
            to: recipient.username.clone(),
            from: sender.id,
            from_username: sender.username.clone(),
            content: message.content.clone(),
            timestamp: message.created_at.timestamp(),
        })?;
        let report = self.registry.send_many([recipient.id, sender.id], &payload);

        debug!(
            "{} -> {}: message {} ({} queued, {} offline, {} backpressure)",
            sender.username, recipient.username, message.id, report.queued, report.offline, report.backpressure
        );
        Ok((message, report))
    }

    /// Store a message in group `conversation_id`, then deliver it to every
    /// member, the sender included.
    pub async fn send_group(
        &self,
        sender: &User,
        conversation_id: Uuid,
        content: String,
    ) -> Result<(Message, FanoutReport), RouteError> {
        check_content(&content)?;

        let group = self.group_for_member(conversation_id, sender.id).await?;
        let message = self.save(group.id, sender.id, content).await?;

        let conversations = self.stores.conversations.clone();
        let members = blocking(move || conversations.members(conversation_id)).await?;

        let payload = encode_event(&ServerEvent::GroupMessage {
            message_id: message.id,
            conversation_id,
            to: conversation_id,
            group_name: group.name.clone(),
            from: sender.id,
            from_username: sender.username.clone(),
            content: message.content.clone(),
            timestamp: message.created_at.timestamp(),
        })?;
        let report = self.registry.send_many(members.iter().map(|m| m.user_id), &payload);

        debug!(
            "{} -> group {}: message {} ({} of {} members queued)",
            sender.username,
            conversation_id,
            message.id,
            report.queued,
            report.attempted()
        );
        Ok((message, report))
    }

    pub async fn recall(
        &self,
        caller: Uuid,
        message_id: Uuid,
    ) -> Result<(Message, FanoutReport), RecallError> {
        recall::recall_message(&self.stores, &self.registry, caller, message_id).await
    }

    /// Tell the members of a freshly created group about it.
    pub fn notify_group_created(&self, group: &Conversation, member_ids: &[Uuid]) -> FanoutReport {
        let event = ServerEvent::GroupCreated {
            conversation_id: group.id,
            group_name: group.name.clone().unwrap_or_default(),
            timestamp: Utc::now().timestamp(),
        };
        match encode_event(&event) {
            Ok(payload) => self.registry.send_many(member_ids.iter().copied(), &payload),
            Err(e) => {
                error!("Failed to encode group_created for {}: {}", group.id, e);
                FanoutReport::default()
            }
        }
    }

    async fn group_for_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, RouteError> {
        let conversations = self.stores.conversations.clone();
        let (conversation, is_member) = blocking(move || {
            let conversation = conversations.conversation(conversation_id)?;
            let is_member = conversations.is_member(conversation_id, user_id)?;
            Ok((conversation, is_member))
        })
        .await?;

        let group = conversation
            .filter(|c| c.kind == ConversationKind::Group)
            .ok_or(RouteError::UnknownConversation(conversation_id))?;
        if !is_member {
            return Err(RouteError::NotMember {
                conversation_id,
                user_id,
            });
        }
        Ok(group)
    }

    async fn save(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> Result<Message, RouteError> {
        let messages = self.stores.messages.clone();
        let message =
            blocking(move || messages.save_message(conversation_id, sender_id, &content)).await?;
        Ok(message)
    }
}

fn check_content(content: &str) -> Result<(), RouteError> {
    if content.trim().is_empty() {
        return Err(RouteError::Malformed("empty content".into()));
    }
    Ok(())
}

fn log_dropped(sender: &User, raw: &str, err: &RouteError) {
    match err {
        RouteError::Malformed(_) => warn!(
            "{} ({}) bad frame: {} -- raw: {}",
            sender.username,
            sender.id,
            err,
            truncate(raw, 200)
        ),
        RouteError::UnknownRecipient(_)
        | RouteError::UnknownConversation(_)
        | RouteError::NotMember { .. } => {
            debug!("{} ({}) frame discarded: {}", sender.username, sender.id, err)
        }
        RouteError::Recall(
            RecallError::NotFound(_) | RecallError::Forbidden(_) | RecallError::AlreadyRecalled(_),
        ) => info!("{} ({}) recall rejected: {}", sender.username, sender.id, err),
        _ => error!("{} ({}) frame failed: {}", sender.username, sender.id, err),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_db::Database;
    use parley_types::models::{MessageStatus, RECALL_PLACEHOLDER};
    use tokio::sync::mpsc::{self, error::TryRecvError};

    use super::*;
    use crate::registry::{Connection, RegistryConfig};

    struct Harness {
        db: Arc<Database>,
        router: MessageRouter,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let router = MessageRouter::new(
                ConnectionRegistry::new(RegistryConfig::default()),
                Stores::from_database(db.clone()),
            );
            Self { db, router }
        }

        fn user(&self, name: &str) -> User {
            let id = Uuid::new_v4();
            self.db.create_user(&id.to_string(), name, "hash").unwrap();
            self.router.stores().users.user_by_id(id).unwrap().unwrap()
        }

        fn connect(&self, user: &User) -> mpsc::Receiver<Payload> {
            let (conn, rx) = Connection::new(16);
            self.router.registry().register(user.id, conn);
            rx
        }

        fn group(&self, creator: &User, members: &[&User]) -> Conversation {
            let ids: Vec<Uuid> = members.iter().map(|u| u.id).collect();
            self.router
                .stores()
                .conversations
                .create_group("crew", creator.id, &ids)
                .unwrap()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            events.push(serde_json::from_str(payload.as_str()).unwrap());
        }
        events
    }

    fn chat(to: &str, content: &str) -> String {
        serde_json::json!({ "type": "chat", "to": to, "content": content }).to_string()
    }

    #[tokio::test]
    async fn direct_chat_reaches_recipient_and_echoes_to_sender() {
        let h = Harness::new();
        let alice = h.user("alice");
        let bob = h.user("bob");
        let mut alice_rx = h.connect(&alice);
        let mut bob_rx = h.connect(&bob);

        let routed = h.router.handle_frame(&alice, &chat("bob", "hi bob")).await;
        let Some(Routed::Sent { message, report }) = routed else {
            panic!("expected a sent message");
        };
        assert_eq!(report.queued, 2);

        for rx in [&mut alice_rx, &mut bob_rx] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::Chat {
                    message_id,
                    from,
                    from_username,
                    content,
                    to,
                    timestamp,
                    ..
                } => {
                    assert_eq!(*message_id, message.id);
                    assert_eq!(*timestamp, message.created_at.timestamp());
                    assert_eq!(*from, alice.id);
                    assert_eq!(from_username, "alice");
                    assert_eq!(content, "hi bob");
                    assert_eq!(to, "bob");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn offline_recipient_still_gets_a_stored_message() {
        let h = Harness::new();
        let alice = h.user("alice");
        h.user("bob");

        let (message, report) = h
            .router
            .send_direct(&alice, "bob", "later".into())
            .await
            .unwrap();
        assert_eq!(report.offline, 2);
        assert_eq!(report.queued, 0);

        let stored = h.router.stores().messages.message(message.id).unwrap();
        assert_eq!(stored, Some(message));
    }

    #[tokio::test]
    async fn unknown_recipient_and_malformed_frames_are_dropped() {
        let h = Harness::new();
        let alice = h.user("alice");
        let mut alice_rx = h.connect(&alice);

        assert!(h.router.handle_frame(&alice, &chat("nobody", "hello?")).await.is_none());
        assert!(h.router.handle_frame(&alice, &chat("alice", "me")).await.is_none());
        assert!(h.router.handle_frame(&alice, &chat("alice", "   ")).await.is_none());
        assert!(h.router.handle_frame(&alice, "{not json").await.is_none());
        assert!(h.router.handle_frame(&alice, r#"{"type":"typing"}"#).await.is_none());

        assert!(drain(&mut alice_rx).is_empty());
        assert!(
            h.router
                .stores()
                .conversations
                .conversations_for_user(alice.id)
                .unwrap()
                .is_empty()
        );
        // Connection untouched.
        assert!(h.router.registry().lookup(alice.id).is_some());
    }

    #[tokio::test]
    async fn synchronous_send_reports_unknown_recipient() {
        let h = Harness::new();
        let alice = h.user("alice");

        let err = h
            .router
            .send_direct(&alice, "ghost", "boo".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownRecipient(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn direct_conversation_keeps_alternating_history() {
        let h = Harness::new();
        let u1 = h.user("u1");
        let u2 = h.user("u2");

        let mut conversation_id = None;
        for i in 0..4 {
            let (from, to) = if i % 2 == 0 { (&u1, "u2") } else { (&u2, "u1") };
            let (message, _) = h
                .router
                .send_direct(from, to, format!("m{}", i))
                .await
                .unwrap();
            conversation_id.get_or_insert(message.conversation_id);
            assert_eq!(conversation_id, Some(message.conversation_id));
        }

        let history = h
            .router
            .stores()
            .messages
            .list_recent_messages(conversation_id.unwrap(), 50)
            .unwrap();
        assert_eq!(history.len(), 4);
        for (i, pair) in history.windows(2).enumerate() {
            assert!(pair[0].created_at <= pair[1].created_at);
            assert_ne!(pair[0].sender_id, pair[1].sender_id, "senders alternate at {}", i);
        }
        assert_eq!(history[0].sender_id, u1.id);
        assert_eq!(history[0].content, "m0");
        assert_eq!(history[3].content, "m3");
    }

    #[tokio::test]
    async fn group_message_fans_out_to_members_only() {
        let h = Harness::new();
        let u1 = h.user("u1");
        let u2 = h.user("u2");
        let u3 = h.user("u3");
        let outsider = h.user("outsider");

        let group = h.group(&u1, &[&u2, &u3]);
        // u1 and outsider also share a different conversation.
        h.router
            .stores()
            .conversations
            .get_or_create_single_conversation(u1.id, outsider.id)
            .unwrap();

        let mut rxs: Vec<_> = [&u1, &u2, &u3].iter().map(|u| h.connect(u)).collect();
        let mut outsider_rx = h.connect(&outsider);

        let frame = serde_json::json!({ "type": "group_message", "to": group.id, "content": "hi" });
        let routed = h.router.handle_frame(&u1, &frame.to_string()).await;
        let Some(Routed::Sent { report, .. }) = routed else {
            panic!("expected a sent message");
        };
        assert_eq!(report.queued, 3);

        for rx in rxs.iter_mut() {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::GroupMessage { from, content, group_name, .. } => {
                    assert_eq!(*from, u1.id);
                    assert_eq!(content, "hi");
                    assert_eq!(group_name.as_deref(), Some("crew"));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(drain(&mut outsider_rx).is_empty());
    }

    #[tokio::test]
    async fn non_member_cannot_post_to_group() {
        let h = Harness::new();
        let u1 = h.user("u1");
        let outsider = h.user("outsider");
        let group = h.group(&u1, &[]);
        let mut u1_rx = h.connect(&u1);

        let err = h
            .router
            .send_group(&outsider, group.id, "let me in".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NotMember { .. }));

        let err = h
            .router
            .send_group(&u1, Uuid::new_v4(), "anyone?".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownConversation(_)));

        assert!(drain(&mut u1_rx).is_empty());
        assert!(h.router.stores().messages.list_messages(group.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn recall_broadcasts_and_is_single_shot() {
        let h = Harness::new();
        let u1 = h.user("u1");
        let u2 = h.user("u2");
        let mut u1_rx = h.connect(&u1);
        let mut u2_rx = h.connect(&u2);

        let (message, _) = h.router.send_direct(&u1, "u2", "oops".into()).await.unwrap();
        drain(&mut u1_rx);
        drain(&mut u2_rx);

        // Only the sender may recall.
        let err = h.router.recall(u2.id, message.id).await.unwrap_err();
        assert!(matches!(err, RecallError::Forbidden(_)));

        let frame = serde_json::json!({ "type": "recall", "message_id": message.id });
        let routed = h.router.handle_frame(&u1, &frame.to_string()).await;
        let Some(Routed::Recalled { message: recalled, .. }) = routed else {
            panic!("expected a recall");
        };
        assert_eq!(recalled.status, MessageStatus::Recalled);
        assert_eq!(recalled.content, RECALL_PLACEHOLDER);

        let events = drain(&mut u2_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::MessageRecalled { message_id, content, sender_id, .. } => {
                assert_eq!(*message_id, message.id);
                assert_eq!(content, RECALL_PLACEHOLDER);
                assert_eq!(*sender_id, u1.id);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(drain(&mut u1_rx).len(), 1);

        let err = h.router.recall(u1.id, message.id).await.unwrap_err();
        assert!(matches!(err, RecallError::AlreadyRecalled(_)));
        assert_eq!(u2_rx.try_recv(), Err(TryRecvError::Empty));

        let history = h
            .router
            .stores()
            .messages
            .list_recent_messages(message.conversation_id, 10)
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Recalled);
        assert_eq!(history[0].content, RECALL_PLACEHOLDER);

        let err = h.router.recall(u1.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RecallError::NotFound(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 200), "hi");
    }
}
