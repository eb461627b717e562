//! Persistence contracts the router and recall flow depend on, plus their
//! SQLite-backed implementations on [`parley_db::Database`].
//!
//! The traits are synchronous; async callers go through [`blocking`] so the
//! runtime threads never wait on the database mutex.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::{Conversation, ConversationMember, Message, User};

/// Resolves users by id or username.
pub trait UserDirectory: Send + Sync {
    fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    fn user_by_username(&self, username: &str) -> Result<Option<User>>;
}

pub trait ConversationStore: Send + Sync {
    /// Idempotent and order-independent. Creates the conversation and exactly
    /// two membership rows atomically when none exists.
    fn get_or_create_single_conversation(&self, user_a: Uuid, user_b: Uuid) -> Result<Conversation>;

    /// Creates a named group; the creator is always a member.
    fn create_group(&self, name: &str, creator: Uuid, members: &[Uuid]) -> Result<Conversation>;

    fn conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    /// Snapshot of the current members.
    fn members(&self, conversation_id: Uuid) -> Result<Vec<ConversationMember>>;

    fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>>;
}

pub trait MessageStore: Send + Sync {
    /// Persists a new `sent` message and returns it with its generated id and
    /// server timestamp.
    fn save_message(&self, conversation_id: Uuid, sender_id: Uuid, content: &str) -> Result<Message>;

    fn message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Sets content to `placeholder` and status to `recalled` together, only if
    /// the message is still `sent`. Returns whether the transition happened.
    fn mark_recalled(&self, id: Uuid, placeholder: &str) -> Result<bool>;

    /// History from the start of the conversation, ascending, at most `limit`.
    fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>>;

    /// The newest `limit` messages, ascending.
    fn list_recent_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>>;
}

/// The collaborator set handed to the router and the REST handlers.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserDirectory>,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
}

impl Stores {
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            users: db.clone(),
            conversations: db.clone(),
            messages: db,
        }
    }
}

/// Run a blocking store call on the blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking store task failed: {}", e))?
}

impl UserDirectory for Database {
    fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.get_user_by_id(&id.to_string())?
            .map(|row| row.into_user())
            .transpose()
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.get_user_by_username(username)?
            .map(|row| row.into_user())
            .transpose()
    }
}

impl ConversationStore for Database {
    fn get_or_create_single_conversation(&self, user_a: Uuid, user_b: Uuid) -> Result<Conversation> {
        self.get_or_create_single_conversation(
            &Uuid::new_v4().to_string(),
            &user_a.to_string(),
            &user_b.to_string(),
        )?
        .into_conversation()
    }

    fn create_group(&self, name: &str, creator: Uuid, members: &[Uuid]) -> Result<Conversation> {
        let members: Vec<String> = members.iter().map(Uuid::to_string).collect();
        self.create_group(
            &Uuid::new_v4().to_string(),
            name,
            &creator.to_string(),
            &members,
        )?
        .into_conversation()
    }

    fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.get_conversation(&id.to_string())?
            .map(|row| row.into_conversation())
            .transpose()
    }

    fn members(&self, conversation_id: Uuid) -> Result<Vec<ConversationMember>> {
        self.get_members(&conversation_id.to_string())?
            .into_iter()
            .map(|row| row.into_member())
            .collect()
    }

    fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        Database::is_member(self, &conversation_id.to_string(), &user_id.to_string())
    }

    fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.get_conversations_for_user(&user_id.to_string())?
            .into_iter()
            .map(|row| row.into_conversation())
            .collect()
    }
}

impl MessageStore for Database {
    fn save_message(&self, conversation_id: Uuid, sender_id: Uuid, content: &str) -> Result<Message> {
        self.insert_message(
            &Uuid::new_v4().to_string(),
            &conversation_id.to_string(),
            &sender_id.to_string(),
            content,
        )?
        .into_message()
    }

    fn message(&self, id: Uuid) -> Result<Option<Message>> {
        self.get_message(&id.to_string())?
            .map(|row| row.into_message())
            .transpose()
    }

    fn mark_recalled(&self, id: Uuid, placeholder: &str) -> Result<bool> {
        self.mark_message_recalled(&id.to_string(), placeholder)
    }

    fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.get_messages(&conversation_id.to_string(), limit)?
            .into_iter()
            .map(|row| row.into_message())
            .collect()
    }

    fn list_recent_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.get_recent_messages(&conversation_id.to_string(), limit)?
            .into_iter()
            .map(|row| row.into_message())
            .collect()
    }
}
