/// Database row types. These map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent;
/// the `into_*` conversions validate ids, enums and timestamps on the way out.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{Conversation, ConversationMember, Message, User};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub created_at: String,
}

pub struct MemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id)?,
            username: self.username,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl ConversationRow {
    pub fn into_conversation(self) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_id(&self.id)?,
            kind: self
                .kind
                .parse()
                .with_context(|| format!("conversation {}", self.id))?,
            name: self.name,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl MemberRow {
    pub fn into_member(self) -> Result<ConversationMember> {
        Ok(ConversationMember {
            conversation_id: parse_id(&self.conversation_id)?,
            user_id: parse_id(&self.user_id)?,
            joined_at: parse_timestamp(&self.joined_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            status: self
                .status
                .parse()
                .with_context(|| format!("message {}", self.id))?,
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Current time in the format every timestamp column uses.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}
