use crate::models::{now_timestamp, ConversationRow, MemberRow, MessageRow, UserRow};
use crate::Database;
use anyhow::{Result, bail};
use rusqlite::{Connection, Row, TransactionBehavior};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, status, created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, now_timestamp()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Conversations --

    /// Returns the single conversation between `user_a` and `user_b`, creating it
    /// (plus both membership rows) in one transaction if it does not exist yet.
    /// Argument order does not matter.
    pub fn get_or_create_single_conversation(
        &self,
        new_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<ConversationRow> {
        if user_a == user_b {
            bail!("a single conversation needs two distinct members");
        }
        let pair_key = pair_key(user_a, user_b);

        self.with_conn_mut(|conn| {
            // IMMEDIATE takes the write lock up front so the lookup and the insert
            // cannot interleave with another writer on the same file.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = tx
                .query_row(
                    "SELECT id, kind, name, created_at FROM conversations WHERE pair_key = ?1",
                    [&pair_key],
                    conversation_from_row,
                )
                .optional()?
            {
                return Ok(existing);
            }

            let now = now_timestamp();
            tx.execute(
                "INSERT INTO conversations (id, kind, name, pair_key, created_at) VALUES (?1, 'single', NULL, ?2, ?3)",
                (new_id, &pair_key, &now),
            )?;
            for user_id in [user_a, user_b] {
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    (new_id, user_id, &now),
                )?;
            }
            tx.commit()?;

            Ok(ConversationRow {
                id: new_id.to_string(),
                kind: "single".to_string(),
                name: None,
                created_at: now,
            })
        })
    }

    /// Creates a group conversation. The creator is always a member; duplicate
    /// member ids collapse to one row.
    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        member_ids: &[String],
    ) -> Result<ConversationRow> {
        let name = name.trim();
        if name.is_empty() {
            bail!("a group needs a name");
        }

        let mut members: Vec<&str> = vec![creator_id];
        for m in member_ids {
            if !members.contains(&m.as_str()) {
                members.push(m);
            }
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_timestamp();
            tx.execute(
                "INSERT INTO conversations (id, kind, name, pair_key, created_at) VALUES (?1, 'group', ?2, NULL, ?3)",
                (id, name, &now),
            )?;
            for user_id in &members {
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    (id, user_id, &now),
                )?;
            }
            tx.commit()?;

            Ok(ConversationRow {
                id: id.to_string(),
                kind: "group".to_string(),
                name: Some(name.to_string()),
                created_at: now,
            })
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, kind, name, created_at FROM conversations WHERE id = ?1",
                    [id],
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Members in join order. A plain read, not held against later membership changes.
    pub fn get_members(&self, conversation_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, joined_at FROM conversation_members
                 WHERE conversation_id = ?1
                 ORDER BY joined_at, rowid",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(MemberRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        joined_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.name, c.created_at
                 FROM conversations c
                 JOIN conversation_members m ON m.conversation_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.created_at, c.rowid",
            )?;
            let rows = stmt
                .query_map([user_id], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'sent', ?5)",
                (id, conversation_id, sender_id, content, &now),
            )?;
            Ok(MessageRow {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                content: content.to_string(),
                status: "sent".to_string(),
                created_at: now,
            })
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    [id],
                    message_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Replaces content and flips status to 'recalled' in one statement, only if
    /// the message is still 'sent'. Returns whether a row changed.
    pub fn mark_message_recalled(&self, id: &str, placeholder: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?1, status = 'recalled' WHERE id = ?2 AND status = 'sent'",
                (placeholder, id),
            )?;
            Ok(changed == 1)
        })
    }

    /// Conversation history from the start, oldest first, at most `limit` rows.
    pub fn get_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The newest `limit` messages, returned oldest first.
    pub fn get_recent_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let mut rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }
}

fn pair_key(user_a: &str, user_b: &str) -> String {
    if user_a < user_b {
        format!("{}:{}", user_a, user_b)
    } else {
        format!("{}:{}", user_b, user_a)
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
