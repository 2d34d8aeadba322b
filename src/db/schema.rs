//! Database schema and types

pub use crate::state_machine::UserId;
use crate::state_machine::event::describe_user;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    join_date TEXT NOT NULL,
    is_blocked INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_users_join_date ON users(join_date DESC);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    message TEXT NOT NULL,
    timestamp TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);
";

/// A user who has talked to the bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub join_date: DateTime<Utc>,
    pub is_blocked: bool,
}

impl UserRecord {
    /// One-line description: `ID 42 | @handle | First Last`
    pub fn describe(&self) -> String {
        describe_user(
            self.user_id,
            self.username.as_deref(),
            self.first_name.as_deref(),
            self.last_name.as_deref(),
        )
    }

    /// Short label for lists: `@handle`, else the first name, else the id
    pub fn display_name(&self) -> String {
        match (&self.username, &self.first_name) {
            (Some(handle), _) => format!("@{handle}"),
            (None, Some(first)) => first.clone(),
            (None, None) => self.user_id.to_string(),
        }
    }
}

/// Directory totals shown to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub total_users: u64,
    pub active_users: u64,
    pub blocked_users: u64,
    pub total_messages: u64,
}
