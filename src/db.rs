//! Database module for the relay bot
//!
//! Provides persistence for users and the text messages they relay.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("User not found: {0}")]
    UserNotFound(UserId),
}

pub type DbResult<T> = Result<T, DbError>;

const USER_COLUMNS: &str = "user_id, username, first_name, last_name, join_date, is_blocked";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// A panicked writer cannot leave SQLite half-written, so a poisoned
    /// lock is still safe to reuse.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== User Operations ====================

    /// Insert or refresh a user's profile
    ///
    /// The block flag and join date of an existing user are kept.
    pub fn upsert_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> DbResult<()> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO users (user_id, username, first_name, last_name, join_date, is_blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name",
            params![user_id, username, first_name, last_name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: UserId) -> DbResult<UserRecord> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"))?;
        stmt.query_row(params![user_id], user_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::UserNotFound(user_id),
                other => DbError::Sqlite(other),
            })
    }

    /// Look a user up by handle, ignoring case and a leading `@`
    pub fn find_user_by_username(&self, username: &str) -> DbResult<Option<UserId>> {
        let username = username.strip_prefix('@').unwrap_or(username);
        let id = self
            .conn()
            .query_row(
                "SELECT user_id FROM users WHERE username = ?1 COLLATE NOCASE
                 ORDER BY join_date DESC LIMIT 1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Set the block flag; returns whether the user exists
    pub fn set_blocked(&self, user_id: UserId, blocked: bool) -> DbResult<bool> {
        let changed = self.conn().execute(
            "UPDATE users SET is_blocked = ?2 WHERE user_id = ?1",
            params![user_id, blocked],
        )?;
        Ok(changed > 0)
    }

    /// Unknown users are not blocked
    pub fn is_blocked(&self, user_id: UserId) -> DbResult<bool> {
        let blocked: Option<bool> = self
            .conn()
            .query_row(
                "SELECT is_blocked FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blocked.unwrap_or(false))
    }

    /// All users, newest first
    pub fn list_users(&self, excluding: Option<UserId>) -> DbResult<Vec<UserRecord>> {
        self.query_users("1 = 1", excluding)
    }

    /// Blocked users, newest first
    pub fn list_blocked(&self, excluding: Option<UserId>) -> DbResult<Vec<UserRecord>> {
        self.query_users("is_blocked = 1", excluding)
    }

    /// Ids of everyone who is not blocked
    pub fn active_user_ids(&self, excluding: Option<UserId>) -> DbResult<Vec<UserId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM users
             WHERE is_blocked = 0 AND (?1 IS NULL OR user_id != ?1)
             ORDER BY join_date DESC",
        )?;
        let ids = stmt
            .query_map(params![excluding], |row| row.get(0))?
            .collect::<Result<Vec<UserId>, _>>()?;
        Ok(ids)
    }

    pub fn count_active(&self, excluding: Option<UserId>) -> DbResult<u64> {
        self.count("SELECT COUNT(*) FROM users WHERE is_blocked = 0 AND (?1 IS NULL OR user_id != ?1)", excluding)
    }

    pub fn count_blocked(&self, excluding: Option<UserId>) -> DbResult<u64> {
        self.count("SELECT COUNT(*) FROM users WHERE is_blocked = 1 AND (?1 IS NULL OR user_id != ?1)", excluding)
    }

    // ==================== Message Operations ====================

    pub fn save_message(&self, user_id: UserId, text: &str) -> DbResult<()> {
        self.conn().execute(
            "INSERT INTO messages (user_id, message, timestamp) VALUES (?1, ?2, ?3)",
            params![user_id, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_messages(&self, excluding: Option<UserId>) -> DbResult<u64> {
        self.count("SELECT COUNT(*) FROM messages WHERE ?1 IS NULL OR user_id != ?1", excluding)
    }

    /// Totals for the owner's statistics view
    pub fn stats(&self, excluding: Option<UserId>) -> DbResult<DirectoryStats> {
        let active_users = self.count_active(excluding)?;
        let blocked_users = self.count_blocked(excluding)?;
        Ok(DirectoryStats {
            total_users: active_users + blocked_users,
            active_users,
            blocked_users,
            total_messages: self.count_messages(excluding)?,
        })
    }

    // ==================== Helpers ====================

    fn query_users(&self, filter: &str, excluding: Option<UserId>) -> DbResult<Vec<UserRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE {filter} AND (?1 IS NULL OR user_id != ?1)
             ORDER BY join_date DESC"
        ))?;
        let users = stmt
            .query_map(params![excluding], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn count(&self, sql: &str, excluding: Option<UserId>) -> DbResult<u64> {
        let count: i64 = self.conn().query_row(sql, params![excluding], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        join_date: parse_datetime(&row.get::<_, String>(4)?),
        is_blocked: row.get(5)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
