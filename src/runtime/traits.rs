//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the coordinator with mock implementations.

use super::error::DirectoryError;
use crate::db::{DirectoryStats, UserRecord};
use crate::state_machine::{ButtonAction, MediaRef, Sender, UserId};
use crate::telegram::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

/// Delivery options attached to an outbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Inline buttons on the message itself
    pub actions: Vec<ButtonAction>,
    /// One-tap replies offered in place of the keyboard
    pub quick_replies: Vec<String>,
}

impl SendOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn actions(actions: Vec<ButtonAction>) -> Self {
        Self {
            actions,
            quick_replies: vec![],
        }
    }

    pub fn quick_replies(labels: &[&str]) -> Self {
        Self {
            actions: vec![],
            quick_replies: labels.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// A user's standing in a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl ChatMemberStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "creator" => Self::Creator,
            "administrator" => Self::Administrator,
            "member" => Self::Member,
            "restricted" => Self::Restricted,
            "kicked" => Self::Kicked,
            _ => Self::Left,
        }
    }

    pub fn is_member(self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

/// Persistent store of users and their block status
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Record the sender's profile; the block flag is left as is
    async fn upsert(&self, sender: &Sender) -> Result<(), DirectoryError>;

    async fn get(&self, user_id: UserId) -> Result<Option<UserRecord>, DirectoryError>;

    async fn find_by_handle(&self, handle: &str) -> Result<Option<UserId>, DirectoryError>;

    /// Idempotent; returns whether the user is known
    async fn set_blocked(&self, user_id: UserId, blocked: bool) -> Result<bool, DirectoryError>;

    async fn is_blocked(&self, user_id: UserId) -> Result<bool, DirectoryError>;

    /// All users, newest first
    async fn list_all(&self, excluding: Option<UserId>) -> Result<Vec<UserRecord>, DirectoryError>;

    async fn list_blocked(&self, excluding: Option<UserId>)
        -> Result<Vec<UserRecord>, DirectoryError>;

    /// Everyone a broadcast should reach
    async fn active_user_ids(&self, excluding: Option<UserId>)
        -> Result<Vec<UserId>, DirectoryError>;

    async fn count_active(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError>;

    async fn count_blocked(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError>;

    async fn save_message(&self, user_id: UserId, text: &str) -> Result<(), DirectoryError>;

    async fn stats(&self, excluding: Option<UserId>) -> Result<DirectoryStats, DirectoryError>;
}

/// Verifies channel membership before a user may relay
#[async_trait]
pub trait MembershipGate: Send + Sync {
    /// Lookup failures count as not a member
    async fn is_member(&self, user_id: UserId) -> bool;

    /// Channel users are asked to join, if any
    fn channel(&self) -> Option<&str> {
        None
    }
}

/// Outbound side of the chat platform
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(
        &self,
        dest: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError>;

    /// Send hosted media by reference; `caption` replaces the media's own
    async fn send_media(
        &self,
        dest: UserId,
        media: &MediaRef,
        caption: Option<&str>,
        options: &SendOptions,
    ) -> Result<(), TransportError>;

    async fn get_chat_member_status(
        &self,
        channel: &str,
        user_id: UserId,
    ) -> Result<ChatMemberStatus, TransportError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: UserDirectory + ?Sized> UserDirectory for Arc<T> {
    async fn upsert(&self, sender: &Sender) -> Result<(), DirectoryError> {
        (**self).upsert(sender).await
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserRecord>, DirectoryError> {
        (**self).get(user_id).await
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<UserId>, DirectoryError> {
        (**self).find_by_handle(handle).await
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool) -> Result<bool, DirectoryError> {
        (**self).set_blocked(user_id, blocked).await
    }

    async fn is_blocked(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        (**self).is_blocked(user_id).await
    }

    async fn list_all(&self, excluding: Option<UserId>) -> Result<Vec<UserRecord>, DirectoryError> {
        (**self).list_all(excluding).await
    }

    async fn list_blocked(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserRecord>, DirectoryError> {
        (**self).list_blocked(excluding).await
    }

    async fn active_user_ids(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserId>, DirectoryError> {
        (**self).active_user_ids(excluding).await
    }

    async fn count_active(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        (**self).count_active(excluding).await
    }

    async fn count_blocked(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        (**self).count_blocked(excluding).await
    }

    async fn save_message(&self, user_id: UserId, text: &str) -> Result<(), DirectoryError> {
        (**self).save_message(user_id, text).await
    }

    async fn stats(&self, excluding: Option<UserId>) -> Result<DirectoryStats, DirectoryError> {
        (**self).stats(excluding).await
    }
}

#[async_trait]
impl<T: MembershipGate + ?Sized> MembershipGate for Arc<T> {
    async fn is_member(&self, user_id: UserId) -> bool {
        (**self).is_member(user_id).await
    }

    fn channel(&self) -> Option<&str> {
        (**self).channel()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_text(
        &self,
        dest: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        (**self).send_text(dest, text, options).await
    }

    async fn send_media(
        &self,
        dest: UserId,
        media: &MediaRef,
        caption: Option<&str>,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        (**self).send_media(dest, media, caption, options).await
    }

    async fn get_chat_member_status(
        &self,
        channel: &str,
        user_id: UserId,
    ) -> Result<ChatMemberStatus, TransportError> {
        (**self).get_chat_member_status(channel, user_id).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use crate::db::Database;

/// Adapter to use Database as a `UserDirectory`
#[derive(Clone)]
pub struct DatabaseDirectory {
    db: Database,
}

impl DatabaseDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for DatabaseDirectory {
    async fn upsert(&self, sender: &Sender) -> Result<(), DirectoryError> {
        self.db
            .upsert_user(
                sender.id,
                sender.handle.as_deref(),
                sender.first_name.as_deref(),
                sender.last_name.as_deref(),
            )
            .map_err(Into::into)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserRecord>, DirectoryError> {
        match self.db.get_user(user_id) {
            Ok(user) => Ok(Some(user)),
            Err(crate::db::DbError::UserNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<UserId>, DirectoryError> {
        self.db.find_user_by_username(handle).map_err(Into::into)
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool) -> Result<bool, DirectoryError> {
        self.db.set_blocked(user_id, blocked).map_err(Into::into)
    }

    async fn is_blocked(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        self.db.is_blocked(user_id).map_err(Into::into)
    }

    async fn list_all(&self, excluding: Option<UserId>) -> Result<Vec<UserRecord>, DirectoryError> {
        self.db.list_users(excluding).map_err(Into::into)
    }

    async fn list_blocked(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserRecord>, DirectoryError> {
        self.db.list_blocked(excluding).map_err(Into::into)
    }

    async fn active_user_ids(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserId>, DirectoryError> {
        self.db.active_user_ids(excluding).map_err(Into::into)
    }

    async fn count_active(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        self.db.count_active(excluding).map_err(Into::into)
    }

    async fn count_blocked(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        self.db.count_blocked(excluding).map_err(Into::into)
    }

    async fn save_message(&self, user_id: UserId, text: &str) -> Result<(), DirectoryError> {
        self.db.save_message(user_id, text).map_err(Into::into)
    }

    async fn stats(&self, excluding: Option<UserId>) -> Result<DirectoryStats, DirectoryError> {
        self.db.stats(excluding).map_err(Into::into)
    }
}

/// Admits members of one channel, checked through the transport
pub struct ChannelGate<T> {
    transport: T,
    channel: String,
}

impl<T: Transport> ChannelGate<T> {
    pub fn new(transport: T, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl<T: Transport> MembershipGate for ChannelGate<T> {
    async fn is_member(&self, user_id: UserId) -> bool {
        match self.transport.get_chat_member_status(&self.channel, user_id).await {
            Ok(status) => {
                tracing::debug!(user_id, channel = %self.channel, ?status, "Checked membership");
                status.is_member()
            }
            Err(e) => {
                tracing::warn!(user_id, channel = %self.channel, error = %e, "Membership check failed");
                false
            }
        }
    }

    fn channel(&self) -> Option<&str> {
        Some(&self.channel)
    }
}

/// Admits everyone; used when no channel is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

#[async_trait]
impl MembershipGate for OpenGate {
    async fn is_member(&self, _user_id: UserId) -> bool {
        true
    }
}
