//! Conversation state types

use super::event::{Content, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Per-state scratch data, keyed by string
pub type Payload = BTreeMap<String, Value>;

/// Well-known payload keys
pub mod keys {
    pub const TARGET_USER_ID: &str = "target_user_id";
    pub const MODE: &str = "mode";
    pub const PENDING_ACTION: &str = "pending_action";
}

// ============================================================================
// Conversation State
// ============================================================================

/// What a user is currently doing. Only the owner ever leaves `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// No multi-turn flow in progress
    #[default]
    Idle,

    /// Waiting for the body of a broadcast
    AwaitingBroadcastText,

    /// Waiting for a numeric id or `@handle` naming the recipient
    AwaitingTargetSelector,

    /// Recipient chosen, waiting for the message to send them
    AwaitingMessageToUser,

    /// Replying to a relayed message, waiting for the reply content
    AwaitingReplyToUser,

    /// A pending action is staged and needs confirm or cancel
    AwaitingSendConfirmation,
}

impl ConversationState {
    pub const ALL: [ConversationState; 6] = [
        ConversationState::Idle,
        ConversationState::AwaitingBroadcastText,
        ConversationState::AwaitingTargetSelector,
        ConversationState::AwaitingMessageToUser,
        ConversationState::AwaitingReplyToUser,
        ConversationState::AwaitingSendConfirmation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::AwaitingBroadcastText => "awaiting_broadcast_text",
            ConversationState::AwaitingTargetSelector => "awaiting_target_selector",
            ConversationState::AwaitingMessageToUser => "awaiting_message_to_user",
            ConversationState::AwaitingReplyToUser => "awaiting_reply_to_user",
            ConversationState::AwaitingSendConfirmation => "awaiting_send_confirmation",
        }
    }

    pub fn is_idle(self) -> bool {
        matches!(self, ConversationState::Idle)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pending Action
// ============================================================================

/// How the owner reached the current flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Reply,
    Direct,
    Broadcast,
}

/// Kind of staged send; only `Reply` gets the reply banner on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Message,
    Reply,
    Broadcast,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Message => "message",
            Label::Reply => "reply",
            Label::Broadcast => "broadcast",
        }
    }

    pub fn mode(self) -> Mode {
        match self {
            Label::Message => Mode::Direct,
            Label::Reply => Mode::Reply,
            Label::Broadcast => Mode::Broadcast,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A send staged while waiting for confirmation
///
/// `content` holds the platform's reference to the message (text body or
/// file id), so confirming forwards the original rather than a re-upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    pub content: Content,
    pub label: Label,
}

impl PendingAction {
    pub fn reply(target_user_id: UserId, content: Content) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            content,
            label: Label::Reply,
        }
    }

    pub fn direct(target_user_id: UserId, content: Content) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            content,
            label: Label::Message,
        }
    }

    pub fn broadcast(text: impl Into<String>) -> Self {
        Self {
            target_user_id: None,
            content: Content::text(text),
            label: Label::Broadcast,
        }
    }

    /// Payload patch that stages this action
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        if let Some(target) = self.target_user_id {
            payload.insert(keys::TARGET_USER_ID.to_string(), Value::from(target));
        }
        payload.insert(keys::MODE.to_string(), mode_value(self.label.mode()));
        payload.insert(
            keys::PENDING_ACTION.to_string(),
            serde_json::to_value(self).unwrap_or(Value::Null),
        );
        payload
    }

    pub fn from_payload(payload: &Payload) -> Option<Self> {
        payload
            .get(keys::PENDING_ACTION)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Payload patch that selects a recipient for the given flow
pub fn target_payload(target_user_id: UserId, mode: Mode) -> Payload {
    let mut payload = Payload::new();
    payload.insert(keys::TARGET_USER_ID.to_string(), Value::from(target_user_id));
    payload.insert(keys::MODE.to_string(), mode_value(mode));
    payload
}

pub fn mode_payload(mode: Mode) -> Payload {
    let mut payload = Payload::new();
    payload.insert(keys::MODE.to_string(), mode_value(mode));
    payload
}

fn mode_value(mode: Mode) -> Value {
    serde_json::to_value(mode).unwrap_or(Value::Null)
}

// ============================================================================
// State Record
// ============================================================================

/// A user's current state plus its payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateRecord {
    pub user_id: UserId,
    pub state: ConversationState,
    pub payload: Payload,
}

impl StateRecord {
    pub fn idle(user_id: UserId) -> Self {
        Self {
            user_id,
            state: ConversationState::Idle,
            payload: Payload::new(),
        }
    }

    pub fn new(user_id: UserId, state: ConversationState, payload: Payload) -> Self {
        Self {
            user_id,
            state,
            payload,
        }
    }

    pub fn target_user_id(&self) -> Option<UserId> {
        self.payload.get(keys::TARGET_USER_ID).and_then(Value::as_i64)
    }

    pub fn mode(&self) -> Option<Mode> {
        self.payload
            .get(keys::MODE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn pending_action(&self) -> Option<PendingAction> {
        PendingAction::from_payload(&self.payload)
    }
}
