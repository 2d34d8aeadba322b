//! Effects produced by state transitions

use super::event::{TargetSelector, UserId};
use super::state::{Label, PendingAction};

/// Reply keyboard shown with a message to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Keyboard {
    #[default]
    None,
    Menu,
    Cancel,
    Confirm,
}

/// Effects to be executed before the new state is committed
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a text back to whoever triggered the step
    Reply { text: String, keyboard: Keyboard },

    /// Look the selector up in the user directory; feeds back
    /// `TargetResolved` or `TargetNotFound`
    ResolveTarget { selector: TargetSelector },

    /// Tell the owner who they are about to write to
    DescribeTarget { user_id: UserId, label: Label },

    /// Show the staged action and ask for confirm/cancel
    AskConfirmation { action: PendingAction },

    /// Deliver a staged single-recipient action
    Deliver { action: PendingAction },

    /// Fan out a text to every eligible user and report the tally
    Broadcast { text: String },

    SetBlocked { user_id: UserId, blocked: bool },

    ShowUsers,
    ShowBlocked,
    ShowStats,
}

impl Effect {
    pub fn reply(text: impl Into<String>) -> Self {
        Effect::Reply {
            text: text.into(),
            keyboard: Keyboard::None,
        }
    }

    pub fn reply_with(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Effect::Reply {
            text: text.into(),
            keyboard,
        }
    }

    /// Notifications only inform the owner; if they fail the step still
    /// commits. Any other failing effect aborts the step.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            Effect::Reply { .. } | Effect::DescribeTarget { .. } | Effect::AskConfirmation { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Effect::Reply { .. } => "reply",
            Effect::ResolveTarget { .. } => "resolve_target",
            Effect::DescribeTarget { .. } => "describe_target",
            Effect::AskConfirmation { .. } => "ask_confirmation",
            Effect::Deliver { .. } => "deliver",
            Effect::Broadcast { .. } => "broadcast",
            Effect::SetBlocked { .. } => "set_blocked",
            Effect::ShowUsers => "show_users",
            Effect::ShowBlocked => "show_blocked",
            Effect::ShowStats => "show_stats",
        }
    }
}
