//! Pure state transition function for the owner's conversation
//!
//! Rules are tried in the order below; the first match wins:
//!
//! | # | state                         | input                  | outcome                                   |
//! |---|-------------------------------|------------------------|-------------------------------------------|
//! | 9 | any                           | Block / Unblock button | set block flag, state unchanged           |
//! | 8 | `Idle`                        | Reply button           | `AwaitingReplyToUser` with target preset  |
//! | - | any other                     | Reply button           | rejected, use cancel                      |
//! | - | any non-idle                  | `/cancel` or "cancel"  | `Idle`, payload cleared                   |
//! | 4 | `AwaitingSendConfirmation`    | confirm / cancel / *   | execute + `Idle` / `Idle` / re-prompt     |
//! | 5 | `AwaitingReplyToUser`, `AwaitingMessageToUser` | text or media | stage action, `AwaitingSendConfirmation` |
//! | 6 | `AwaitingTargetSelector`      | id or `@handle`        | resolve; found → `AwaitingMessageToUser`  |
//! | 7 | `AwaitingBroadcastText`       | text                   | stage broadcast, `AwaitingSendConfirmation` |
//! | 8 | `Idle`                        | menu directive         | enter the matching flow                   |
//! |10 | `Idle`                        | anything else          | neutral acknowledgment                    |

use super::effect::Keyboard;
use super::event::{is_cancel, ButtonAction, Command, Content, Directive, OwnerInput, TargetSelector};
use super::state::{mode_payload, target_payload, ConversationState, Label, Mode, Payload, PendingAction, StateRecord};
use super::Effect;
use thiserror::Error;

use ConversationState as S;

pub const OWNER_WELCOME: &str = "Welcome to the management panel.\n\nUse the menu: send, broadcast, users, blocked, stats.";
pub const NEUTRAL_ACK: &str = "Choose an action from the menu.";
pub const USE_CANCEL: &str = "Finish or cancel the current operation first (send \"cancel\").";
const SELECTOR_PROMPT: &str = "Enter the user ID or username.\n\nExample: 123456789 or @username";
const SELECTOR_INVALID: &str = "Invalid format! Enter a numeric ID or a username starting with @.\n\nExample: 123456789 or @username";
const BROADCAST_PROMPT: &str = "Enter your broadcast message:";
const BROADCAST_TEXT_ONLY: &str = "Broadcasts must be text. Enter your broadcast message or cancel.";
const CONFIRM_REPROMPT: &str = "Please answer \"confirm\" to send or \"cancel\" to discard.";
const LOST_PENDING: &str = "Nothing is staged to send any more. Start again from the menu.";
const LOST_TARGET: &str = "The recipient was lost. Start again from the menu.";

/// Result of a state transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    /// Keys merged into the payload; ignored when `new_state` is `Idle`
    pub patch: Payload,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConversationState) -> Self {
        Self {
            new_state: state,
            patch: Payload::new(),
            effects: vec![],
        }
    }

    pub fn with_patch(mut self, patch: Payload) -> Self {
        self.patch.extend(patch);
        self
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition: {from} -> {to}")]
    StateViolation {
        from: ConversationState,
        to: ConversationState,
    },
    #[error("Unexpected input while {0}")]
    UnexpectedInput(ConversationState),
}

/// States reachable from `from` in one step
pub fn legal_targets(from: ConversationState) -> &'static [ConversationState] {
    match from {
        S::Idle => &[
            S::AwaitingBroadcastText,
            S::AwaitingTargetSelector,
            S::AwaitingReplyToUser,
        ],
        S::AwaitingBroadcastText | S::AwaitingMessageToUser | S::AwaitingReplyToUser => {
            &[S::Idle, S::AwaitingSendConfirmation]
        }
        S::AwaitingTargetSelector => &[S::Idle, S::AwaitingMessageToUser],
        S::AwaitingSendConfirmation => &[S::Idle],
    }
}

pub fn can_transition(from: ConversationState, to: ConversationState) -> bool {
    legal_targets(from).contains(&to)
}

/// Pure transition function
///
/// Given the same record and input it always yields the same result. A
/// result that would move along an edge missing from the legal graph is
/// returned as `StateViolation` instead.
pub fn transition(
    record: &StateRecord,
    input: OwnerInput,
) -> Result<TransitionResult, TransitionError> {
    let result = decide(record, input)?;
    if result.new_state != record.state && !can_transition(record.state, result.new_state) {
        return Err(TransitionError::StateViolation {
            from: record.state,
            to: result.new_state,
        });
    }
    Ok(result)
}

fn decide(record: &StateRecord, input: OwnerInput) -> Result<TransitionResult, TransitionError> {
    let state = record.state;
    match (state, input) {
        // Block/unblock never moves the conversation
        (_, OwnerInput::Button(ButtonAction::Block(user_id))) => {
            Ok(stay(state).with_effect(Effect::SetBlocked { user_id, blocked: true }))
        }
        (_, OwnerInput::Button(ButtonAction::Unblock(user_id))) => {
            Ok(stay(state).with_effect(Effect::SetBlocked { user_id, blocked: false }))
        }

        (S::Idle, OwnerInput::Button(ButtonAction::Reply(user_id))) => {
            Ok(TransitionResult::new(S::AwaitingReplyToUser)
                .with_patch(target_payload(user_id, Mode::Reply))
                .with_effect(Effect::DescribeTarget {
                    user_id,
                    label: Label::Reply,
                }))
        }
        (_, OwnerInput::Button(ButtonAction::Reply(_))) => Err(TransitionError::StateViolation {
            from: state,
            to: S::AwaitingReplyToUser,
        }),
        (_, OwnerInput::Button(ButtonAction::CheckMembership)) => {
            Ok(stay(state).with_effect(Effect::reply("The owner does not need a membership check.")))
        }

        // Commands
        (_, OwnerInput::Command(Command::Start)) => {
            Ok(stay(state).with_effect(Effect::reply_with(OWNER_WELCOME, Keyboard::Menu)))
        }
        (S::Idle, OwnerInput::Command(Command::Cancel)) => {
            Ok(stay(state).with_effect(Effect::reply_with("Nothing to cancel.", Keyboard::Menu)))
        }
        (_, OwnerInput::Command(Command::Cancel)) => Ok(cancelled(state)),
        (_, OwnerInput::Command(Command::Other(name))) => {
            Ok(stay(state).with_effect(Effect::reply(format!("Unknown command /{name}."))))
        }

        // Confirmation
        (S::AwaitingSendConfirmation, OwnerInput::Text(text)) => match Directive::parse(&text) {
            Some(Directive::Confirm) => Ok(confirm(record)),
            Some(Directive::Cancel) => Ok(cancelled(state)),
            _ => Ok(reprompt_confirmation()),
        },
        (S::AwaitingSendConfirmation, OwnerInput::Media(_)) => Ok(reprompt_confirmation()),

        // Composing a reply or direct message
        (S::AwaitingReplyToUser | S::AwaitingMessageToUser, OwnerInput::Text(text))
            if is_cancel(&text) =>
        {
            Ok(cancelled(state))
        }
        (S::AwaitingReplyToUser | S::AwaitingMessageToUser, OwnerInput::Text(text)) => {
            Ok(stage(record, Content::text(text)))
        }
        (S::AwaitingReplyToUser | S::AwaitingMessageToUser, OwnerInput::Media(media)) => {
            Ok(stage(record, Content::Media(media)))
        }

        // Choosing a recipient
        (S::AwaitingTargetSelector, OwnerInput::Text(text)) if is_cancel(&text) => {
            Ok(cancelled(state))
        }
        (S::AwaitingTargetSelector, OwnerInput::Text(text)) => match TargetSelector::parse(&text) {
            Some(selector) => Ok(stay(state).with_effect(Effect::ResolveTarget { selector })),
            None => Ok(stay(state).with_effect(Effect::reply_with(SELECTOR_INVALID, Keyboard::Cancel))),
        },
        (S::AwaitingTargetSelector, OwnerInput::Media(_)) => {
            Ok(stay(state).with_effect(Effect::reply_with(SELECTOR_PROMPT, Keyboard::Cancel)))
        }
        (S::AwaitingTargetSelector, OwnerInput::TargetResolved { user_id }) => {
            Ok(TransitionResult::new(S::AwaitingMessageToUser)
                .with_patch(target_payload(user_id, Mode::Direct))
                .with_effect(Effect::DescribeTarget {
                    user_id,
                    label: Label::Message,
                }))
        }
        (S::AwaitingTargetSelector, OwnerInput::TargetNotFound { selector }) => {
            Ok(stay(state).with_effect(Effect::reply_with(
                format!("User {selector} not found. Enter a valid ID or username."),
                Keyboard::Cancel,
            )))
        }

        // Broadcast body
        (S::AwaitingBroadcastText, OwnerInput::Text(text)) if is_cancel(&text) => {
            Ok(cancelled(state))
        }
        (S::AwaitingBroadcastText, OwnerInput::Text(text)) => {
            let action = PendingAction::broadcast(text);
            Ok(TransitionResult::new(S::AwaitingSendConfirmation)
                .with_patch(action.to_payload())
                .with_effect(Effect::AskConfirmation { action }))
        }
        (S::AwaitingBroadcastText, OwnerInput::Media(_)) => {
            Ok(stay(state).with_effect(Effect::reply_with(BROADCAST_TEXT_ONLY, Keyboard::Cancel)))
        }

        // Menu
        (S::Idle, OwnerInput::Text(text)) => Ok(match Directive::parse(&text) {
            Some(Directive::SendToUser) => TransitionResult::new(S::AwaitingTargetSelector)
                .with_patch(mode_payload(Mode::Direct))
                .with_effect(Effect::reply_with(SELECTOR_PROMPT, Keyboard::Cancel)),
            Some(Directive::Broadcast) => TransitionResult::new(S::AwaitingBroadcastText)
                .with_patch(mode_payload(Mode::Broadcast))
                .with_effect(Effect::reply_with(BROADCAST_PROMPT, Keyboard::Cancel)),
            Some(Directive::UserList) => stay(state).with_effect(Effect::ShowUsers),
            Some(Directive::BlockedList) => stay(state).with_effect(Effect::ShowBlocked),
            Some(Directive::Stats) => stay(state).with_effect(Effect::ShowStats),
            Some(Directive::Confirm | Directive::Cancel) | None => neutral(),
        }),
        (S::Idle, OwnerInput::Media(_)) => Ok(neutral()),

        (
            _,
            OwnerInput::TargetResolved { .. } | OwnerInput::TargetNotFound { .. },
        ) => Err(TransitionError::UnexpectedInput(state)),
    }
}

fn stay(state: ConversationState) -> TransitionResult {
    TransitionResult::new(state)
}

fn neutral() -> TransitionResult {
    TransitionResult::new(S::Idle).with_effect(Effect::reply_with(NEUTRAL_ACK, Keyboard::Menu))
}

fn reprompt_confirmation() -> TransitionResult {
    stay(S::AwaitingSendConfirmation).with_effect(Effect::reply_with(CONFIRM_REPROMPT, Keyboard::Confirm))
}

fn cancelled(state: ConversationState) -> TransitionResult {
    let text = match state {
        S::AwaitingReplyToUser => "Reply cancelled.",
        S::AwaitingMessageToUser | S::AwaitingSendConfirmation => "Send cancelled.",
        S::AwaitingBroadcastText => "Broadcast cancelled.",
        S::AwaitingTargetSelector | S::Idle => "Operation cancelled.",
    };
    TransitionResult::new(S::Idle).with_effect(Effect::reply_with(text, Keyboard::Menu))
}

fn stage(record: &StateRecord, content: Content) -> TransitionResult {
    let Some(target) = record.target_user_id() else {
        return TransitionResult::new(S::Idle).with_effect(Effect::reply_with(LOST_TARGET, Keyboard::Menu));
    };
    let action = if record.state == S::AwaitingReplyToUser {
        PendingAction::reply(target, content)
    } else {
        PendingAction::direct(target, content)
    };
    TransitionResult::new(S::AwaitingSendConfirmation)
        .with_patch(action.to_payload())
        .with_effect(Effect::AskConfirmation { action })
}

fn confirm(record: &StateRecord) -> TransitionResult {
    let lost = || TransitionResult::new(S::Idle).with_effect(Effect::reply_with(LOST_PENDING, Keyboard::Menu));
    let Some(action) = record.pending_action() else {
        return lost();
    };
    match (action.label, &action.content) {
        // The tally is reported by the runtime once the sweep is done
        (Label::Broadcast, Content::Text { text }) => {
            TransitionResult::new(S::Idle).with_effect(Effect::Broadcast { text: text.clone() })
        }
        (Label::Broadcast, Content::Media(_)) => lost(),
        (label, _) if action.target_user_id.is_some() => TransitionResult::new(S::Idle)
            .with_effect(Effect::Deliver { action })
            .with_effect(Effect::reply_with(
                format!("Your {label} was sent successfully!"),
                Keyboard::Menu,
            )),
        _ => lost(),
    }
}
