//! Relay coordinator
//!
//! Decides what every inbound event means and carries it out. Non-owner
//! events never touch the state store; owner events run through the pure
//! state machine under the owner's lock.

use super::error::RelayError;
use super::store::{Expired, ExpiryReason, StateStore};
use super::traits::{MembershipGate, SendOptions, Transport, UserDirectory};

use crate::db::UserRecord;
use crate::state_machine::event::{describe_user, Directive};
use crate::state_machine::{
    transition, ButtonAction, Command, Content, Effect, Event, Keyboard, Label, MediaRef,
    OwnerInput, PendingAction, Sender, TargetSelector, UserId,
};
use crate::telegram::TransportError;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

const REPLY_BANNER: &str = "Admin reply:";
const BLOCKED_NOTICE: &str = "You have been blocked by the bot owner and cannot send messages.";
const UNBLOCKED_NOTICE: &str = "You have been unblocked by the owner! You can now send messages.";
const ACCESS_DENIED: &str = "Access denied.";
const DELIVERED_ACK: &str = "Your message has been sent successfully!";
const MEDIA_ACK: &str = "Your media was sent successfully!";
const SEND_FAILED: &str = "Error sending your message. Please try again later.";
const USER_HINT: &str = "Send a message or media and it will be delivered anonymously.";

// Bot API limits, in UTF-16 code units
const TEXT_LIMIT: usize = 4096;
const CAPTION_LIMIT: usize = 1024;
/// Characters of staged content echoed back in a confirmation prompt
const PREVIEW_LIMIT: usize = 1000;

const USER_LIST_LIMIT: usize = 20;
const BLOCKED_LIST_LIMIT: usize = 10;

/// Coordinator tunables
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub owner_id: UserId,
    /// Deadline for each single send, including each broadcast recipient
    pub delivery_timeout: Duration,
    /// Broadcast sends in flight at once
    pub broadcast_concurrency: usize,
}

impl RelaySettings {
    pub fn new(owner_id: UserId) -> Self {
        Self {
            owner_id,
            delivery_timeout: Duration::from_secs(10),
            broadcast_concurrency: 8,
        }
    }
}

/// Outcome of a broadcast fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastTally {
    pub delivered: usize,
    pub failed: usize,
}

impl BroadcastTally {
    fn summary(self) -> String {
        format!(
            "Broadcast completed!\n\nSuccessful sends: {}\nFailed sends: {}",
            self.delivered, self.failed
        )
    }
}

/// Generic coordinator over any directory, gate, and transport
pub struct RelayCoordinator<D, G, T>
where
    D: UserDirectory,
    G: MembershipGate,
    T: Transport,
{
    settings: RelaySettings,
    store: Arc<StateStore>,
    directory: D,
    gate: G,
    transport: T,
}

impl<D, G, T> RelayCoordinator<D, G, T>
where
    D: UserDirectory,
    G: MembershipGate,
    T: Transport,
{
    pub fn new(settings: RelaySettings, directory: D, gate: G, transport: T) -> Self {
        Self {
            settings,
            store: Arc::new(StateStore::new()),
            directory,
            gate,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn owner_id(&self) -> UserId {
        self.settings.owner_id
    }

    /// Handle one inbound event
    ///
    /// Failures have already been reported to the sender when this returns
    /// `Err`; the caller only needs to log them.
    pub async fn handle_event(&self, event: Event) -> Result<(), RelayError> {
        let sender_id = event.sender().id;
        tracing::debug!(user_id = sender_id, kind = event.kind(), "Handling event");

        let result = if sender_id == self.settings.owner_id {
            self.handle_owner_event(event).await
        } else {
            self.handle_user_event(event).await
        };

        if let Err(e) = &result {
            self.report_failure(sender_id, e).await;
        }
        result
    }

    async fn report_failure(&self, user_id: UserId, error: &RelayError) {
        let is_owner = user_id == self.settings.owner_id;
        match error {
            RelayError::Validation(_) => tracing::info!(user_id, error = %error, "Rejected input"),
            RelayError::StateViolation(_) => tracing::warn!(user_id, error = %error, "Rejected transition"),
            RelayError::Delivery { .. } | RelayError::Storage(_) => {
                tracing::error!(user_id, error = %error, "Step failed");
            }
        }

        let notice = if is_owner || matches!(error, RelayError::Validation(_)) {
            error.user_message()
        } else {
            SEND_FAILED.to_string()
        };
        let options = if is_owner && matches!(error, RelayError::StateViolation(_)) {
            keyboard_options(Keyboard::Cancel)
        } else {
            SendOptions::none()
        };
        if let Err(e) = self.transport.send_text(user_id, &notice, &options).await {
            tracing::warn!(user_id, error = %e, "Could not report failure");
        }
    }

    // ========================================================================
    // Non-owner events
    // ========================================================================

    async fn handle_user_event(&self, event: Event) -> Result<(), RelayError> {
        let sender = event.sender().clone();
        self.directory.upsert(&sender).await?;

        if let Event::Button { action, .. } = &event {
            if *action != ButtonAction::CheckMembership {
                tracing::warn!(user_id = sender.id, ?action, "Non-owner pressed an owner button");
                return self.notify(sender.id, ACCESS_DENIED).await;
            }
        }

        // 1. Membership
        if !self.gate.is_member(sender.id).await {
            return self.request_membership(sender.id).await;
        }

        // 2. Block status
        if self.directory.is_blocked(sender.id).await? {
            tracing::info!(user_id = sender.id, "Dropped message from blocked user");
            return self.notify(sender.id, BLOCKED_NOTICE).await;
        }

        // 3. Relay
        match event {
            Event::Command {
                command: Command::Start,
                ..
            }
            | Event::Button { .. } => self.welcome(&sender).await,
            Event::Command { .. } => self.notify(sender.id, USER_HINT).await,
            Event::Text { text, .. } => self.relay_text(&sender, &text).await,
            Event::Media { media, .. } => self.relay_media(&sender, &media).await,
        }
    }

    async fn request_membership(&self, user_id: UserId) -> Result<(), RelayError> {
        let text = match self.gate.channel() {
            Some(channel) => format!(
                "To use the bot, you must first join our channel:\n\n{channel}\n\nAfter joining, press the button below."
            ),
            None => "To use the bot, you must first join our channel.".to_string(),
        };
        tracing::info!(user_id, "Membership required");
        let options = SendOptions::actions(vec![ButtonAction::CheckMembership]);
        self.transport
            .send_text(user_id, &text, &options)
            .await
            .map_err(|e| RelayError::delivery(user_id, e))
    }

    async fn welcome(&self, sender: &Sender) -> Result<(), RelayError> {
        let name = sender.first_name.as_deref().unwrap_or("there");
        let text = format!(
            "Welcome to the anonymous bot, {name}!\n\nYour messages reach the owner without your identity being shown to anyone else.\n\n{USER_HINT}"
        );
        self.notify(sender.id, &text).await
    }

    async fn relay_text(&self, sender: &Sender, text: &str) -> Result<(), RelayError> {
        self.directory.save_message(sender.id, text).await?;

        let owner = self.settings.owner_id;
        let info = format!("From: {}", sender.describe());
        let body = format!("{info}\n\n{text}");
        let actions = relay_actions(sender.id);

        // Sender info goes out on its own when the combined text is too long
        let send = async {
            if fits(&body, TEXT_LIMIT) {
                self.transport.send_text(owner, &body, &actions).await
            } else {
                self.transport.send_text(owner, &info, &actions).await?;
                self.transport.send_text(owner, text, &SendOptions::none()).await
            }
        };
        self.within_deadline(send)
            .await
            .map_err(|e| RelayError::delivery(owner, e))?;

        tracing::info!(user_id = sender.id, "Relayed text to owner");
        self.notify(sender.id, DELIVERED_ACK).await
    }

    async fn relay_media(&self, sender: &Sender, media: &MediaRef) -> Result<(), RelayError> {
        let owner = self.settings.owner_id;
        let info = format!("From: {}", sender.describe());
        let options = relay_actions(sender.id);

        let own_caption = media
            .caption
            .as_deref()
            .filter(|_| media.kind.supports_caption());
        let combined = media
            .kind
            .supports_caption()
            .then(|| join_caption(&info, own_caption))
            .filter(|caption| fits(caption, CAPTION_LIMIT));

        let send = async {
            if let Some(caption) = &combined {
                self.transport
                    .send_media(owner, media, Some(caption.as_str()), &options)
                    .await
            } else {
                self.transport.send_text(owner, &info, &options).await?;
                self.transport
                    .send_media(owner, media, own_caption, &SendOptions::none())
                    .await
            }
        };
        self.within_deadline(send)
            .await
            .map_err(|e| RelayError::delivery(owner, e))?;

        tracing::info!(user_id = sender.id, kind = media.kind.as_str(), "Relayed media to owner");
        self.notify(sender.id, MEDIA_ACK).await
    }

    // ========================================================================
    // Owner events
    // ========================================================================

    async fn handle_owner_event(&self, event: Event) -> Result<(), RelayError> {
        let owner = self.settings.owner_id;
        let _guard = self.store.lock_user(owner).await;

        let mut inputs = vec![OwnerInput::from_event(event)];
        while let Some(input) = inputs.pop() {
            let record = self.store.record(owner);
            let result = transition(&record, input)?;

            for effect in result.effects {
                if let Some(next) = self.execute_effect(effect).await? {
                    inputs.push(next);
                }
            }

            // Every effect of this step succeeded
            if result.new_state.is_idle() {
                self.store.clear(owner);
            } else {
                self.store
                    .transition(owner, result.new_state, Some(result.patch))?;
            }
        }
        Ok(())
    }

    /// Run one effect; may yield a follow-up input for the state machine
    async fn execute_effect(&self, effect: Effect) -> Result<Option<OwnerInput>, RelayError> {
        let name = effect.name();
        let notification = effect.is_notification();

        let outcome = match effect {
            Effect::Reply { text, keyboard } => self
                .send_to_owner(&text, keyboard)
                .await
                .map(|()| None),
            Effect::ResolveTarget { selector } => self.resolve_target(selector).await.map(Some),
            Effect::DescribeTarget { user_id, label } => {
                self.describe_target(user_id, label).await.map(|()| None)
            }
            Effect::AskConfirmation { action } => self.ask_confirmation(&action).await.map(|()| None),
            Effect::Deliver { action } => self.deliver(&action).await.map(|()| None),
            Effect::Broadcast { text } => {
                let tally = self.broadcast(&text).await?;
                if let Err(e) = self.send_to_owner(&tally.summary(), Keyboard::Menu).await {
                    tracing::warn!(error = %e, "Could not report broadcast tally");
                }
                Ok(None)
            }
            Effect::SetBlocked { user_id, blocked } => {
                self.set_blocked(user_id, blocked).await.map(|()| None)
            }
            Effect::ShowUsers => self.show_users().await.map(|()| None),
            Effect::ShowBlocked => self.show_blocked().await.map(|()| None),
            Effect::ShowStats => self.show_stats().await.map(|()| None),
        };

        match outcome {
            Err(e) if notification => {
                tracing::warn!(effect = name, error = %e, "Notification failed");
                Ok(None)
            }
            other => other,
        }
    }

    async fn send_to_owner(&self, text: &str, keyboard: Keyboard) -> Result<(), RelayError> {
        let owner = self.settings.owner_id;
        self.send_text_within(owner, text, &keyboard_options(keyboard))
            .await
            .map_err(|e| RelayError::delivery(owner, e))
    }

    async fn resolve_target(&self, selector: TargetSelector) -> Result<OwnerInput, RelayError> {
        let found = match &selector {
            TargetSelector::Id(id) => self.directory.get(*id).await?.map(|u| u.user_id),
            TargetSelector::Handle(handle) => self.directory.find_by_handle(handle).await?,
        };
        Ok(match found {
            Some(user_id) if user_id != self.settings.owner_id => {
                OwnerInput::TargetResolved { user_id }
            }
            _ => OwnerInput::TargetNotFound { selector },
        })
    }

    async fn target_info(&self, user_id: UserId) -> String {
        match self.directory.get(user_id).await {
            Ok(Some(user)) => user.describe(),
            Ok(None) => describe_user(user_id, None, None, None),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Could not load target profile");
                describe_user(user_id, None, None, None)
            }
        }
    }

    async fn describe_target(&self, user_id: UserId, label: Label) -> Result<(), RelayError> {
        let info = self.target_info(user_id).await;
        let text = match label {
            Label::Reply => format!("Replying to user:\n{info}\n\nPlease enter your reply:"),
            Label::Message | Label::Broadcast => {
                format!("Sending a message to:\n{info}\n\nEnter your message (text or media):")
            }
        };
        self.send_to_owner(&text, Keyboard::Cancel).await
    }

    async fn ask_confirmation(&self, action: &PendingAction) -> Result<(), RelayError> {
        let preview = match &action.content {
            Content::Text { text } => shorten(text, PREVIEW_LIMIT),
            Content::Media(media) => match &media.caption {
                Some(caption) => format!("[{}] {caption}", media.kind.as_str()),
                None => format!("[{}]", media.kind.as_str()),
            },
        };
        let text = match action.target_user_id {
            Some(target) => {
                let info = self.target_info(target).await;
                format!("Send this {} to {info}?\n\n{preview}", action.label)
            }
            None => {
                let recipients = self.directory.count_active(Some(self.settings.owner_id)).await?;
                format!("Broadcast this to {recipients} users?\n\n{preview}")
            }
        };
        self.send_to_owner(&text, Keyboard::Confirm).await
    }

    /// Deliver a staged single-recipient send; only replies carry the banner
    async fn deliver(&self, action: &PendingAction) -> Result<(), RelayError> {
        let Some(target) = action.target_user_id else {
            return Err(RelayError::Validation("No recipient for this send.".to_string()));
        };
        let banner = action.label == Label::Reply;
        let none = SendOptions::none();

        // The banner is sent on its own when it cannot share the message
        let send = async {
            match &action.content {
                Content::Text { text } => {
                    let body = format!("{REPLY_BANNER}\n\n{text}");
                    if !banner {
                        self.transport.send_text(target, text, &none).await
                    } else if fits(&body, TEXT_LIMIT) {
                        self.transport.send_text(target, &body, &none).await
                    } else {
                        self.transport.send_text(target, REPLY_BANNER, &none).await?;
                        self.transport.send_text(target, text, &none).await
                    }
                }
                Content::Media(media) => {
                    let own_caption = media
                        .caption
                        .as_deref()
                        .filter(|_| media.kind.supports_caption());
                    let combined = (banner && media.kind.banner_in_caption())
                        .then(|| join_caption(REPLY_BANNER, own_caption))
                        .filter(|caption| fits(caption, CAPTION_LIMIT));

                    if let Some(caption) = &combined {
                        self.transport
                            .send_media(target, media, Some(caption.as_str()), &none)
                            .await
                    } else {
                        if banner {
                            self.transport.send_text(target, REPLY_BANNER, &none).await?;
                        }
                        self.transport.send_media(target, media, own_caption, &none).await
                    }
                }
            }
        };

        self.within_deadline(send)
            .await
            .map_err(|e| RelayError::delivery(target, e))?;
        tracing::info!(target_user_id = target, label = %action.label, "Delivered pending action");
        Ok(())
    }

    /// Fan a text out to every non-blocked user except the owner
    ///
    /// Each recipient is its own failure domain with its own deadline.
    pub async fn broadcast(&self, text: &str) -> Result<BroadcastTally, RelayError> {
        let recipients = self
            .directory
            .active_user_ids(Some(self.settings.owner_id))
            .await?;
        let total = recipients.len();
        let none = SendOptions::none();
        let none = &none;

        let outcomes: Vec<bool> = stream::iter(recipients)
            .map(|user_id| async move {
                match self.send_text_within(user_id, text, none).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, kind = ?e.kind, "Broadcast delivery failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.settings.broadcast_concurrency.max(1))
            .collect()
            .await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let tally = BroadcastTally {
            delivered,
            failed: total - delivered,
        };
        tracing::info!(recipients = total, delivered = tally.delivered, failed = tally.failed, "Broadcast finished");
        Ok(tally)
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool) -> Result<(), RelayError> {
        if user_id == self.settings.owner_id {
            return Err(RelayError::Validation("You cannot block yourself.".to_string()));
        }
        if !self.directory.set_blocked(user_id, blocked).await? {
            return Err(RelayError::Validation(format!("User {user_id} not found.")));
        }
        tracing::info!(user_id, blocked, "Updated block status");

        // The affected user may have blocked the bot; that is fine
        let notice = if blocked { BLOCKED_NOTICE } else { UNBLOCKED_NOTICE };
        if let Err(e) = self.send_text_within(user_id, notice, &SendOptions::none()).await {
            tracing::debug!(user_id, error = %e, "Block status notice not delivered");
        }

        let info = self.target_info(user_id).await;
        let text = if blocked {
            format!("User successfully blocked:\n{info}")
        } else {
            format!("User successfully unblocked:\n{info}")
        };
        if let Err(e) = self.send_to_owner(&text, Keyboard::None).await {
            tracing::warn!(error = %e, "Could not confirm block status to owner");
        }
        Ok(())
    }

    async fn show_users(&self) -> Result<(), RelayError> {
        let users = self.directory.list_all(Some(self.settings.owner_id)).await?;
        if users.is_empty() {
            return self.send_to_owner("No users registered.", Keyboard::Menu).await;
        }
        let mut text = format!("Users ({}):\n\n", users.len());
        for (i, user) in users.iter().take(USER_LIST_LIMIT).enumerate() {
            let status = if user.is_blocked { "blocked" } else { "active" };
            let _ = writeln!(
                text,
                "{}. {} | ID {} | {status}",
                i + 1,
                user.display_name(),
                user.user_id
            );
        }
        if users.len() > USER_LIST_LIMIT {
            let _ = write!(text, "\n...and {} more", users.len() - USER_LIST_LIMIT);
        }
        self.send_to_owner(&text, Keyboard::Menu).await
    }

    async fn show_blocked(&self) -> Result<(), RelayError> {
        let users = self.directory.list_blocked(Some(self.settings.owner_id)).await?;
        if users.is_empty() {
            return self.send_to_owner("No blocked users found.", Keyboard::Menu).await;
        }
        let shown: Vec<&UserRecord> = users.iter().take(BLOCKED_LIST_LIMIT).collect();
        let mut text = format!("Blocked users ({}):\n\n", users.len());
        for user in &shown {
            let _ = writeln!(text, "{}", user.describe());
        }
        let options = SendOptions::actions(
            shown
                .iter()
                .map(|u| ButtonAction::Unblock(u.user_id))
                .collect(),
        );
        let owner = self.settings.owner_id;
        self.send_text_within(owner, &text, &options)
            .await
            .map_err(|e| RelayError::delivery(owner, e))
    }

    async fn show_stats(&self) -> Result<(), RelayError> {
        let stats = self.directory.stats(Some(self.settings.owner_id)).await?;
        let text = format!(
            "Statistics\n\nTotal users: {}\nActive users: {}\nBlocked users: {}\nTotal messages: {}",
            stats.total_users, stats.active_users, stats.blocked_users, stats.total_messages
        );
        self.send_to_owner(&text, Keyboard::Menu).await
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Drop stale conversation state
    ///
    /// The active set is the owner plus every non-blocked user in the
    /// directory. The owner is told when one of their flows expired.
    pub async fn reconcile(&self, idle_timeout: Duration) -> Result<Vec<Expired>, RelayError> {
        let owner = self.settings.owner_id;
        let mut active: HashSet<UserId> = self
            .directory
            .active_user_ids(Some(owner))
            .await?
            .into_iter()
            .collect();
        active.insert(owner);

        let expired = self.store.reconcile(&active, idle_timeout);
        for entry in expired.iter().filter(|e| e.record.user_id == owner) {
            let text = match entry.reason {
                ExpiryReason::IdleTimeout => format!(
                    "Your unfinished operation ({}) expired and was cancelled.",
                    entry.record.state
                ),
                ExpiryReason::Inactive => "Your unfinished operation was cancelled.".to_string(),
            };
            if let Err(e) = self.send_to_owner(&text, Keyboard::Menu).await {
                tracing::warn!(error = %e, "Could not notify owner about expired state");
            }
        }
        Ok(expired)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn notify(&self, user_id: UserId, text: &str) -> Result<(), RelayError> {
        self.send_text_within(user_id, text, &SendOptions::none())
            .await
            .map_err(|e| RelayError::delivery(user_id, e))
    }

    async fn send_text_within(
        &self,
        dest: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        self.within_deadline(self.transport.send_text(dest, text, options))
            .await
    }

    async fn within_deadline<F>(&self, send: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), TransportError>>,
    {
        let deadline = self.settings.delivery_timeout;
        tokio::time::timeout(deadline, send).await.unwrap_or_else(|_| {
            Err(TransportError::timeout(format!(
                "no response within {}s",
                deadline.as_secs()
            )))
        })
    }
}

fn fits(text: &str, limit: usize) -> bool {
    text.encode_utf16().count() <= limit
}

fn shorten(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some(_) => {
            let mut short: String = text.chars().take(max_chars).collect();
            short.push_str("...");
            short
        }
        None => text.to_string(),
    }
}

fn join_caption(header: &str, caption: Option<&str>) -> String {
    match caption {
        Some(caption) => format!("{header}\n\n{caption}"),
        None => header.to_string(),
    }
}

fn relay_actions(sender_id: UserId) -> SendOptions {
    SendOptions::actions(vec![
        ButtonAction::Reply(sender_id),
        ButtonAction::Block(sender_id),
    ])
}

fn keyboard_options(keyboard: Keyboard) -> SendOptions {
    match keyboard {
        Keyboard::None => SendOptions::none(),
        Keyboard::Menu => SendOptions::quick_replies(&Directive::MENU),
        Keyboard::Cancel => SendOptions::quick_replies(&Directive::CANCEL),
        Keyboard::Confirm => SendOptions::quick_replies(&Directive::CONFIRMATION),
    }
}
