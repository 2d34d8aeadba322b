//! Mock implementations for testing
//!
//! These mocks enable coordinator scenarios without real I/O.

use super::error::DirectoryError;
use super::executor::{RelayCoordinator, RelaySettings};
use super::traits::*;
use crate::db::{DirectoryStats, UserRecord};
use crate::state_machine::{ConversationState, Event, MediaRef, Sender, UserId};
use crate::telegram::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock Transport
// ============================================================================

/// Something the mock transport delivered
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text {
        dest: UserId,
        text: String,
        options: SendOptions,
    },
    Media {
        dest: UserId,
        media: MediaRef,
        caption: Option<String>,
        options: SendOptions,
    },
}

impl Sent {
    pub fn dest(&self) -> UserId {
        match self {
            Sent::Text { dest, .. } | Sent::Media { dest, .. } => *dest,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Sent::Text { text, .. } => Some(text),
            Sent::Media { .. } => None,
        }
    }

    pub fn options(&self) -> &SendOptions {
        match self {
            Sent::Text { options, .. } | Sent::Media { options, .. } => options,
        }
    }
}

/// Mock transport that records deliveries
///
/// Destinations can be made to fail or to answer slowly. A delayed send is
/// only recorded once it completes.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<HashMap<UserId, TransportErrorKind>>,
    delays: Mutex<HashMap<UserId, Duration>>,
    statuses: Mutex<HashMap<UserId, ChatMemberStatus>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, dest: UserId, kind: TransportErrorKind) {
        self.failing.lock().unwrap().insert(dest, kind);
    }

    pub fn delay_for(&self, dest: UserId, delay: Duration) {
        self.delays.lock().unwrap().insert(dest, delay);
    }

    pub fn set_status(&self, user_id: UserId, status: ChatMemberStatus) {
        self.statuses.lock().unwrap().insert(user_id, status);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, dest: UserId) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.dest() == dest).collect()
    }

    pub fn texts_to(&self, dest: UserId) -> Vec<String> {
        self.sent_to(dest)
            .iter()
            .filter_map(|s| s.text().map(String::from))
            .collect()
    }

    pub fn last_text_to(&self, dest: UserId) -> Option<String> {
        self.texts_to(dest).pop()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    async fn deliver(&self, dest: UserId, sent: Sent) -> Result<(), TransportError> {
        let delay = self.delays.lock().unwrap().get(&dest).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing.lock().unwrap().get(&dest).copied();
        if let Some(kind) = failing {
            return Err(TransportError::new(kind, format!("mock failure for {dest}")));
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(
        &self,
        dest: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let sent = Sent::Text {
            dest,
            text: text.to_string(),
            options: options.clone(),
        };
        self.deliver(dest, sent).await
    }

    async fn send_media(
        &self,
        dest: UserId,
        media: &MediaRef,
        caption: Option<&str>,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let sent = Sent::Media {
            dest,
            media: media.clone(),
            caption: caption.map(String::from),
            options: options.clone(),
        };
        self.deliver(dest, sent).await
    }

    async fn get_chat_member_status(
        &self,
        _channel: &str,
        user_id: UserId,
    ) -> Result<ChatMemberStatus, TransportError> {
        self.statuses
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .ok_or_else(|| TransportError::invalid_request("user not found"))
    }
}

// ============================================================================
// In-Memory Directory
// ============================================================================

/// In-memory user directory; can be switched to fail every call
#[derive(Default)]
pub struct InMemoryDirectory {
    users: Mutex<HashMap<UserId, UserRecord>>,
    messages: Mutex<Vec<(UserId, String)>>,
    unavailable: AtomicBool,
}

#[allow(dead_code)]
impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user directly; later additions count as newer
    pub fn add_user(&self, user_id: UserId, username: Option<&str>, blocked: bool) {
        let mut users = self.users.lock().unwrap();
        let offset = i64::try_from(users.len()).unwrap();
        users.insert(
            user_id,
            UserRecord {
                user_id,
                username: username.map(String::from),
                first_name: Some(format!("User{user_id}")),
                last_name: None,
                join_date: Utc::now() + ChronoDuration::seconds(offset),
                is_blocked: blocked,
            },
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(UserId, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn user(&self, user_id: UserId) -> Option<UserRecord> {
        self.users.lock().unwrap().get(&user_id).cloned()
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError("mock directory offline".to_string()));
        }
        Ok(())
    }

    fn filtered(&self, excluding: Option<UserId>, blocked_only: bool) -> Vec<UserRecord> {
        let mut users: Vec<UserRecord> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| Some(u.user_id) != excluding)
            .filter(|u| !blocked_only || u.is_blocked)
            .cloned()
            .collect();
        users.sort_by(|a, b| b.join_date.cmp(&a.join_date));
        users
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn upsert(&self, sender: &Sender) -> Result<(), DirectoryError> {
        self.check()?;
        let mut users = self.users.lock().unwrap();
        let user = users.entry(sender.id).or_insert_with(|| UserRecord {
            user_id: sender.id,
            username: None,
            first_name: None,
            last_name: None,
            join_date: Utc::now(),
            is_blocked: false,
        });
        user.username.clone_from(&sender.handle);
        user.first_name.clone_from(&sender.first_name);
        user.last_name.clone_from(&sender.last_name);
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserRecord>, DirectoryError> {
        self.check()?;
        Ok(self.user(user_id))
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<UserId>, DirectoryError> {
        self.check()?;
        let handle = handle.trim_start_matches('@');
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| {
                u.username
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(handle))
            })
            .map(|u| u.user_id))
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool) -> Result<bool, DirectoryError> {
        self.check()?;
        Ok(match self.users.lock().unwrap().get_mut(&user_id) {
            Some(user) => {
                user.is_blocked = blocked;
                true
            }
            None => false,
        })
    }

    async fn is_blocked(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        self.check()?;
        Ok(self.user(user_id).is_some_and(|u| u.is_blocked))
    }

    async fn list_all(&self, excluding: Option<UserId>) -> Result<Vec<UserRecord>, DirectoryError> {
        self.check()?;
        Ok(self.filtered(excluding, false))
    }

    async fn list_blocked(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserRecord>, DirectoryError> {
        self.check()?;
        Ok(self.filtered(excluding, true))
    }

    async fn active_user_ids(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<UserId>, DirectoryError> {
        self.check()?;
        Ok(self
            .filtered(excluding, false)
            .into_iter()
            .filter(|u| !u.is_blocked)
            .map(|u| u.user_id)
            .collect())
    }

    async fn count_active(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        Ok(self.active_user_ids(excluding).await?.len() as u64)
    }

    async fn count_blocked(&self, excluding: Option<UserId>) -> Result<u64, DirectoryError> {
        Ok(self.list_blocked(excluding).await?.len() as u64)
    }

    async fn save_message(&self, user_id: UserId, text: &str) -> Result<(), DirectoryError> {
        self.check()?;
        self.messages
            .lock()
            .unwrap()
            .push((user_id, text.to_string()));
        Ok(())
    }

    async fn stats(&self, excluding: Option<UserId>) -> Result<DirectoryStats, DirectoryError> {
        let active_users = self.count_active(excluding).await?;
        let blocked_users = self.count_blocked(excluding).await?;
        let total_messages = self
            .messages()
            .iter()
            .filter(|(id, _)| Some(*id) != excluding)
            .count() as u64;
        Ok(DirectoryStats {
            total_users: active_users + blocked_users,
            active_users,
            blocked_users,
            total_messages,
        })
    }
}

// ============================================================================
// Static Gate
// ============================================================================

/// Gate with a fixed member list, or open to all
pub struct StaticGate {
    members: Option<HashSet<UserId>>,
}

#[allow(dead_code)]
impl StaticGate {
    pub fn open() -> Self {
        Self { members: None }
    }

    pub fn only(members: &[UserId]) -> Self {
        Self {
            members: Some(members.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl MembershipGate for StaticGate {
    async fn is_member(&self, user_id: UserId) -> bool {
        self.members.as_ref().map_or(true, |m| m.contains(&user_id))
    }

    fn channel(&self) -> Option<&str> {
        self.members.as_ref().map(|_| "@relay_channel")
    }
}

// ============================================================================
// Test Harness
// ============================================================================

pub const OWNER: UserId = 1;

pub type TestCoordinator =
    RelayCoordinator<Arc<InMemoryDirectory>, Arc<StaticGate>, Arc<MockTransport>>;

/// Coordinator wired to mocks, with handles on each mock
pub struct TestRelay {
    pub coordinator: TestCoordinator,
    pub directory: Arc<InMemoryDirectory>,
    pub transport: Arc<MockTransport>,
}

#[allow(dead_code)]
impl TestRelay {
    pub fn new() -> Self {
        Self::build(StaticGate::open(), RelaySettings::new(OWNER))
    }

    pub fn build(gate: StaticGate, settings: RelaySettings) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(MockTransport::new());
        let coordinator = RelayCoordinator::new(
            settings,
            directory.clone(),
            Arc::new(gate),
            transport.clone(),
        );
        Self {
            coordinator,
            directory,
            transport,
        }
    }

    pub fn owner_state(&self) -> ConversationState {
        self.coordinator.store().get(OWNER)
    }

    pub async fn owner_says(&self, text: &str) {
        let _ = self.coordinator.handle_event(text_event(OWNER, text)).await;
    }

    pub async fn owner_sends(&self, event: Event) {
        let _ = self.coordinator.handle_event(event).await;
    }
}

pub fn sender(id: UserId) -> Sender {
    Sender::new(id).with_name(format!("User{id}"), None)
}

pub fn text_event(from: UserId, text: &str) -> Event {
    match crate::state_machine::Command::parse(text) {
        Some(command) => Event::Command {
            sender: sender(from),
            command,
        },
        None => Event::Text {
            sender: sender(from),
            text: text.to_string(),
        },
    }
}

pub fn media_event(from: UserId, media: MediaRef) -> Event {
    Event::Media {
        sender: sender(from),
        media,
    }
}

pub fn button_event(from: UserId, action: crate::state_machine::ButtonAction) -> Event {
    Event::Button {
        sender: sender(from),
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RelayError;
    use crate::state_machine::{ButtonAction, Content, Label, MediaKind, PendingAction};

    fn seeded() -> TestRelay {
        let relay = TestRelay::new();
        relay.directory.add_user(10, Some("alice"), false);
        relay.directory.add_user(20, Some("bob"), false);
        relay.directory.add_user(30, Some("carol"), true);
        relay
    }

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_mock_transport_failures_and_records() {
        let transport = MockTransport::new();
        transport.fail_for(5, TransportErrorKind::Forbidden);

        transport.send_text(4, "hi", &SendOptions::none()).await.unwrap();
        let err = transport
            .send_text(5, "hi", &SendOptions::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Forbidden);
        assert_eq!(transport.texts_to(4), vec!["hi".to_string()]);
        assert!(transport.sent_to(5).is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_directory_preserves_block_on_upsert() {
        let directory = InMemoryDirectory::new();
        directory.add_user(7, Some("seven"), true);
        directory.upsert(&Sender::new(7).with_handle("renamed")).await.unwrap();

        let user = directory.user(7).unwrap();
        assert!(user.is_blocked);
        assert_eq!(directory.find_by_handle("@RENAMED").await.unwrap(), Some(7));
    }

    // ------------------------------------------------------------------------
    // Non-owner relay
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_user_text_is_saved_and_relayed() {
        let relay = seeded();
        relay
            .coordinator
            .handle_event(text_event(10, "hello owner"))
            .await
            .unwrap();

        let to_owner = relay.transport.sent_to(OWNER);
        assert_eq!(to_owner.len(), 1);
        let text = to_owner[0].text().unwrap();
        assert!(text.contains("ID 10"));
        assert!(text.ends_with("hello owner"));
        assert_eq!(
            to_owner[0].options().actions,
            vec![ButtonAction::Reply(10), ButtonAction::Block(10)]
        );
        assert_eq!(relay.directory.messages(), vec![(10, "hello owner".to_string())]);
        assert_eq!(relay.transport.texts_to(10).len(), 1, "sender gets an ack");
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_blocked_user_is_not_relayed() {
        let relay = seeded();
        relay
            .coordinator
            .handle_event(text_event(30, "let me in"))
            .await
            .unwrap();

        assert!(relay.transport.sent_to(OWNER).is_empty());
        assert!(relay.directory.messages().is_empty());
        let notice = relay.transport.last_text_to(30).unwrap();
        assert!(notice.contains("blocked"));
    }

    #[tokio::test]
    async fn test_non_member_is_asked_to_join() {
        let relay = TestRelay::build(StaticGate::only(&[10]), RelaySettings::new(OWNER));
        relay
            .coordinator
            .handle_event(text_event(40, "hi"))
            .await
            .unwrap();

        assert!(relay.transport.sent_to(OWNER).is_empty());
        let sent = relay.transport.sent_to(40);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text().unwrap().contains("@relay_channel"));
        assert_eq!(sent[0].options().actions, vec![ButtonAction::CheckMembership]);
        // The user is still registered
        assert!(relay.directory.user(40).is_some());
    }

    #[tokio::test]
    async fn test_membership_check_button_welcomes_members() {
        let relay = TestRelay::build(StaticGate::only(&[10]), RelaySettings::new(OWNER));
        relay
            .coordinator
            .handle_event(button_event(10, ButtonAction::CheckMembership))
            .await
            .unwrap();
        assert!(relay.transport.last_text_to(10).unwrap().contains("Welcome"));
    }

    #[tokio::test]
    async fn test_non_owner_cannot_press_owner_buttons() {
        let relay = seeded();
        relay
            .coordinator
            .handle_event(button_event(10, ButtonAction::Block(20)))
            .await
            .unwrap();

        assert_eq!(relay.transport.last_text_to(10).as_deref(), Some("Access denied."));
        assert!(!relay.directory.user(20).unwrap().is_blocked);
    }

    #[tokio::test]
    async fn test_sticker_relay_sends_info_separately() {
        let relay = seeded();
        let sticker = MediaRef::new(MediaKind::Sticker, "sticker-1");
        relay
            .coordinator
            .handle_event(media_event(10, sticker.clone()))
            .await
            .unwrap();

        let to_owner = relay.transport.sent_to(OWNER);
        assert_eq!(to_owner.len(), 2);
        assert!(to_owner[0].text().unwrap().contains("ID 10"));
        assert_eq!(
            to_owner[1],
            Sent::Media {
                dest: OWNER,
                media: sticker,
                caption: None,
                options: SendOptions::none(),
            }
        );
        // Only text is persisted
        assert!(relay.directory.messages().is_empty());
    }

    #[tokio::test]
    async fn test_photo_relay_prefixes_caption() {
        let relay = seeded();
        let photo = MediaRef::new(MediaKind::Photo, "photo-1").with_caption("sunset");
        relay
            .coordinator
            .handle_event(media_event(20, photo))
            .await
            .unwrap();

        match &relay.transport.sent_to(OWNER)[..] {
            [Sent::Media { caption: Some(caption), .. }] => {
                assert!(caption.starts_with("From: ID 20"));
                assert!(caption.ends_with("sunset"));
            }
            other => panic!("unexpected deliveries: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_long_text_relay_sends_info_separately() {
        let relay = seeded();
        let long = "a".repeat(4090);
        relay
            .coordinator
            .handle_event(text_event(10, &long))
            .await
            .unwrap();

        let to_owner = relay.transport.sent_to(OWNER);
        assert_eq!(to_owner.len(), 2);
        assert!(to_owner[0].text().unwrap().starts_with("From: ID 10"));
        assert_eq!(
            to_owner[0].options().actions,
            vec![ButtonAction::Reply(10), ButtonAction::Block(10)]
        );
        assert_eq!(to_owner[1].text(), Some(long.as_str()));
        assert!(to_owner[1].options().actions.is_empty());
    }

    #[tokio::test]
    async fn test_long_caption_relay_keeps_original_caption() {
        let relay = seeded();
        let caption = "b".repeat(1020);
        let photo = MediaRef::new(MediaKind::Photo, "photo-2").with_caption(caption.clone());
        relay
            .coordinator
            .handle_event(media_event(20, photo.clone()))
            .await
            .unwrap();

        let to_owner = relay.transport.sent_to(OWNER);
        assert_eq!(to_owner.len(), 2);
        assert!(to_owner[0].text().unwrap().starts_with("From: ID 20"));
        assert_eq!(
            to_owner[1],
            Sent::Media {
                dest: OWNER,
                media: photo,
                caption: Some(caption),
                options: SendOptions::none(),
            }
        );
    }

    #[tokio::test]
    async fn test_storage_failure_is_terminal_for_the_turn() {
        let relay = seeded();
        relay.directory.set_unavailable(true);

        let err = relay
            .coordinator
            .handle_event(text_event(10, "anyone?"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
        assert!(relay.transport.sent_to(OWNER).is_empty());
        assert!(relay.transport.last_text_to(10).unwrap().contains("try again"));
    }

    #[tokio::test]
    async fn test_owner_unreachable_reports_failure_to_sender() {
        let relay = seeded();
        relay.transport.fail_for(OWNER, TransportErrorKind::Network);

        let err = relay
            .coordinator
            .handle_event(text_event(10, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery { user_id: OWNER, .. }));
        assert!(relay.transport.last_text_to(10).unwrap().contains("try again"));
    }

    // ------------------------------------------------------------------------
    // Owner flows
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_broadcast_scenario() {
        let relay = seeded();

        relay.owner_says("broadcast").await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingBroadcastText);

        relay.owner_says("Hello all").await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingSendConfirmation);
        let pending = relay.coordinator.store().record(OWNER).pending_action().unwrap();
        assert_eq!(pending, PendingAction::broadcast("Hello all"));

        relay.owner_says("confirm").await;
        assert_eq!(relay.owner_state(), ConversationState::Idle);
        assert_eq!(relay.transport.texts_to(10), vec!["Hello all".to_string()]);
        assert_eq!(relay.transport.texts_to(20), vec!["Hello all".to_string()]);
        assert!(relay.transport.sent_to(30).is_empty(), "blocked users are skipped");

        let tally = relay.transport.last_text_to(OWNER).unwrap();
        assert!(tally.contains("Successful sends: 2"));
        assert!(tally.contains("Failed sends: 0"));
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failures_and_timeouts() {
        let mut settings = RelaySettings::new(OWNER);
        settings.delivery_timeout = Duration::from_millis(50);
        let relay = TestRelay::build(StaticGate::open(), settings);
        relay.directory.add_user(10, None, false);
        relay.directory.add_user(20, None, false);
        relay.directory.add_user(30, None, false);
        relay.transport.fail_for(20, TransportErrorKind::Forbidden);
        relay.transport.delay_for(30, Duration::from_secs(2));

        let tally = relay.coordinator.broadcast("news").await.unwrap();
        assert_eq!(tally.delivered, 1);
        assert_eq!(tally.failed, 2);
        assert_eq!(relay.transport.texts_to(10), vec!["news".to_string()]);
        assert!(relay.transport.sent_to(30).is_empty());
    }

    #[tokio::test]
    async fn test_reply_then_cancel_delivers_nothing() {
        let relay = seeded();
        relay.directory.add_user(555, None, false);

        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(555))).await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingReplyToUser);
        assert_eq!(relay.coordinator.store().record(OWNER).target_user_id(), Some(555));

        let photo = MediaRef::new(MediaKind::Photo, "photo-ref");
        relay.owner_sends(media_event(OWNER, photo.clone())).await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingSendConfirmation);
        let pending = relay.coordinator.store().record(OWNER).pending_action().unwrap();
        assert_eq!(pending.label, Label::Reply);
        assert_eq!(pending.content, Content::Media(photo));

        relay.owner_says("cancel").await;
        assert_eq!(relay.owner_state(), ConversationState::Idle);
        assert!(relay.transport.sent_to(555).is_empty());
        // Cancelling clears the staged action along with the state
        assert_eq!(relay.coordinator.store().get_payload(OWNER, None), None);
        assert!(relay
            .coordinator
            .store()
            .list_users_in_state(ConversationState::AwaitingSendConfirmation)
            .is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_photo_reply_carries_banner() {
        let relay = seeded();
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(10))).await;
        let photo = MediaRef::new(MediaKind::Photo, "p-1").with_caption("here");
        relay.owner_sends(media_event(OWNER, photo.clone())).await;
        relay.owner_says("confirm").await;

        assert_eq!(
            relay.transport.sent_to(10),
            vec![Sent::Media {
                dest: 10,
                media: photo,
                caption: Some("Admin reply:\n\nhere".to_string()),
                options: SendOptions::none(),
            }]
        );
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_long_reply_sends_banner_separately() {
        let relay = seeded();
        let long = "c".repeat(4090);
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(10))).await;
        relay.owner_says(&long).await;
        let prompt = relay.transport.last_text_to(OWNER).unwrap();
        assert!(prompt.starts_with("Send this reply"));
        assert!(prompt.ends_with("..."));
        assert!(prompt.chars().count() < 1200);

        relay.owner_says("confirm").await;

        assert_eq!(
            relay.transport.texts_to(10),
            vec!["Admin reply:".to_string(), long]
        );
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_voice_reply_sends_banner_first() {
        let relay = seeded();
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(10))).await;
        let voice = MediaRef::new(MediaKind::Voice, "v-1");
        relay.owner_sends(media_event(OWNER, voice.clone())).await;
        relay.owner_says("yes").await;

        let sent = relay.transport.sent_to(10);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].text(), Some("Admin reply:"));
        assert!(matches!(&sent[1], Sent::Media { media, caption: None, .. } if *media == voice));
    }

    #[tokio::test]
    async fn test_direct_message_has_no_banner() {
        let relay = seeded();
        relay.owner_says("send").await;
        relay.owner_says("@Alice").await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingMessageToUser);
        assert_eq!(relay.coordinator.store().record(OWNER).target_user_id(), Some(10));

        relay.owner_says("plain note").await;
        relay.owner_says("confirm").await;
        assert_eq!(relay.transport.texts_to(10), vec!["plain note".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_handle_stays_in_selector() {
        let relay = seeded();
        relay.owner_says("send").await;
        relay.owner_says("@ghost").await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingTargetSelector);
        assert!(relay.transport.last_text_to(OWNER).unwrap().contains("not found"));

        relay.owner_says("20").await;
        assert_eq!(relay.owner_state(), ConversationState::AwaitingMessageToUser);
        assert_eq!(relay.coordinator.store().record(OWNER).target_user_id(), Some(20));
    }

    #[tokio::test]
    async fn test_concurrent_double_confirm_delivers_once() {
        let relay = seeded();
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(10))).await;
        relay.owner_says("only once").await;
        relay.transport.delay_for(10, Duration::from_millis(30));

        let (first, second) = tokio::join!(
            relay.coordinator.handle_event(text_event(OWNER, "confirm")),
            relay.coordinator.handle_event(text_event(OWNER, "confirm")),
        );
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(relay.transport.sent_to(10).len(), 1);
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_confirmation() {
        let relay = seeded();
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(20))).await;
        relay.owner_says("are you there?").await;
        relay.transport.fail_for(20, TransportErrorKind::Forbidden);

        let err = relay
            .coordinator
            .handle_event(text_event(OWNER, "confirm"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery { user_id: 20, .. }));
        assert_eq!(relay.owner_state(), ConversationState::AwaitingSendConfirmation);
        assert!(relay.transport.last_text_to(OWNER).unwrap().contains("Could not deliver"));

        relay.owner_says("cancel").await;
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_confirmation_reprompts_on_noise() {
        let relay = seeded();
        relay.owner_sends(button_event(OWNER, ButtonAction::Reply(10))).await;
        relay.owner_says("draft").await;
        relay.owner_says("hmm, wait").await;

        assert_eq!(relay.owner_state(), ConversationState::AwaitingSendConfirmation);
        assert!(relay.transport.sent_to(10).is_empty());
        let reprompt = relay.transport.sent_to(OWNER).pop().unwrap();
        assert_eq!(reprompt.options().quick_replies, vec!["confirm", "cancel"]);
    }

    #[tokio::test]
    async fn test_reply_button_mid_flow_is_rejected() {
        let relay = seeded();
        relay.owner_says("broadcast").await;

        let err = relay
            .coordinator
            .handle_event(button_event(OWNER, ButtonAction::Reply(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::StateViolation(_)));
        assert_eq!(relay.owner_state(), ConversationState::AwaitingBroadcastText);
        assert!(relay.transport.last_text_to(OWNER).unwrap().contains("cancel"));
    }

    #[tokio::test]
    async fn test_block_and_unblock_buttons() {
        let relay = seeded();
        relay.owner_says("broadcast").await;

        relay.owner_sends(button_event(OWNER, ButtonAction::Block(10))).await;
        relay.owner_sends(button_event(OWNER, ButtonAction::Block(10))).await;
        assert!(relay.directory.user(10).unwrap().is_blocked);
        assert_eq!(relay.owner_state(), ConversationState::AwaitingBroadcastText);
        assert!(relay.transport.last_text_to(10).unwrap().contains("blocked"));

        relay.owner_sends(button_event(OWNER, ButtonAction::Unblock(10))).await;
        assert!(!relay.directory.user(10).unwrap().is_blocked);
        assert!(relay.transport.last_text_to(10).unwrap().contains("unblocked"));
    }

    #[tokio::test]
    async fn test_blocked_notice_failure_does_not_abort() {
        let relay = seeded();
        relay.transport.fail_for(20, TransportErrorKind::Forbidden);
        relay
            .coordinator
            .handle_event(button_event(OWNER, ButtonAction::Block(20)))
            .await
            .unwrap();
        assert!(relay.directory.user(20).unwrap().is_blocked);
    }

    #[tokio::test]
    async fn test_directory_views() {
        let relay = seeded();

        relay.owner_says("users").await;
        let list = relay.transport.last_text_to(OWNER).unwrap();
        assert!(list.starts_with("Users (3)"));
        assert!(list.contains("@carol | ID 30 | blocked"));

        relay.owner_says("blocked").await;
        let blocked = relay.transport.sent_to(OWNER).pop().unwrap();
        assert_eq!(blocked.options().actions, vec![ButtonAction::Unblock(30)]);

        relay.owner_says("stats").await;
        let stats = relay.transport.last_text_to(OWNER).unwrap();
        assert!(stats.contains("Total users: 3"));
        assert!(stats.contains("Blocked users: 1"));
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_idle_noise_gets_menu() {
        let relay = seeded();
        relay.owner_says("what now").await;
        let reply = relay.transport.sent_to(OWNER).pop().unwrap();
        assert_eq!(reply.options().quick_replies.len(), 5);
        assert_eq!(relay.owner_state(), ConversationState::Idle);
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconcile_expires_idle_owner_flow() {
        let relay = seeded();
        relay.owner_says("broadcast").await;
        relay.transport.clear();

        let expired = relay.coordinator.reconcile(Duration::from_secs(600)).await.unwrap();
        assert!(expired.is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = relay.coordinator.reconcile(Duration::ZERO).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(relay.owner_state(), ConversationState::Idle);
        assert!(relay.transport.last_text_to(OWNER).unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_reconcile_drops_users_leaving_active_set() {
        let relay = seeded();
        relay
            .coordinator
            .store()
            .set_state(20, ConversationState::AwaitingBroadcastText, None);
        relay.directory.set_blocked(20, true).await.unwrap();

        let expired = relay.coordinator.reconcile(Duration::from_secs(600)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].record.user_id, 20);
        assert_eq!(relay.coordinator.store().get(20), ConversationState::Idle);
    }
}
