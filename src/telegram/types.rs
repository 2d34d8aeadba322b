//! Bot API wire types and their mapping onto core events

use crate::runtime::SendOptions;
use crate::state_machine::{ButtonAction, Command, Event, MediaKind, MediaRef, Sender, UserId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Responses
// ============================================================================

/// Envelope every Bot API method answers with
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<u16>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}

/// Any single-file attachment; only the id matters here
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    pub video: Option<FileRef>,
    pub document: Option<FileRef>,
    pub audio: Option<FileRef>,
    pub voice: Option<FileRef>,
    pub sticker: Option<FileRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatMember {
    pub status: String,
}

// ============================================================================
// Update -> Event
// ============================================================================

impl From<&User> for Sender {
    fn from(user: &User) -> Self {
        Sender {
            id: user.id,
            handle: user.username.clone(),
            first_name: Some(user.first_name.clone()),
            last_name: user.last_name.clone(),
        }
    }
}

impl Update {
    /// Who caused the update, if anyone
    pub fn sender_id(&self) -> Option<UserId> {
        match (&self.callback_query, &self.message) {
            (Some(query), _) => Some(query.from.id),
            (None, Some(message)) => message.from.as_ref().map(|u| u.id),
            (None, None) => None,
        }
    }

    /// Classify the update; `None` for anything the relay does not handle
    pub fn into_event(self) -> Option<Event> {
        if let Some(query) = self.callback_query {
            let action = decode_callback(query.data.as_deref()?)?;
            return Some(Event::Button {
                sender: Sender::from(&query.from),
                action,
            });
        }
        self.message?.into_event()
    }
}

impl Message {
    fn into_event(self) -> Option<Event> {
        // Only one-to-one chats with the bot are relayed
        if self.chat.kind != "private" {
            return None;
        }
        let sender = Sender::from(self.from.as_ref()?);

        if let Some(text) = self.text {
            return Some(match Command::parse(&text) {
                Some(command) => Event::Command { sender, command },
                None => Event::Text { sender, text },
            });
        }

        let media = self.media()?;
        Some(Event::Media { sender, media })
    }

    fn media(&self) -> Option<MediaRef> {
        // Photos arrive in several sizes; relay the largest
        let photo = self
            .photo
            .iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
            .map(|p| (MediaKind::Photo, &p.file_id));

        let (kind, file_id) = photo
            .or_else(|| self.video.as_ref().map(|f| (MediaKind::Video, &f.file_id)))
            .or_else(|| self.document.as_ref().map(|f| (MediaKind::Document, &f.file_id)))
            .or_else(|| self.audio.as_ref().map(|f| (MediaKind::Audio, &f.file_id)))
            .or_else(|| self.voice.as_ref().map(|f| (MediaKind::Voice, &f.file_id)))
            .or_else(|| self.sticker.as_ref().map(|f| (MediaKind::Sticker, &f.file_id)))?;

        let mut media = MediaRef::new(kind, file_id.clone());
        if kind.supports_caption() {
            media.caption.clone_from(&self.caption);
        }
        Some(media)
    }
}

// ============================================================================
// Callback data
// ============================================================================

pub fn encode_callback(action: ButtonAction) -> String {
    match action {
        ButtonAction::Reply(id) => format!("reply_{id}"),
        ButtonAction::Block(id) => format!("block_{id}"),
        ButtonAction::Unblock(id) => format!("unblock_{id}"),
        ButtonAction::CheckMembership => "check_membership".to_string(),
    }
}

pub fn decode_callback(data: &str) -> Option<ButtonAction> {
    if data == "check_membership" {
        return Some(ButtonAction::CheckMembership);
    }
    let (verb, id) = data.split_once('_')?;
    let id: UserId = id.parse().ok()?;
    match verb {
        "reply" => Some(ButtonAction::Reply(id)),
        "block" => Some(ButtonAction::Block(id)),
        "unblock" => Some(ButtonAction::Unblock(id)),
        _ => None,
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyboardButton {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReplyMarkup {
    Inline {
        inline_keyboard: Vec<Vec<InlineButton>>,
    },
    Keyboard {
        keyboard: Vec<Vec<KeyboardButton>>,
        one_time_keyboard: bool,
        resize_keyboard: bool,
    },
}

const QUICK_REPLIES_PER_ROW: usize = 2;

fn button_label(action: ButtonAction) -> String {
    match action {
        ButtonAction::Reply(_) => "Reply".to_string(),
        ButtonAction::Block(_) => "Block".to_string(),
        ButtonAction::Unblock(id) => format!("Unblock {id}"),
        ButtonAction::CheckMembership => "I've joined".to_string(),
    }
}

impl ReplyMarkup {
    /// Inline actions win over quick replies; a message carries one markup
    pub fn from_options(options: &SendOptions) -> Option<Self> {
        if !options.actions.is_empty() {
            let button = |action: ButtonAction| InlineButton {
                text: button_label(action),
                callback_data: encode_callback(action),
            };
            let (unblocks, shared): (Vec<ButtonAction>, Vec<ButtonAction>) = options
                .actions
                .iter()
                .copied()
                .partition(|a| matches!(a, ButtonAction::Unblock(_)));

            let mut rows = Vec::new();
            if !shared.is_empty() {
                rows.push(shared.into_iter().map(button).collect());
            }
            rows.extend(unblocks.into_iter().map(|a| vec![button(a)]));
            return Some(ReplyMarkup::Inline {
                inline_keyboard: rows,
            });
        }

        if options.quick_replies.is_empty() {
            return None;
        }
        let keyboard = options
            .quick_replies
            .chunks(QUICK_REPLIES_PER_ROW)
            .map(|row| {
                row.iter()
                    .map(|text| KeyboardButton { text: text.clone() })
                    .collect()
            })
            .collect();
        Some(ReplyMarkup::Keyboard {
            keyboard,
            one_time_keyboard: true,
            resize_keyboard: true,
        })
    }
}

/// Bot API method and file field for each media kind
pub(crate) fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Document => ("sendDocument", "document"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::Sticker => ("sendSticker", "sticker"),
    }
}
