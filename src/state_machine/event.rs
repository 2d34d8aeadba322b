//! Inbound events and the inputs the state machine consumes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform user identity
pub type UserId = i64;

/// Who sent an update
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Sender {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_name(mut self, first: impl Into<String>, last: Option<&str>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = last.map(String::from);
        self
    }

    /// One-line description: `ID 42 | @handle | First Last`
    pub fn describe(&self) -> String {
        describe_user(
            self.id,
            self.handle.as_deref(),
            self.first_name.as_deref(),
            self.last_name.as_deref(),
        )
    }
}

pub fn describe_user(
    id: UserId,
    handle: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> String {
    let mut out = format!("ID {id}");
    if let Some(handle) = handle {
        out.push_str(" | @");
        out.push_str(handle);
    }
    if let Some(first) = first_name {
        out.push_str(" | ");
        out.push_str(first);
    }
    if let Some(last) = last_name {
        out.push(' ');
        out.push_str(last);
    }
    out
}

// ============================================================================
// Content
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Sticker => "sticker",
        }
    }

    pub fn supports_caption(self) -> bool {
        !matches!(self, MediaKind::Sticker)
    }

    /// Whether a reply banner can ride in the caption; otherwise it goes
    /// out as a separate text first
    pub fn banner_in_caption(self) -> bool {
        !matches!(self, MediaKind::Voice | MediaKind::Sticker)
    }
}

/// Reference to media already hosted by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl MediaRef {
    pub fn new(kind: MediaKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// Something that can be relayed: a text body or a media reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Media(MediaRef),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Cancel,
    Other(String),
}

impl Command {
    /// Parse `/name@bot args`; `None` if the text is not a command
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix('/')?;
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default().to_lowercase();
        if name.is_empty() {
            return None;
        }
        Some(match name.as_str() {
            "start" => Command::Start,
            "cancel" => Command::Cancel,
            _ => Command::Other(name),
        })
    }
}

/// Actions attached to relayed messages and lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Reply(UserId),
    Block(UserId),
    Unblock(UserId),
    CheckMembership,
}

/// A classified inbound update
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Command { sender: Sender, command: Command },
    Text { sender: Sender, text: String },
    Media { sender: Sender, media: MediaRef },
    Button { sender: Sender, action: ButtonAction },
}

impl Event {
    pub fn sender(&self) -> &Sender {
        match self {
            Event::Command { sender, .. }
            | Event::Text { sender, .. }
            | Event::Media { sender, .. }
            | Event::Button { sender, .. } => sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Command { .. } => "command",
            Event::Text { .. } => "text",
            Event::Media { .. } => "media",
            Event::Button { .. } => "button",
        }
    }
}

/// Input to the owner's state machine
///
/// Platform events minus the sender, plus the outcome of target lookups the
/// runtime performs on the machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerInput {
    Command(Command),
    Text(String),
    Media(MediaRef),
    Button(ButtonAction),
    TargetResolved { user_id: UserId },
    TargetNotFound { selector: TargetSelector },
}

impl OwnerInput {
    pub fn from_event(event: Event) -> Self {
        match event {
            Event::Command { command, .. } => OwnerInput::Command(command),
            Event::Text { text, .. } => OwnerInput::Text(text),
            Event::Media { media, .. } => OwnerInput::Media(media),
            Event::Button { action, .. } => OwnerInput::Button(action),
        }
    }
}

// ============================================================================
// Parsed owner text
// ============================================================================

/// How the owner names a recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Id(UserId),
    Handle(String),
}

impl TargetSelector {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(handle) = text.strip_prefix('@') {
            let valid = !handle.is_empty()
                && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            return valid.then(|| TargetSelector::Handle(handle.to_string()));
        }
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
            return text.parse().ok().map(TargetSelector::Id);
        }
        None
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Id(id) => write!(f, "{id}"),
            TargetSelector::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

/// Owner menu directives and confirmation tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    SendToUser,
    Broadcast,
    UserList,
    BlockedList,
    Stats,
    Confirm,
    Cancel,
}

impl Directive {
    pub const MENU: [&'static str; 5] = ["send", "broadcast", "users", "blocked", "stats"];
    pub const CONFIRMATION: [&'static str; 2] = ["confirm", "cancel"];
    pub const CANCEL: [&'static str; 1] = ["cancel"];

    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.trim().trim_start_matches('/').to_lowercase();
        match normalized.as_str() {
            "send" | "send to user" | "message user" => Some(Directive::SendToUser),
            "broadcast" => Some(Directive::Broadcast),
            "users" | "user list" => Some(Directive::UserList),
            "blocked" | "block list" => Some(Directive::BlockedList),
            "stats" | "statistics" => Some(Directive::Stats),
            "confirm" | "yes" => Some(Directive::Confirm),
            "cancel" => Some(Directive::Cancel),
            _ => None,
        }
    }
}

pub fn is_cancel(text: &str) -> bool {
    Directive::parse(text) == Some(Directive::Cancel)
}
