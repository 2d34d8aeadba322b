//! Telegram Bot API adapter
//!
//! Implements the runtime's `Transport` over HTTPS and turns long-polled
//! updates into core events.

mod client;
mod error;
mod poller;
mod types;

pub use client::TelegramClient;
pub use error::{TransportError, TransportErrorKind};
pub use poller::run_poller;
