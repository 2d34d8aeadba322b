//! Bot API client over HTTPS

use super::types::{media_method, ApiResponse, ChatMember, ReplyMarkup, Update, User};
use super::{TransportError, TransportErrorKind};
use crate::runtime::{ChatMemberStatus, SendOptions, Transport};
use crate::state_machine::{MediaRef, UserId};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Headroom over the long-poll timeout before the HTTP layer gives up
const REQUEST_GRACE: Duration = Duration::from_secs(15);

const ALLOWED_UPDATES: [&str; 2] = ["message", "callback_query"];

pub struct TelegramClient {
    client: Client,
    /// `{api_base}/bot{token}`; never logged
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: &str, api_base: &str, poll_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(poll_timeout + REQUEST_GRACE)
            .build()
            .map_err(|e| TransportError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        })
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, TransportError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                if e.is_timeout() {
                    TransportError::timeout(format!("{method} timed out: {e}"))
                } else if e.is_connect() {
                    TransportError::network(format!("Connection failed: {e}"))
                } else {
                    TransportError::network(format!("{method} failed: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::network(format!("Failed to read response: {}", e.without_url())))?;

        parse_response(method, status, &body)
    }

    /// Identity of the bot the token belongs to; doubles as a token check
    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", &json!({})).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let mut params = json!({
            "timeout": timeout.as_secs(),
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(offset) = offset {
            params["offset"] = Value::from(offset);
        }
        self.call("getUpdates", &params).await
    }

    /// Stop the client's spinner on a pressed button
    pub async fn answer_callback_query(&self, callback_id: &str) -> Result<(), TransportError> {
        let _: bool = self
            .call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(
        &self,
        dest: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let mut params = Map::new();
        params.insert("chat_id".to_string(), Value::from(dest));
        params.insert("text".to_string(), Value::from(text));
        insert_markup(&mut params, options)?;

        let _: IgnoredAny = self.call("sendMessage", &params).await?;
        tracing::debug!(dest, "Sent text");
        Ok(())
    }

    async fn send_media(
        &self,
        dest: UserId,
        media: &MediaRef,
        caption: Option<&str>,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let (method, field) = media_method(media.kind);
        let mut params = Map::new();
        params.insert("chat_id".to_string(), Value::from(dest));
        params.insert(field.to_string(), Value::from(media.file_id.as_str()));
        if let Some(caption) = caption.filter(|_| media.kind.supports_caption()) {
            params.insert("caption".to_string(), Value::from(caption));
        }
        insert_markup(&mut params, options)?;

        let _: IgnoredAny = self.call(method, &params).await?;
        tracing::debug!(dest, kind = media.kind.as_str(), "Sent media");
        Ok(())
    }

    async fn get_chat_member_status(
        &self,
        channel: &str,
        user_id: UserId,
    ) -> Result<ChatMemberStatus, TransportError> {
        let member: ChatMember = self
            .call("getChatMember", &json!({ "chat_id": channel, "user_id": user_id }))
            .await?;
        Ok(ChatMemberStatus::parse(&member.status))
    }
}

fn insert_markup(params: &mut Map<String, Value>, options: &SendOptions) -> Result<(), TransportError> {
    if let Some(markup) = ReplyMarkup::from_options(options) {
        let markup = serde_json::to_value(markup)
            .map_err(|e| TransportError::invalid_request(format!("Bad reply markup: {e}")))?;
        params.insert("reply_markup".to_string(), markup);
    }
    Ok(())
}

/// Unwrap the API envelope, classifying failures
fn parse_response<R: DeserializeOwned>(
    method: &str,
    status: u16,
    body: &str,
) -> Result<R, TransportError> {
    let envelope: ApiResponse<R> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => {
            return Err(TransportError::unknown(format!(
                "{method}: failed to parse response: {e}"
            )));
        }
        Err(_) => {
            return Err(TransportError::new(
                TransportErrorKind::from_status(status),
                format!("{method}: HTTP {status}: {body}"),
            ));
        }
    };

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| TransportError::unknown(format!("{method}: response has no result")));
    }

    let code = envelope.error_code.unwrap_or(status);
    let description = envelope
        .description
        .unwrap_or_else(|| "no description".to_string());
    let mut err = TransportError::new(
        TransportErrorKind::from_status(code),
        format!("{method}: {code} {description}"),
    );
    if let Some(retry_after) = envelope.parameters.and_then(|p| p.retry_after) {
        err = err.with_retry_after(Duration::from_secs(retry_after));
    }
    Err(err)
}
