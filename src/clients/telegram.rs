use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::config::{resilience as tuning, Config};
use crate::error::{AppError, Result};
use crate::resilience::Guard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Outbound messaging channel. `Ok` means the message was accepted.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: &str, html: &str, buttons: &[Vec<InlineButton>]) -> Result<()>;
}

/// Telegram Bot API `sendMessage` with HTML parse mode.
pub struct TelegramMessenger {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    guard: Arc<Guard>,
}

impl TelegramMessenger {
    pub fn new(cfg: &Config, guard: Arc<Guard>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(tuning::TELEGRAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_url: cfg.telegram_api_url.trim_end_matches('/').to_string(),
            token: cfg.telegram_bot_token.clone(),
            guard,
        })
    }
}

pub fn message_payload(chat_id: &str, html: &str, buttons: &[Vec<InlineButton>]) -> serde_json::Value {
    let mut payload = json!({
        "chat_id": chat_id,
        "text": html,
        "parse_mode": "HTML",
        "disable_web_page_preview": true,
    });
    if !buttons.is_empty() {
        payload["reply_markup"] = json!({ "inline_keyboard": buttons });
    }
    payload
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, chat_id: &str, html: &str, buttons: &[Vec<InlineButton>]) -> Result<()> {
        let Some(token) = self.token.as_deref() else {
            return Err(AppError::Config("TELEGRAM_BOT_TOKEN is not set".to_string()));
        };
        let url = format!("{}/bot{token}/sendMessage", self.api_url);
        let payload = message_payload(chat_id, html, buttons);
        let (client, url, payload) = (&self.client, url.as_str(), &payload);

        self.guard
            .call(|| async move {
                let response = client.post(url).json(payload).send().await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                if status.is_server_error() || status.as_u16() == 429 {
                    Err(AppError::Messaging(format!("sendMessage {status}: {body}")))
                } else {
                    // 4xx other than rate limiting will not succeed on retry.
                    Err(AppError::BadRequest(format!("sendMessage {status}: {body}")))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_html_and_optional_keyboard() {
        let plain = message_payload("42", "<b>hi</b>", &[]);
        assert_eq!(plain["parse_mode"], "HTML");
        assert!(plain.get("reply_markup").is_none());

        let buttons = vec![vec![InlineButton::new("Mute theme 24h", "mute:theme_alert:7:1440")]];
        let with = message_payload("42", "x", &buttons);
        assert_eq!(
            with["reply_markup"]["inline_keyboard"][0][0]["callback_data"],
            "mute:theme_alert:7:1440"
        );
    }
}
