//! Telegram bot channel.

use crate::app::ports::{DeliveryError, DeliveryErrorKind, NotificationChannel};
use crate::config::TelegramConfig;
use crate::constants::{TELEGRAM_API_URL, TELEGRAM_CHANNEL};
use crate::error::Result;
use crate::infra::http_client::{body_snippet, build_http_client, is_transient, retry_after};
use crate::types::ReleaseInfo;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: String,
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

pub struct TelegramChannel {
    http: reqwest::Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
    cooldown: Duration,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            api_url: TELEGRAM_API_URL.to_string(),
            bot_token: config.bot_token.trim().to_string(),
            chat_id: config.chat_id.trim().to_string(),
            cooldown: config.cooldown,
        })
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_url, self.bot_token)
    }
}

fn classify_response(status: StatusCode, header_hint: Option<Duration>, body: &str) -> std::result::Result<(), DeliveryError> {
    let parsed: Option<BotResponse> = serde_json::from_str(body).ok();
    let hint = parsed
        .as_ref()
        .and_then(|r| r.parameters.as_ref())
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs)
        .or(header_hint);

    let api_code = parsed.as_ref().and_then(|r| r.error_code);
    if status == StatusCode::TOO_MANY_REQUESTS || api_code == Some(429) {
        let detail = parsed.as_ref().map(|r| r.description.as_str()).unwrap_or("");
        return Err(DeliveryError::rate_limited(
            format!("Telegram too many requests {}", detail).trim_end().to_string(),
            hint,
        ));
    }

    match parsed {
        Some(response) if status.is_success() && response.ok => Ok(()),
        Some(response) => Err(DeliveryError::new(
            if status.is_server_error() {
                DeliveryErrorKind::Transient
            } else {
                DeliveryErrorKind::Rejected
            },
            format!(
                "Telegram API error {}: {}",
                response.error_code.unwrap_or(status.as_u16()),
                response.description
            ),
        )),
        None if status.is_server_error() => Err(DeliveryError::new(
            DeliveryErrorKind::Transient,
            format!("Telegram request failed with status {}", status),
        )),
        None => Err(DeliveryError::unclassified(format!(
            "unreadable Telegram response (status {}): {}",
            status,
            body_snippet(body)
        ))),
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        TELEGRAM_CHANNEL
    }

    fn throttle_cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn deliver(&self, _release: &ReleaseInfo, body: &str) -> std::result::Result<(), DeliveryError> {
        let message = SendMessage {
            chat_id: &self.chat_id,
            text: body,
            parse_mode: "Markdown",
        };
        let resp = self
            .http
            .post(self.send_message_url())
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                let kind = if is_transient(&e) {
                    DeliveryErrorKind::Transient
                } else {
                    DeliveryErrorKind::Rejected
                };
                // Strip the URL, it embeds the bot token
                DeliveryError::new(kind, format!("Telegram request failed: {}", e.without_url()))
            })?;
        let status = resp.status();
        let hint = retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        debug!(%status, "Telegram responded");
        classify_response(status, hint, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_url() {
        let config = TelegramConfig {
            bot_token: " 123:abc ".to_string(),
            chat_id: "-100".to_string(),
            ..TelegramConfig::default()
        };
        let channel = TelegramChannel::new(&config).unwrap();
        assert_eq!(channel.send_message_url(), "https://api.telegram.org/bot123:abc/sendMessage");
        assert_eq!(channel.throttle_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_classify_success() {
        assert!(classify_response(StatusCode::OK, None, r#"{"ok":true,"result":{}}"#).is_ok());
    }

    #[test]
    fn test_classify_rate_limited_with_retry_after() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 35","parameters":{"retry_after":35}}"#;
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, None, body).unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(35)));

        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(5)), "").unwrap_err();
        assert_eq!(err.retry_after, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_classify_rejections() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let err = classify_response(StatusCode::BAD_REQUEST, None, body).unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Rejected);
        assert!(err.message.contains("chat not found"));
        assert!(!err.is_rate_limited());

        let err = classify_response(StatusCode::BAD_GATEWAY, None, "<html>").unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Transient);
    }

    #[test]
    fn test_parse_error_mentioning_429_is_not_a_throttle() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 429"}"#;
        let err = classify_response(StatusCode::BAD_REQUEST, None, body).unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Rejected);
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_unreadable_body_falls_back_to_text() {
        let err = classify_response(StatusCode::FORBIDDEN, None, "Too Many Requests").unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Unclassified);
        assert!(err.is_rate_limited());
    }
}
