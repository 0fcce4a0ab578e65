//! DingTalk custom robot channel.

use crate::app::ports::{DeliveryError, DeliveryErrorKind, NotificationChannel};
use crate::config::DingTalkConfig;
use crate::constants::{DINGTALK_CHANNEL, DINGTALK_RATE_LIMIT_ERRCODE};
use crate::error::{NotifyError, Result};
use crate::infra::http_client::{body_snippet, build_http_client, is_transient, retry_after};
use crate::types::ReleaseInfo;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
struct MarkdownMessage<'a> {
    msgtype: &'static str,
    markdown: MarkdownBody<'a>,
}

#[derive(Debug, Serialize)]
struct MarkdownBody<'a> {
    title: String,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct RobotResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct DingTalkChannel {
    http: reqwest::Client,
    webhook: Url,
    secret: Option<String>,
    cooldown: Duration,
}

impl DingTalkChannel {
    pub fn new(config: &DingTalkConfig) -> Result<Self> {
        let webhook = Url::parse(config.webhook_url.trim())
            .map_err(|e| NotifyError::Config(format!("Invalid DingTalk webhook_url: {}", e)))?;
        let secret = config.secret.trim();
        Ok(Self {
            http: build_http_client()?,
            webhook,
            secret: (!secret.is_empty()).then(|| secret.to_string()),
            cooldown: config.cooldown,
        })
    }

    /// Webhook URL with `timestamp` and `sign` appended when a secret is set.
    fn request_url(&self, timestamp_ms: i64) -> Url {
        let mut url = self.webhook.clone();
        if let Some(secret) = &self.secret {
            url.query_pairs_mut()
                .append_pair("timestamp", &timestamp_ms.to_string())
                .append_pair("sign", &sign(secret, timestamp_ms));
        }
        url
    }
}

/// base64(HMAC-SHA256(secret, "{timestamp}\n{secret}")).
pub fn sign(secret: &str, timestamp_ms: i64) -> String {
    // HMAC takes keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}\n{}", timestamp_ms, secret).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn classify_response(status: StatusCode, retry_hint: Option<Duration>, body: &str) -> std::result::Result<(), DeliveryError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(DeliveryError::rate_limited("DingTalk returned 429 Too Many Requests", retry_hint));
    }
    if !status.is_success() {
        let kind = if status.is_server_error() {
            DeliveryErrorKind::Transient
        } else {
            DeliveryErrorKind::Rejected
        };
        return Err(DeliveryError::new(kind, format!("DingTalk request failed with status {}", status)));
    }

    let response: RobotResponse = serde_json::from_str(body)
        .map_err(|_| DeliveryError::unclassified(format!("unreadable DingTalk response: {}", body_snippet(body))))?;
    match response.errcode {
        0 => Ok(()),
        DINGTALK_RATE_LIMIT_ERRCODE => Err(DeliveryError::rate_limited(
            format!("DingTalk robot rate limit exceeded: {}", response.errmsg),
            retry_hint,
        )),
        code => Err(DeliveryError::new(
            DeliveryErrorKind::Rejected,
            format!("DingTalk API error {}: {}", code, response.errmsg),
        )),
    }
}

#[async_trait]
impl NotificationChannel for DingTalkChannel {
    fn name(&self) -> &str {
        DINGTALK_CHANNEL
    }

    fn throttle_cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn deliver(&self, release: &ReleaseInfo, body: &str) -> std::result::Result<(), DeliveryError> {
        let message = MarkdownMessage {
            msgtype: "markdown",
            markdown: MarkdownBody {
                title: format!("{} released {}", release.identity, release.tag_name),
                text: body,
            },
        };
        let url = self.request_url(chrono::Utc::now().timestamp_millis());

        let resp = self.http.post(url).json(&message).send().await.map_err(|e| {
            let kind = if is_transient(&e) {
                DeliveryErrorKind::Transient
            } else {
                DeliveryErrorKind::Rejected
            };
            // Strip the URL, it embeds the access token and signature
            DeliveryError::new(kind, format!("DingTalk request failed: {}", e.without_url()))
        })?;
        let status = resp.status();
        let hint = retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        debug!(%status, "DingTalk responded");
        classify_response(status, hint, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(secret: &str) -> DingTalkChannel {
        let config = DingTalkConfig {
            enabled: true,
            webhook_url: "https://oapi.dingtalk.com/robot/send?access_token=abc".to_string(),
            secret: secret.to_string(),
            ..DingTalkConfig::default()
        };
        DingTalkChannel::new(&config).unwrap()
    }

    #[test]
    fn test_sign_is_stable_base64() {
        let a = sign("SEC123", 1_700_000_000_000);
        let b = sign("SEC123", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_ne!(a, sign("SEC123", 1_700_000_000_001));
        // SHA-256 digest is 32 bytes
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_request_url_signing() {
        let url = channel("").request_url(1);
        assert_eq!(url.as_str(), "https://oapi.dingtalk.com/robot/send?access_token=abc");

        let url = channel("SEC123").request_url(1_700_000_000_000);
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(pairs[0], ("access_token".to_string(), "abc".to_string()));
        assert_eq!(pairs[1], ("timestamp".to_string(), "1700000000000".to_string()));
        assert_eq!(pairs[2].0, "sign");
        assert_eq!(pairs[2].1, sign("SEC123", 1_700_000_000_000));
    }

    #[test]
    fn test_invalid_webhook_is_config_error() {
        let config = DingTalkConfig {
            webhook_url: "not a url".to_string(),
            ..DingTalkConfig::default()
        };
        assert!(matches!(DingTalkChannel::new(&config), Err(NotifyError::Config(_))));
    }

    #[test]
    fn test_classify_response() {
        assert!(classify_response(StatusCode::OK, None, r#"{"errcode":0,"errmsg":"ok"}"#).is_ok());

        let err = classify_response(StatusCode::OK, None, r#"{"errcode":88,"errmsg":"send too fast"}"#).unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::RateLimited);

        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(30)), "").unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));

        let err = classify_response(StatusCode::OK, None, r#"{"errcode":310000,"errmsg":"sign not match"}"#).unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Rejected);
        assert!(!err.is_rate_limited());

        let err = classify_response(StatusCode::SERVICE_UNAVAILABLE, None, "").unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Transient);

        let err = classify_response(StatusCode::OK, None, "<html>访问频率超过限制</html>").unwrap_err();
        assert_eq!(err.kind, DeliveryErrorKind::Unclassified);
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_transport_error_hides_webhook_token() {
        let config = DingTalkConfig {
            enabled: true,
            webhook_url: "http://127.0.0.1:1/robot/send?access_token=SECRETTOKEN".to_string(),
            secret: "SEC123".to_string(),
            ..DingTalkConfig::default()
        };
        let channel = DingTalkChannel::new(&config).unwrap();
        let release = ReleaseInfo {
            identity: crate::types::RepositoryIdentity::new("a", "b"),
            tag_name: "v1".to_string(),
            display_name: "v1".to_string(),
            description: None,
            url: "https://github.com/a/b/releases/tag/v1".to_string(),
            published_at: chrono::Utc::now(),
        };

        let err = channel.deliver(&release, "body").await.unwrap_err();
        assert!(!err.message.contains("SECRETTOKEN"), "{}", err.message);
        assert!(!err.message.contains("sign="), "{}", err.message);
        assert!(!err.is_rate_limited());
    }
}
