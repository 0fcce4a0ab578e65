use crate::types::{ReleaseInfo, RepositoryIdentity};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::time::Duration;

// Release source port

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceErrorKind {
    RateLimited,
    NotFound,
    Transient,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: SourceErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == SourceErrorKind::RateLimited
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SourceError {}

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest published release of `identity`; `Ok(None)` when it has none.
    async fn latest_release(&self, identity: &RepositoryIdentity) -> Result<Option<ReleaseInfo>, SourceError>;
}

// Notification channel port

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    RateLimited,
    Transient,
    Rejected,
    /// The provider gave no usable status; only the message text is known.
    Unclassified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub message: String,
    /// Provider hint for how long to stay away.
    pub retry_after: Option<Duration>,
}

impl DeliveryError {
    pub fn new(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: DeliveryErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    /// An error known only by its text.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::Unclassified, message)
    }

    /// The structured kind decides; message text is consulted only for
    /// unclassified errors.
    pub fn is_rate_limited(&self) -> bool {
        match self.kind {
            DeliveryErrorKind::RateLimited => true,
            DeliveryErrorKind::Unclassified => looks_rate_limited(&self.message),
            DeliveryErrorKind::Transient | DeliveryErrorKind::Rejected => false,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DeliveryError {}

/// An outbound notification channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable channel name used in logs, metrics and errors.
    fn name(&self) -> &str;

    /// Cooldown the provider documents after it throttles a sender.
    fn throttle_cooldown(&self) -> Duration;

    /// Delivers one rendered release message.
    async fn deliver(&self, release: &ReleaseInfo, body: &str) -> Result<(), DeliveryError>;
}

static RATE_LIMIT_SIGNATURES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|频率超过限制|速率限制")
        .expect("rate limit signature pattern compiles")
});

/// Known provider phrases that signal throttling.
pub fn looks_rate_limited(text: &str) -> bool {
    RATE_LIMIT_SIGNATURES.is_match(text)
}
