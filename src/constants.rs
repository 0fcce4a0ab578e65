//! Defaults shared by configuration and the pipeline.
//!
//! Channel limits are the providers' documented budgets; local pacing sits
//! safely below them.

use std::time::Duration;

pub const DEFAULT_CHECK_DAYS: i64 = 3;
pub const MAX_CHECK_DAYS: i64 = 3650;
pub const DEFAULT_SCHEDULE_INTERVAL: &str = "6h";

// Fetch side: GitHub secondary limits punish bursts more than volume
pub const DEFAULT_FETCH_CONCURRENCY: usize = 10;
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 100;
pub const DEFAULT_FETCH_BATCH_PAUSE: Duration = Duration::from_secs(1);
pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const GITHUB_LOW_QUOTA_WARNING: u64 = 50;

// Dispatch side
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 10;
pub const DEFAULT_DISPATCH_BATCH_PAUSE: Duration = Duration::from_secs(2);
pub const DEFAULT_DELIVERY_PAUSE: Duration = Duration::from_millis(500);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// DingTalk robot: 20 messages per minute, 10 minute ban once exceeded
pub const DINGTALK_CHANNEL: &str = "dingtalk";
pub const DINGTALK_WINDOW_LIMIT: u32 = 20;
pub const DINGTALK_WINDOW: Duration = Duration::from_secs(60);
pub const DINGTALK_COOLDOWN: Duration = Duration::from_secs(10 * 60);
pub const DINGTALK_RATE_LIMIT_ERRCODE: i64 = 88;

// Telegram bot: about one message per second per chat
pub const TELEGRAM_CHANNEL: &str = "telegram";
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const TELEGRAM_INTERVAL: Duration = Duration::from_secs(1);
pub const TELEGRAM_BURST: u32 = 3;
pub const TELEGRAM_COOLDOWN: Duration = Duration::from_secs(60);

/// Extra wait in watch mode after a run that hit a channel rate limit.
pub const RATE_LIMITED_RUN_BACKOFF: Duration = DINGTALK_COOLDOWN;

pub const DEFAULT_TEMPLATE: &str = "## 📦 New release\n\n\
**Repository**: {{repository}}\n\n\
**Version**: {{tag}}\n\n\
**Published**: {{published_at}}\n\n\
{{description}}\n\n\
**[View release]({{url}})**";
