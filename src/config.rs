use crate::constants;
use crate::error::{NotifyError, Result};
use crate::ledger::Ledger;
use crate::pipeline::{DispatchSettings, FetchSettings};
use crate::rate_limiter::RateModel;
use crate::template::Template;
use crate::types::RepositoryIdentity;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GithubConfig,
    pub notifications: NotificationsConfig,
    /// Message template; the built-in one when empty.
    pub template: String,
    pub schedule: ScheduleConfig,
    pub fetch: FetchConfig,
    pub dispatch: DispatchConfig,
    /// Ledger snapshot location; `$HOME/.notify/state.json` when unset.
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub token: String,
    pub repos: Vec<RepoConfig>,
    /// Watch the authenticated user's own repositories.
    pub auto_watch_user: bool,
    pub watch_starred: bool,
    pub watch_orgs: Vec<String>,
    /// Drop discovered repositories that have never published a release.
    pub only_with_releases: bool,
    pub check_days: i64,
    pub show_description: bool,
}

impl GithubConfig {
    /// Explicitly listed repositories, in file order.
    pub fn configured_repositories(&self) -> Vec<RepositoryIdentity> {
        self.repos.iter().map(RepoConfig::identity).collect()
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            repos: Vec::new(),
            auto_watch_user: false,
            watch_starred: false,
            watch_orgs: Vec::new(),
            only_with_releases: false,
            check_days: constants::DEFAULT_CHECK_DAYS,
            show_description: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,
}

impl RepoConfig {
    pub fn identity(&self) -> RepositoryIdentity {
        RepositoryIdentity::new(self.owner.trim(), self.name.trim())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub dingtalk: DingTalkConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DingTalkConfig {
    pub enabled: bool,
    pub webhook_url: String,
    /// Signing secret; unsigned requests when empty.
    pub secret: String,
    pub window_limit: u32,
    #[serde(deserialize_with = "duration_str")]
    pub window: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub cooldown: Duration,
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            secret: String::new(),
            window_limit: constants::DINGTALK_WINDOW_LIMIT,
            window: constants::DINGTALK_WINDOW,
            cooldown: constants::DINGTALK_COOLDOWN,
        }
    }
}

impl DingTalkConfig {
    pub fn rate_model(&self) -> RateModel {
        RateModel::SlidingWindow {
            limit: self.window_limit.max(1),
            window: self.window,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    #[serde(deserialize_with = "duration_str")]
    pub interval: Duration,
    pub burst: u32,
    #[serde(deserialize_with = "duration_str")]
    pub cooldown: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            interval: constants::TELEGRAM_INTERVAL,
            burst: constants::TELEGRAM_BURST,
            cooldown: constants::TELEGRAM_COOLDOWN,
        }
    }
}

impl TelegramConfig {
    pub fn rate_model(&self) -> RateModel {
        RateModel::TokenBucket {
            interval: self.interval,
            burst: self.burst.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Run as a watcher when no subcommand is given.
    pub enabled: bool,
    /// e.g. "30m", "6h"; defaults to six hours.
    pub interval: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    #[serde(deserialize_with = "duration_str")]
    pub batch_pause: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: constants::DEFAULT_FETCH_CONCURRENCY,
            batch_size: constants::DEFAULT_FETCH_BATCH_SIZE,
            batch_pause: constants::DEFAULT_FETCH_BATCH_PAUSE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    #[serde(deserialize_with = "duration_str")]
    pub batch_pause: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub delivery_pause: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub acquire_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: constants::DEFAULT_DISPATCH_BATCH_SIZE,
            batch_pause: constants::DEFAULT_DISPATCH_BATCH_PAUSE,
            delivery_pause: constants::DEFAULT_DELIVERY_PAUSE,
            acquire_timeout: constants::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from `./config.toml` and then
    /// `$HOME/.notify/config.toml`. A missing file means defaults; an
    /// unreadable or malformed one is an error. `.env` and the process
    /// environment are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::search_paths().into_iter().find(|p| p.is_file()) {
                Some(found) => Self::from_file(&found)?,
                None => {
                    info!("No config file found, using defaults and environment");
                    Config::default()
                }
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| NotifyError::Config(format!("Failed to read config file '{}': {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".notify").join("config.toml"));
        }
        paths
    }

    /// Environment values win over the file. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = v;
        }
        if let Some(v) = get("DINGTALK_WEBHOOK") {
            self.notifications.dingtalk.webhook_url = v;
        }
        if let Some(v) = get("DINGTALK_SECRET") {
            self.notifications.dingtalk.secret = v;
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.notifications.telegram.bot_token = v;
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.notifications.telegram.chat_id = v;
        }
        if let Some(v) = get("SCHEDULE_INTERVAL") {
            self.schedule.interval = v;
        }
        if let Some(v) = get("CHECK_DAYS") {
            match v.parse() {
                Ok(days) => self.github.check_days = days,
                Err(_) => warn!("Ignoring CHECK_DAYS='{}': not a number", v),
            }
        }
        if let Some(v) = get("NOTIFY_STATE_FILE") {
            self.state_file = Some(PathBuf::from(v));
        }
    }

    /// Fills defaults and disables channels that lack credentials. Fails
    /// only on values that cannot be used at all.
    pub fn validate(&mut self) -> Result<()> {
        if self.github.check_days <= 0 {
            self.github.check_days = constants::DEFAULT_CHECK_DAYS;
        }
        if self.github.check_days > constants::MAX_CHECK_DAYS {
            return Err(NotifyError::Config(format!(
                "check_days {} exceeds the maximum of {}",
                self.github.check_days,
                constants::MAX_CHECK_DAYS
            )));
        }
        if self.schedule.interval.trim().is_empty() {
            self.schedule.interval = constants::DEFAULT_SCHEDULE_INTERVAL.to_string();
        }
        self.schedule_interval()?;
        self.template()?;

        for repo in &self.github.repos {
            if repo.owner.trim().is_empty() || repo.name.trim().is_empty() {
                return Err(NotifyError::Config(format!(
                    "Repository entry '{}/{}' needs both owner and name",
                    repo.owner, repo.name
                )));
            }
        }

        if self.github.token.is_empty() {
            warn!("No GitHub token configured; unauthenticated requests are limited to 60 per hour");
        }

        let dingtalk = &mut self.notifications.dingtalk;
        if dingtalk.enabled && dingtalk.webhook_url.is_empty() {
            warn!("DingTalk is enabled but has no webhook_url; channel disabled");
            dingtalk.enabled = false;
        }
        let telegram = &mut self.notifications.telegram;
        if telegram.enabled && (telegram.bot_token.is_empty() || telegram.chat_id.is_empty()) {
            warn!("Telegram is enabled but bot_token or chat_id is missing; channel disabled");
            telegram.enabled = false;
        }
        Ok(())
    }

    pub fn template(&self) -> Result<Template> {
        if self.template.trim().is_empty() {
            return Ok(Template::default());
        }
        Template::parse(&self.template).map_err(|e| NotifyError::Config(format!("Invalid template: {}", e)))
    }

    pub fn schedule_interval(&self) -> Result<Duration> {
        let raw = if self.schedule.interval.trim().is_empty() {
            constants::DEFAULT_SCHEDULE_INTERVAL
        } else {
            self.schedule.interval.as_str()
        };
        match parse_duration(raw) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => Err(NotifyError::Config(format!("Invalid schedule interval '{}'", raw))),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(Ledger::default_path)
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            freshness_window: chrono::Duration::days(self.github.check_days.clamp(1, constants::MAX_CHECK_DAYS)),
            concurrency_limit: self.fetch.concurrency.max(1),
            batch_size: self.fetch.batch_size.max(1),
            batch_pause: self.fetch.batch_pause,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            batch_size: self.dispatch.batch_size.max(1),
            batch_pause: self.dispatch.batch_pause,
            delivery_pause: self.dispatch.delivery_pause,
            acquire_timeout: self.dispatch.acquire_timeout,
        }
    }
}

/// Parses "500ms", "30s", "10m", "6h", "1d" and sums like "1h30m".
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            "d" => Duration::from_secs(value.checked_mul(86_400)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

fn duration_str<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}'", raw)))
}
