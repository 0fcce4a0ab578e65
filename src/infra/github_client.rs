//! GitHub REST client: latest releases, quota status and repository discovery.

use crate::app::ports::{ReleaseSource, SourceError, SourceErrorKind};
use crate::config::GithubConfig;
use crate::constants::{GITHUB_API_URL, GITHUB_LOW_QUOTA_WARNING};
use crate::error::{NotifyError, Result};
use crate::infra::http_client::{build_http_client, is_transient, retry_after};
use crate::types::{dedupe_identities, ReleaseInfo, RepositoryIdentity};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

const PER_PAGE: usize = 100;
const DISCOVERY_CONCURRENCY: usize = 20;
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    name: Option<String>,
    body: Option<String>,
    html_url: String,
    published_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GithubOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubRepo {
    name: String,
    owner: GithubOwner,
    #[serde(default)]
    fork: bool,
}

impl GithubRepo {
    fn identity(&self) -> RepositoryIdentity {
        RepositoryIdentity::new(self.owner.login.clone(), self.name.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the quota resets.
    pub reset: i64,
}

impl RateLimitStatus {
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.reset, 0).single()
    }
}

#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    show_description: bool,
}

impl GithubClient {
    pub fn new(token: &str, show_description: bool) -> Result<Self> {
        let token = token.trim();
        Ok(Self {
            http: build_http_client()?,
            api_url: GITHUB_API_URL.to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
            show_description,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, SourceError> {
        let resp = self.get(path).send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &body, Utc::now().timestamp()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| SourceError::new(SourceErrorKind::Other, format!("invalid response from {}: {}", path, e)))
    }

    /// Current core quota. Logs a warning when it is nearly spent.
    pub async fn rate_limit_status(&self) -> Result<RateLimitStatus> {
        let response: RateLimitResponse = self
            .get_json("/rate_limit")
            .await
            .map_err(|e| NotifyError::Api { message: e.to_string() })?;
        let status = response.resources.core;
        let reset = status
            .reset_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();
        info!("GitHub API quota {}/{}, resets at {}", status.remaining, status.limit, reset);
        if status.remaining < GITHUB_LOW_QUOTA_WARNING {
            warn!("GitHub API quota is low: only {} requests left", status.remaining);
        }
        Ok(status)
    }

    async fn list_pages(&self, path: &str) -> std::result::Result<Vec<GithubRepo>, SourceError> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut all = Vec::new();
        for page in 1.. {
            let url = format!("{}{}per_page={}&page={}", path, separator, PER_PAGE, page);
            let repos: Vec<GithubRepo> = self.get_json(&url).await?;
            let last = repos.len() < PER_PAGE;
            all.extend(repos);
            if last {
                break;
            }
        }
        Ok(all)
    }

    /// Non-fork repositories owned by the authenticated user.
    pub async fn user_repositories(&self) -> std::result::Result<Vec<RepositoryIdentity>, SourceError> {
        let repos = self.list_pages("/user/repos?type=owner").await?;
        Ok(repos.iter().filter(|r| !r.fork).map(GithubRepo::identity).collect())
    }

    pub async fn starred_repositories(&self) -> std::result::Result<Vec<RepositoryIdentity>, SourceError> {
        let repos = self.list_pages("/user/starred").await?;
        Ok(repos.iter().map(GithubRepo::identity).collect())
    }

    pub async fn org_repositories(&self, org: &str) -> std::result::Result<Vec<RepositoryIdentity>, SourceError> {
        let repos = self.list_pages(&format!("/orgs/{}/repos", org)).await?;
        Ok(repos.iter().map(|r| RepositoryIdentity::new(org, r.name.clone())).collect())
    }

    /// Keeps repositories whose latest-release lookup is anything but a 404.
    /// Lookup errors keep the repository; the regular check reports them.
    pub async fn filter_with_releases(&self, repos: Vec<RepositoryIdentity>) -> Vec<RepositoryIdentity> {
        if repos.is_empty() {
            return repos;
        }
        info!("Checking {} repositories for published releases", repos.len());
        let semaphore = Arc::new(Semaphore::new(DISCOVERY_CONCURRENCY));
        let mut workers = JoinSet::new();
        for (index, identity) in repos.iter().cloned().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let client = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                let keep = client.has_any_release(&identity).await;
                (index, keep)
            });
        }

        let mut keep = vec![false; repos.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, true)) => keep[index] = true,
                Ok(_) => {}
                Err(e) => warn!("Release filter task failed: {}", e),
            }
        }
        let filtered: Vec<_> = repos.into_iter().zip(keep).filter(|(_, k)| *k).map(|(r, _)| r).collect();
        info!("{} repositories have releases", filtered.len());
        filtered
    }

    async fn has_any_release(&self, identity: &RepositoryIdentity) -> bool {
        let path = format!("/repos/{}/{}/releases/latest", identity.owner, identity.name);
        match self.get(&path).send().await {
            Ok(resp) => resp.status() != StatusCode::NOT_FOUND,
            Err(_) => true,
        }
    }

    /// Resolves the configured repositories plus everything discovery adds.
    /// Discovery failures are logged and skipped.
    #[instrument(skip_all)]
    pub async fn resolve_repositories(&self, config: &GithubConfig) -> Vec<RepositoryIdentity> {
        let mut repos = config.configured_repositories();

        let mut discovered = Vec::new();
        if config.auto_watch_user {
            match self.user_repositories().await {
                Ok(found) => {
                    info!("Found {} user repositories", found.len());
                    discovered.extend(found);
                }
                Err(e) => warn!("Failed to list user repositories: {}", e),
            }
        }
        if config.watch_starred {
            match self.starred_repositories().await {
                Ok(found) => {
                    info!("Found {} starred repositories", found.len());
                    discovered.extend(found);
                }
                Err(e) => warn!("Failed to list starred repositories: {}", e),
            }
        }
        for org in &config.watch_orgs {
            match self.org_repositories(org).await {
                Ok(found) => {
                    info!("Found {} repositories in organization {}", found.len(), org);
                    discovered.extend(found);
                }
                Err(e) => warn!("Failed to list repositories of organization {}: {}", org, e),
            }
        }

        let mut discovered = dedupe_identities(&discovered);
        discovered.retain(|r| !repos.contains(r));
        if config.only_with_releases {
            discovered = self.filter_with_releases(discovered).await;
        }
        repos.extend(discovered);
        dedupe_identities(&repos)
    }
}

#[async_trait]
impl ReleaseSource for GithubClient {
    async fn latest_release(&self, identity: &RepositoryIdentity) -> std::result::Result<Option<ReleaseInfo>, SourceError> {
        let path = format!("/repos/{}/{}/releases/latest", identity.owner, identity.name);
        let release: GithubRelease = match self.get_json(&path).await {
            Ok(release) => release,
            Err(e) if e.kind == SourceErrorKind::NotFound => {
                debug!("{} has no releases", identity);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(into_release_info(identity, release, self.show_description)))
    }
}

fn into_release_info(identity: &RepositoryIdentity, release: GithubRelease, show_description: bool) -> ReleaseInfo {
    let display_name = release
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| release.tag_name.clone());
    let description = if show_description {
        release.body.filter(|b| !b.trim().is_empty())
    } else {
        None
    };
    ReleaseInfo {
        identity: identity.clone(),
        tag_name: release.tag_name,
        display_name,
        description,
        url: release.html_url,
        // Undated releases count as stale rather than fresh
        published_at: release
            .published_at
            .or(release.created_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    let kind = if is_transient(&err) {
        SourceErrorKind::Transient
    } else {
        SourceErrorKind::Other
    };
    SourceError::new(kind, err.to_string())
}

/// Maps a non-success GitHub response onto a source error kind.
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str, now_unix: i64) -> SourceError {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
    let quota_spent = header(RATE_LIMIT_REMAINING) == Some("0");
    let mentions_limit = body.to_ascii_lowercase().contains("rate limit");

    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (quota_spent || mentions_limit));
    if throttled {
        let hint = retry_after(headers).or_else(|| {
            header(RATE_LIMIT_RESET)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|reset| Duration::from_secs(reset.saturating_sub(now_unix).max(0) as u64))
        });
        return SourceError::rate_limited(format!("GitHub API rate limit exceeded ({})", status), hint);
    }

    let message = api_message(body).unwrap_or_else(|| status.to_string());
    let kind = match status {
        StatusCode::NOT_FOUND => SourceErrorKind::NotFound,
        s if s.is_server_error() => SourceErrorKind::Transient,
        _ => SourceErrorKind::Other,
    };
    SourceError::new(kind, format!("{} ({})", message, status))
}

fn api_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ApiError {
        message: String,
    }
    serde_json::from_str::<ApiError>(body).ok().map(|e| e.message)
}
