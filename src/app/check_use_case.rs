use crate::pipeline::{DispatchError, DispatchManager, DispatchReport, FetchOrchestrator, FetchReport};
use crate::types::RepositoryIdentity;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Outcome of one check-and-notify pass.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub fetch: FetchReport,
    pub dispatch: DispatchReport,
}

impl RunSummary {
    /// Any throttling seen, on the GitHub side or on a channel.
    pub fn rate_limited(&self) -> bool {
        self.fetch.stats.rate_limited || self.dispatch.rate_limited()
    }

    pub fn channel_rate_limited(&self) -> bool {
        self.dispatch.rate_limited()
    }

    pub fn rate_limit_errors(&self) -> impl Iterator<Item = &DispatchError> {
        self.dispatch.errors.iter().filter(|e| e.is_rate_limit())
    }

    pub fn other_errors(&self) -> impl Iterator<Item = &DispatchError> {
        self.dispatch
            .errors
            .iter()
            .filter(|e| !e.is_rate_limit() && !matches!(e, DispatchError::Cancelled))
    }

    /// Advice printed after a run that hit provider limits.
    pub fn guidance(&self) -> Vec<&'static str> {
        let mut lines = Vec::new();
        if self.fetch.stats.rate_limited {
            lines.push("GitHub API rate limit reached; unchecked repositories are retried next run");
            lines.push("Configure a GitHub token to raise the hourly quota");
        }
        if self.channel_rate_limited() {
            lines.push("A notification channel throttled us; its remaining messages were skipped");
            lines.push("Reduce the number of watched repositories");
            lines.push("Increase the schedule interval");
            lines.push("Delivery resumes after the channel cooldown (10 minutes for DingTalk)");
        }
        lines
    }
}

/// Check every repository, then notify about the new releases.
pub struct CheckUseCase {
    fetcher: FetchOrchestrator,
    dispatcher: DispatchManager,
}

impl CheckUseCase {
    pub fn new(fetcher: FetchOrchestrator, dispatcher: DispatchManager) -> Self {
        Self { fetcher, dispatcher }
    }

    #[instrument(skip_all, fields(repositories = repositories.len()))]
    pub async fn run(&self, repositories: &[RepositoryIdentity], cancel: &CancellationToken) -> RunSummary {
        let fetch = self.fetcher.check_all(repositories, cancel).await;
        if fetch.new_releases.is_empty() {
            info!("No new releases found");
            return RunSummary {
                fetch,
                dispatch: DispatchReport::default(),
            };
        }
        if fetch.new_releases.len() > self.dispatcher.settings().batch_size {
            info!(
                "{} new releases; sending in batches of {} to stay under channel limits",
                fetch.new_releases.len(),
                self.dispatcher.settings().batch_size
            );
        }
        let dispatch = self.dispatcher.dispatch_all(&fetch.new_releases, cancel).await;
        RunSummary { fetch, dispatch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{DeliveryError, NotificationChannel, ReleaseSource, SourceError};
    use crate::ledger::Ledger;
    use crate::pipeline::{DispatchSettings, FetchSettings};
    use crate::rate_limiter::{RateGovernor, RateModel};
    use crate::template::Template;
    use crate::types::ReleaseInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FixedSource;

    #[async_trait]
    impl ReleaseSource for FixedSource {
        async fn latest_release(&self, identity: &RepositoryIdentity) -> Result<Option<ReleaseInfo>, SourceError> {
            Ok(Some(ReleaseInfo {
                identity: identity.clone(),
                tag_name: "v1.0.0".to_string(),
                display_name: "v1.0.0".to_string(),
                description: None,
                url: format!("https://github.com/{}/releases/tag/v1.0.0", identity),
                published_at: Utc::now(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        fn throttle_cooldown(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn deliver(&self, _release: &ReleaseInfo, body: &str) -> Result<(), DeliveryError> {
            self.bodies.lock().unwrap().push(body.to_string());
            Ok(())
        }
    }

    fn use_case(dir: &tempfile::TempDir, channel: Arc<RecordingChannel>) -> CheckUseCase {
        let ledger = Arc::new(Ledger::open(dir.path().join("state.json")).unwrap());
        let fetcher = FetchOrchestrator::new(Arc::new(FixedSource), ledger, FetchSettings::default());
        let settings = DispatchSettings {
            delivery_pause: Duration::ZERO,
            batch_pause: Duration::ZERO,
            ..DispatchSettings::default()
        };
        let mut dispatcher = DispatchManager::new(Template::parse("{{repository}}@{{tag}}").unwrap(), settings);
        let governor = RateGovernor::new(
            "recording",
            RateModel::TokenBucket {
                interval: Duration::ZERO,
                burst: 1,
            },
        );
        dispatcher.add_channel(channel, governor);
        CheckUseCase::new(fetcher, dispatcher)
    }

    #[tokio::test]
    async fn test_second_run_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let use_case = use_case(&dir, Arc::clone(&channel));
        let repos = vec![RepositoryIdentity::new("a", "one"), RepositoryIdentity::new("b", "two")];
        let cancel = CancellationToken::new();

        let first = use_case.run(&repos, &cancel).await;
        assert_eq!(first.dispatch.delivered, 2);
        assert!(!first.rate_limited());
        assert!(first.guidance().is_empty());

        let second = use_case.run(&repos, &cancel).await;
        assert_eq!(second.fetch.stats.new_releases, 0);
        assert_eq!(second.dispatch.delivered, 0);

        let mut bodies = channel.bodies.lock().unwrap().clone();
        bodies.sort();
        assert_eq!(bodies, vec!["a/one@v1.0.0".to_string(), "b/two@v1.0.0".to_string()]);
    }

    #[test]
    fn test_guidance_for_fetch_rate_limit() {
        let mut summary = RunSummary::default();
        summary.fetch.stats.rate_limited = true;
        assert!(summary.rate_limited());
        assert!(!summary.channel_rate_limited());
        assert!(summary.guidance().iter().any(|l| l.contains("GitHub")));
    }
}
