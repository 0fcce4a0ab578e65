//! Bounded-concurrency release checks across a repository set.

use crate::app::ports::{ReleaseSource, SourceError};
use crate::ledger::{CommitOutcome, Ledger, LedgerError};
use crate::types::{dedupe_identities, ReleaseInfo, RepositoryIdentity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Only releases published within this window are eligible.
    pub freshness_window: chrono::Duration,
    pub concurrency_limit: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            freshness_window: chrono::Duration::days(crate::constants::DEFAULT_CHECK_DAYS),
            concurrency_limit: crate::constants::DEFAULT_FETCH_CONCURRENCY,
            batch_size: crate::constants::DEFAULT_FETCH_BATCH_SIZE,
            batch_pause: crate::constants::DEFAULT_FETCH_BATCH_PAUSE,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// Distinct repositories requested.
    pub total: usize,
    /// Lookups that were actually issued.
    pub checked: usize,
    pub new_releases: usize,
    /// No release, a stale release, or a tag already in the ledger.
    pub no_qualifying_release: usize,
    pub errors: usize,
    /// Not looked up because the run halted or was cancelled.
    pub skipped: usize,
    pub rate_limited: bool,
}

#[derive(Debug)]
pub enum FetchFailure {
    Lookup {
        identity: RepositoryIdentity,
        error: SourceError,
    },
    Persist {
        identity: RepositoryIdentity,
        error: LedgerError,
    },
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Lookup { identity, error } => write!(f, "{}: {}", identity, error),
            FetchFailure::Persist { identity, error } => write!(f, "{}: {}", identity, error),
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub new_releases: Vec<ReleaseInfo>,
    pub stats: FetchStats,
    pub failures: Vec<FetchFailure>,
}

// Everything the workers share, behind one mutex.
#[derive(Default)]
struct Tally {
    report: FetchReport,
    halted: bool,
}

type SharedTally = Arc<Mutex<Tally>>;

fn lock(tally: &SharedTally) -> MutexGuard<'_, Tally> {
    tally.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FetchOrchestrator {
    source: Arc<dyn ReleaseSource>,
    ledger: Arc<Ledger>,
    settings: FetchSettings,
}

impl FetchOrchestrator {
    pub fn new(source: Arc<dyn ReleaseSource>, ledger: Arc<Ledger>, settings: FetchSettings) -> Self {
        Self { source, ledger, settings }
    }

    /// Checks every repository once and returns the releases newly committed
    /// to the ledger. A rate-limit signal from the source stops the run after
    /// the in-flight lookups finish; the partial report is returned.
    #[instrument(skip_all, fields(repositories = identities.len()))]
    pub async fn check_all(&self, identities: &[RepositoryIdentity], cancel: &CancellationToken) -> FetchReport {
        let identities = dedupe_identities(identities);
        let tally: SharedTally = Arc::default();
        lock(&tally).report.stats.total = identities.len();

        let batch_size = self.settings.batch_size.max(1);
        let batch_count = identities.len().div_ceil(batch_size);
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency_limit.max(1)));
        let cutoff = Utc::now()
            .checked_sub_signed(self.settings.freshness_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        info!(
            "Checking {} repositories for releases published after {} ({} per batch, {} concurrent)",
            identities.len(),
            cutoff.format("%Y-%m-%d %H:%M"),
            batch_size,
            self.settings.concurrency_limit.max(1)
        );

        for (batch_index, batch) in identities.chunks(batch_size).enumerate() {
            if lock(&tally).halted || cancel.is_cancelled() {
                break;
            }
            let first = batch_index * batch_size + 1;
            info!("Checking repositories {}-{} of {}", first, first + batch.len() - 1, identities.len());
            let t_batch = Instant::now();

            let mut workers = JoinSet::new();
            for identity in batch {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else { break };
                // The halt may have been raised while we waited for the slot
                if lock(&tally).halted {
                    break;
                }

                let source = Arc::clone(&self.source);
                let ledger = Arc::clone(&self.ledger);
                let tally = Arc::clone(&tally);
                let identity = identity.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    check_one(source.as_ref(), ledger, cutoff, identity, &tally).await;
                });
            }

            // Barrier: the whole batch finishes before the next one starts
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("Repository check task failed: {}", e);
                    let mut tally = lock(&tally);
                    tally.report.stats.checked += 1;
                    tally.report.stats.errors += 1;
                }
            }
            crate::metrics::fetch::batch_duration(t_batch.elapsed().as_secs_f64());

            if lock(&tally).halted {
                warn!("GitHub API rate limit reached; remaining repositories were not checked");
                break;
            }
            if batch_index + 1 < batch_count && !self.settings.batch_pause.is_zero() {
                debug!("Pausing {:?} before the next batch", self.settings.batch_pause);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.batch_pause) => {}
                }
            }
        }

        let mut report = std::mem::take(&mut lock(&tally).report);
        report.stats.skipped = report.stats.total.saturating_sub(report.stats.checked);
        if cancel.is_cancelled() {
            warn!("Release check cancelled; {} repositories skipped", report.stats.skipped);
        }
        info!(
            checked = report.stats.checked,
            new_releases = report.stats.new_releases,
            no_release = report.stats.no_qualifying_release,
            errors = report.stats.errors,
            skipped = report.stats.skipped,
            rate_limited = report.stats.rate_limited,
            "Release check finished"
        );
        report
    }
}

async fn check_one(
    source: &dyn ReleaseSource,
    ledger: Arc<Ledger>,
    cutoff: DateTime<Utc>,
    identity: RepositoryIdentity,
    tally: &SharedTally,
) {
    if lock(tally).halted {
        return;
    }

    let t0 = Instant::now();
    let result = source.latest_release(&identity).await;
    crate::metrics::fetch::lookup_duration(t0.elapsed().as_secs_f64());
    crate::metrics::fetch::repository_checked();

    let release = match result {
        Ok(Some(release)) if release.published_at >= cutoff => release,
        Ok(Some(release)) => {
            debug!("{} latest release {} is outside the freshness window", identity, release.tag_name);
            let mut tally = lock(tally);
            tally.report.stats.checked += 1;
            tally.report.stats.no_qualifying_release += 1;
            crate::metrics::fetch::no_qualifying_release();
            return;
        }
        Ok(None) => {
            debug!("{} has no published release", identity);
            let mut tally = lock(tally);
            tally.report.stats.checked += 1;
            tally.report.stats.no_qualifying_release += 1;
            crate::metrics::fetch::no_qualifying_release();
            return;
        }
        Err(error) => {
            let mut tally = lock(tally);
            tally.report.stats.checked += 1;
            if error.is_rate_limited() {
                warn!("Rate limited while checking {}: {}", identity, error.message);
                tally.report.stats.rate_limited = true;
                tally.halted = true;
                crate::metrics::fetch::rate_limited();
            } else {
                warn!("Failed to fetch latest release of {}: {}", identity, error);
                tally.report.stats.errors += 1;
                crate::metrics::fetch::lookup_error();
            }
            tally.report.failures.push(FetchFailure::Lookup { identity, error });
            return;
        }
    };

    // Ledger has its own lock; never take it while holding the tally.
    // The commit writes the snapshot, so it runs off the async workers.
    let commit = {
        let identity = identity.clone();
        let tag = release.tag_name.clone();
        tokio::task::spawn_blocking(move || ledger.check_and_commit_if_new(&identity, &tag)).await
    };
    let outcome = match commit {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Ledger commit for {} failed: {}", identity, e);
            let mut tally = lock(tally);
            tally.report.stats.checked += 1;
            tally.report.stats.errors += 1;
            return;
        }
    };

    let mut tally = lock(tally);
    tally.report.stats.checked += 1;
    match outcome {
        CommitOutcome::Unchanged => {
            tally.report.stats.no_qualifying_release += 1;
            crate::metrics::fetch::no_qualifying_release();
        }
        CommitOutcome::Committed => {
            info!("New release found: {} ({})", identity, release.tag_name);
            tally.report.stats.new_releases += 1;
            tally.report.new_releases.push(release);
            crate::metrics::fetch::new_release();
        }
        CommitOutcome::CommittedUnpersisted(error) => {
            info!("New release found: {} ({}), not persisted", identity, release.tag_name);
            tally.report.stats.new_releases += 1;
            tally.report.new_releases.push(release);
            tally.report.failures.push(FetchFailure::Persist { identity, error });
            crate::metrics::fetch::new_release();
        }
    }
}
