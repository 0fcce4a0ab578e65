#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use release_notify::app::ports::{DeliveryError, NotificationChannel, ReleaseSource, SourceError};
use release_notify::types::{ReleaseInfo, RepositoryIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn repo(key: &str) -> RepositoryIdentity {
    key.parse().expect("test identity is owner/name")
}

pub fn release(key: &str, tag: &str, age: chrono::Duration) -> ReleaseInfo {
    let identity = repo(key);
    ReleaseInfo {
        url: format!("https://github.com/{}/releases/tag/{}", identity, tag),
        identity,
        tag_name: tag.to_string(),
        display_name: tag.to_string(),
        description: None,
        published_at: Utc::now() - age,
    }
}

#[derive(Clone)]
pub enum Lookup {
    Release { tag: String, age: chrono::Duration },
    Missing,
    Fail(SourceError),
    /// The lookup task panics.
    Panic,
}

impl Lookup {
    pub fn fresh(tag: &str) -> Self {
        Lookup::Release {
            tag: tag.to_string(),
            age: chrono::Duration::hours(1),
        }
    }

    pub fn aged(tag: &str, days: i64) -> Self {
        Lookup::Release {
            tag: tag.to_string(),
            age: chrono::Duration::days(days),
        }
    }
}

/// Scripted release source that records calls and peak concurrency.
pub struct FakeSource {
    answers: Mutex<HashMap<String, Lookup>>,
    latency: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeSource {
    pub fn new(latency: Duration) -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            latency,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn answer(self, key: &str, lookup: Lookup) -> Self {
        self.answers.lock().unwrap().insert(key.to_string(), lookup);
        self
    }

    pub fn set(&self, key: &str, lookup: Lookup) {
        self.answers.lock().unwrap().insert(key.to_string(), lookup);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseSource for FakeSource {
    async fn latest_release(&self, identity: &RepositoryIdentity) -> Result<Option<ReleaseInfo>, SourceError> {
        let key = identity.to_string();
        self.calls.lock().unwrap().push(key.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let answer = self.answers.lock().unwrap().get(&key).cloned().unwrap_or(Lookup::Missing);
        match answer {
            Lookup::Release { tag, age } => Ok(Some(release(&key, &tag, age))),
            Lookup::Missing => Ok(None),
            Lookup::Fail(e) => Err(e),
            Lookup::Panic => panic!("lookup of {} blew up", key),
        }
    }
}

/// Channel that replays scripted results, then succeeds.
pub struct FakeChannel {
    name: String,
    cooldown: Duration,
    script: Mutex<Vec<Result<(), DeliveryError>>>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

impl FakeChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cooldown: Duration::from_secs(600),
            script: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Results for the first attempts, in order.
    pub fn scripted(self, results: Vec<Result<(), DeliveryError>>) -> Self {
        let mut script = results;
        script.reverse();
        *self.script.lock().unwrap() = script;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for FakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn throttle_cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn deliver(&self, release: &ReleaseInfo, _body: &str) -> Result<(), DeliveryError> {
        let label = format!("{}@{}", release.identity, release.tag_name);
        self.attempts.lock().unwrap().push(label.clone());
        let result = self.script.lock().unwrap().pop().unwrap_or(Ok(()));
        if result.is_ok() {
            self.delivered.lock().unwrap().push(label);
        }
        result
    }
}
