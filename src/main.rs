use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use release_notify::app::{CheckUseCase, RunSummary};
use release_notify::config::{parse_duration, Config};
use release_notify::constants::{self, DINGTALK_CHANNEL, TELEGRAM_CHANNEL};
use release_notify::error::NotifyError;
use release_notify::infra::{DingTalkChannel, GithubClient, TelegramChannel};
use release_notify::ledger::Ledger;
use release_notify::pipeline::{DispatchManager, FetchOrchestrator};
use release_notify::rate_limiter::RateGovernor;
use release_notify::{logging, metrics};

#[derive(Parser)]
#[command(name = "release-notify")]
#[command(about = "Watch GitHub repositories and announce new releases on DingTalk and Telegram")]
#[command(version)]
struct Cli {
    /// Config file (default: ./config.toml, then ~/.notify/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Include release notes in notifications
    #[arg(short = 'd', long, global = true)]
    show_description: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check all repositories once and send notifications
    Check,
    /// Check repeatedly until interrupted
    Watch {
        /// Override the schedule interval, e.g. "30m" or "6h"
        #[arg(long)]
        interval: Option<String>,
    },
    /// Print the last notified tag of every repository
    Status,
}

struct App {
    github: GithubClient,
    github_config: release_notify::config::GithubConfig,
    use_case: CheckUseCase,
}

impl App {
    fn build(config: &Config) -> anyhow::Result<Self> {
        let state_path = config.state_path();
        let ledger = Ledger::open(&state_path).map_err(|e| NotifyError::Startup(e.to_string()))?;

        let github = GithubClient::new(&config.github.token, config.github.show_description)?;
        let fetcher = FetchOrchestrator::new(Arc::new(github.clone()), Arc::new(ledger), config.fetch_settings());
        let dispatcher = build_dispatcher(config)?;

        Ok(Self {
            github,
            github_config: config.github.clone(),
            use_case: CheckUseCase::new(fetcher, dispatcher),
        })
    }

    async fn run_once(&self, cancel: &CancellationToken) -> RunSummary {
        if let Err(e) = self.github.rate_limit_status().await {
            warn!("Could not read GitHub API quota: {}", e);
        }
        let repositories = self.github.resolve_repositories(&self.github_config).await;
        if repositories.is_empty() {
            warn!("No repositories to watch; configure github.repos or enable discovery");
            return RunSummary::default();
        }
        println!(
            "🔍 Checking {} repositories for releases from the last {} days...",
            repositories.len(),
            self.github_config.check_days
        );
        self.use_case.run(&repositories, cancel).await
    }
}

fn build_dispatcher(config: &Config) -> anyhow::Result<DispatchManager> {
    let mut dispatcher = DispatchManager::new(config.template()?, config.dispatch_settings());

    let dingtalk = &config.notifications.dingtalk;
    if dingtalk.enabled {
        let channel = DingTalkChannel::new(dingtalk)?;
        dispatcher.add_channel(Arc::new(channel), RateGovernor::new(DINGTALK_CHANNEL, dingtalk.rate_model()));
    }
    let telegram = &config.notifications.telegram;
    if telegram.enabled {
        let channel = TelegramChannel::new(telegram)?;
        dispatcher.add_channel(Arc::new(channel), RateGovernor::new(TELEGRAM_CHANNEL, telegram.rate_model()));
    }
    if dispatcher.channel_names().is_empty() {
        warn!("No notification channel enabled; new releases are recorded but not announced");
    }
    Ok(dispatcher)
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.fetch.stats;
    println!("\n📊 Release check results:");
    println!("   Repositories: {}", stats.total);
    println!("   Checked: {}", stats.checked);
    println!("   New releases: {}", stats.new_releases);
    println!("   Lookup errors: {}", stats.errors);
    if stats.skipped > 0 {
        println!("   Skipped: {}", stats.skipped);
    }
    for failure in &summary.fetch.failures {
        println!("   - {}", failure);
    }

    if stats.new_releases > 0 {
        println!("\n📨 Notifications:");
        println!("   Delivered: {}", summary.dispatch.delivered);
        println!("   Skipped: {}", summary.dispatch.skipped);
    }

    let rate_limited: Vec<_> = summary.rate_limit_errors().collect();
    if !rate_limited.is_empty() {
        println!("\n⚠️  Rate limits hit:");
        for e in &rate_limited {
            println!("   - {}", e);
        }
    }
    let others: Vec<_> = summary.other_errors().collect();
    if !others.is_empty() {
        println!("\n❌ Delivery errors:");
        for e in &others {
            println!("   - {}", e);
        }
    }

    let guidance = summary.guidance();
    if !guidance.is_empty() {
        println!("\n💡 Suggestions:");
        for line in guidance {
            println!("   - {}", line);
        }
    }
}

async fn check(app: &App, cancel: &CancellationToken) -> anyhow::Result<()> {
    let summary = app.run_once(cancel).await;
    print_summary(&summary);

    if summary.other_errors().next().is_some() {
        bail!("Some notifications could not be sent");
    }
    if summary.channel_rate_limited() {
        bail!("Some notifications were skipped because of rate limits");
    }
    if summary.fetch.stats.new_releases == 0 {
        println!("\n✅ No new releases");
    } else {
        println!("\n✅ Sent notifications for {} new releases", summary.fetch.stats.new_releases);
    }
    Ok(())
}

async fn watch(app: &App, interval: Duration, cancel: &CancellationToken) {
    println!("⏰ Watching for releases every {:?}", interval);
    loop {
        info!("Scheduled check started");
        let summary = app.run_once(cancel).await;
        print_summary(&summary);
        if cancel.is_cancelled() {
            break;
        }

        let mut wait = interval;
        if summary.channel_rate_limited() {
            warn!(
                "Channel rate limit hit; waiting an extra {:?} before the next check",
                constants::RATE_LIMITED_RUN_BACKOFF
            );
            wait += constants::RATE_LIMITED_RUN_BACKOFF;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    println!("👋 Stopped watching");
}

fn status(config: &Config) -> anyhow::Result<()> {
    let ledger = Ledger::open(config.state_path()).map_err(|e| NotifyError::Startup(e.to_string()))?;
    if ledger.is_empty() {
        println!("No releases recorded yet in {}", ledger.path().display());
        return Ok(());
    }
    println!("📒 {} repositories recorded in {}:", ledger.len(), ledger.path().display());
    for record in ledger.records() {
        println!(
            "   {:<40} {:<20} {}",
            record.identity().to_string(),
            record.latest_tag,
            record.last_notified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Token cancelled on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Interrupt received, finishing in-flight work"),
            _ = terminate_signal() => info!("Terminate signal received, finishing in-flight work"),
        }
        token.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.show_description {
        config.github.show_description = true;
    }

    let command = cli.command.unwrap_or(if config.schedule.enabled {
        Commands::Watch { interval: None }
    } else {
        Commands::Check
    });

    match command {
        Commands::Status => status(&config)?,
        Commands::Check => {
            let app = App::build(&config)?;
            let cancel = shutdown_on_signal();
            check(&app, &cancel).await?;
        }
        Commands::Watch { interval } => {
            let interval = match interval {
                Some(raw) => parse_duration(&raw)
                    .filter(|d| !d.is_zero())
                    .with_context(|| format!("Invalid interval '{}'", raw))?,
                None => config.schedule_interval()?,
            };
            let app = App::build(&config)?;
            let cancel = shutdown_on_signal();
            watch(&app, interval, &cancel).await;
        }
    }
    Ok(())
}
