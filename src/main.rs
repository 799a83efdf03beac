//! puw - Platform Upgrade Watcher.
//!
//! Drives an operator-initiated platform upgrade by polling the admin
//! server's status API: each named step is watched until it passes or
//! fails, tolerating a bounded amount of status-API downtime along the
//! way. Step progression itself is owned by the admin server; puw only
//! observes and reports.

mod api;
mod config;
mod error;
mod logging;
mod notify;
mod sync;
mod watch;
mod wizard;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use api::{StatusSource, UpgradeApiClient};
use config::Config;
use notify::{SlackMessage, SlackNotifier};
use wizard::{UpgradeWizard, WizardReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    let config = Config::from_args();
    logging::init(&config.log_format, &config.log_level);

    info!(
        "Starting puw v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(config).await {
        error!("Upgrade watch failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    config.display();

    let client = UpgradeApiClient::new(&config.api_url, config.request_timeout())
        .context("Failed to create status API client")?;
    let source: Arc<dyn StatusSource> = Arc::new(client);

    let slack = config
        .slack_webhook_url
        .clone()
        .filter(|url| !url.is_empty())
        .map(|url| {
            info!("Slack notifications enabled");
            SlackNotifier::new(url)
        });

    let wizard = UpgradeWizard::new(
        Arc::clone(&source),
        config.poll_interval(),
        config.downtime_allowance(),
    );

    let outcome: Result<Option<WizardReport>> = if let Some(step) = config.watch_step()? {
        info!(step = %step, "Watching a single upgrade step");
        wizard.watch_single(step).await.map(|_| None)
    } else {
        wizard.run(config.start_step()?).await.map(Some)
    };

    match outcome {
        Ok(report) => {
            if let (Some(slack), Some(report)) = (&slack, &report) {
                slack.send(&SlackMessage::upgrade_completed(report)).await;
            }
            Ok(())
        }
        Err(e) => {
            if let Some(slack) = &slack {
                slack.send(&SlackMessage::upgrade_failed(&format!("{e:#}"))).await;
            }
            Err(e)
        }
    }
}
