use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use crate::wizard::UpgradeStep;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "puw",
    version,
    about = "Platform upgrade watcher for admin-server driven cluster upgrades"
)]
pub struct Config {
    /// Base URL of the admin server, e.g. https://admin.example.com
    #[arg(long, env = "UPGRADE_API_URL")]
    pub api_url: String,

    /// Seconds between status polls
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value = "5")]
    pub poll_interval_seconds: u64,

    /// Total seconds of status API unavailability tolerated per watched step
    #[arg(long, env = "DOWNTIME_ALLOWANCE_SECONDS", default_value = "0")]
    pub downtime_allowance_seconds: u64,

    /// Request timeout in seconds for status API calls
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value = "30")]
    pub request_timeout_seconds: u64,

    /// Watch a single step instead of driving the whole sequence
    #[arg(long, env = "WATCH_STEP")]
    pub step: Option<String>,

    /// Step to start the wizard from (default: the backend's current step)
    #[arg(long, env = "FROM_STEP")]
    pub from_step: Option<String>,

    /// Slack webhook URL for completion/failure notifications
    #[arg(long, env = "SLACK_WEBHOOK_URL")]
    pub slack_webhook_url: Option<String>,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub const fn downtime_allowance(&self) -> Duration {
        Duration::from_secs(self.downtime_allowance_seconds)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// The single step to watch, when `--step` was given.
    pub fn watch_step(&self) -> Result<Option<UpgradeStep>> {
        Ok(self
            .step
            .as_deref()
            .map(str::parse::<UpgradeStep>)
            .transpose()?)
    }

    /// The step to start the wizard from, when `--from-step` was given.
    pub fn start_step(&self) -> Result<Option<UpgradeStep>> {
        Ok(self
            .from_step
            .as_deref()
            .map(str::parse::<UpgradeStep>)
            .transpose()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds == 0 {
            bail!("--poll-interval-seconds must be greater than zero");
        }
        if self.step.is_some() && self.from_step.is_some() {
            bail!("--step and --from-step are mutually exclusive");
        }
        self.watch_step()?;
        self.start_step()?;
        Ok(())
    }

    pub fn display(&self) {
        tracing::info!(
            api_url = %self.api_url,
            poll_interval_seconds = self.poll_interval_seconds,
            downtime_allowance_seconds = self.downtime_allowance_seconds,
            request_timeout_seconds = self.request_timeout_seconds,
            step = %self.step.as_deref().unwrap_or("-"),
            from_step = %self.from_step.as_deref().unwrap_or("-"),
            slack_notifications = self.slack_webhook_url.is_some(),
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );

        if self.downtime_allowance_seconds == 0 {
            tracing::warn!(
                "Downtime allowance is 0 - any status API outage fails the current watch"
            );
        }
    }
}
