use crate::config::{Config, Recipients};
use crate::relay::{OutgoingEmail, Relay};
use crate::store::Datastore;
use crate::template::{RateWarning, Templater};
use crate::worker::{TickOutcome, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const STATS_INTERVAL: Duration = Duration::from_secs(300);
pub const STATS_SUBJECT: &str = "FeedbackDecryptor: Stats";
pub const WARNING_SUBJECT: &str = "FeedbackDecryptor: Warning";

/// Watches the ingestion rate and sends the daily rollup.
pub struct StatsChecker {
    store: Datastore,
    templater: Arc<Templater>,
    relay: Arc<Relay>,
    recipients: Recipients,
    from: String,
    warning_threshold: f64,
    last_check_time: DateTime<Utc>,
}

/// Start of the local calendar day containing `now`.
fn local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        // No local midnight on DST-gap days; fall back to 24 hours.
        .unwrap_or_else(|| now - chrono::Duration::days(1))
}

impl StatsChecker {
    pub fn new(
        store: Datastore,
        templater: Arc<Templater>,
        relay: Arc<Relay>,
        recipients: Recipients,
        from: impl Into<String>,
        warning_threshold: f64,
    ) -> Self {
        StatsChecker {
            store,
            templater,
            relay,
            recipients,
            from: from.into(),
            warning_threshold,
            last_check_time: Utc::now(),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Datastore,
        templater: Arc<Templater>,
        relay: Arc<Relay>,
    ) -> Self {
        Self::new(
            store,
            templater,
            relay,
            config.stats_email_recipients.clone(),
            config.response_email_address.clone(),
            config.stats_warning_threshold_per_minute,
        )
    }

    pub fn with_last_check_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_check_time = at;
        self
    }

    async fn check_rate(&mut self, now: DateTime<Utc>) -> Result<Option<f64>> {
        let elapsed_mins = (now - self.last_check_time).num_milliseconds() as f64 / 60_000.0;
        if elapsed_mins <= 0.0 {
            log::debug!("No time elapsed since last rate check");
            return Ok(None);
        }

        let last_check_time = self.last_check_time;
        let new_records = self
            .store
            .blocking(move |store| store.get_new_record_count(last_check_time))
            .await
            .context("Failed to count new records")?;
        self.last_check_time = now;

        let recs_per_min = new_records as f64 / elapsed_mins;
        log::debug!("{new_records} new record(s) in {elapsed_mins:.1} min ({recs_per_min:.2}/min)");
        if recs_per_min <= self.warning_threshold {
            return Ok(None);
        }

        log::warn!(
            "Ingestion rate {recs_per_min:.2}/min exceeds threshold {}",
            self.warning_threshold
        );
        let warning = RateWarning {
            recs_per_min,
            interval_mins: elapsed_mins,
            warning_threshold: self.warning_threshold,
        };
        let plaintext = format!(
            "Ingestion rate is {recs_per_min:.2} records/min over the last {elapsed_mins:.1} minutes \
             (threshold {}).\n",
            self.warning_threshold
        );
        let email = OutgoingEmail::new(
            self.recipients.clone(),
            &self.from,
            WARNING_SUBJECT,
            plaintext,
        )
        .with_html(self.templater.render_stats_warning(&warning));
        if let Err(e) = self.relay.send(email).await {
            log::error!("Failed to send rate warning: {e}");
        }
        Ok(Some(recs_per_min))
    }

    async fn check_daily(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let last_send_time = self
            .store
            .blocking(|store| store.get_stats_cursor())
            .await
            .context("Failed to read stats cursor")?;
        if last_send_time.is_some_and(|last| last >= local_midnight(now)) {
            return Ok(false);
        }

        let since = last_send_time.unwrap_or_else(|| now - chrono::Duration::days(1));
        let summary = self
            .store
            .blocking(move |store| store.get_stats(since))
            .await
            .context("Failed to build stats summary")?;
        let plaintext = serde_yaml::to_string(&summary).context("Failed to format stats")?;
        let email = OutgoingEmail::new(self.recipients.clone(), &self.from, STATS_SUBJECT, plaintext)
            .with_html(self.templater.render_stats(&summary));

        if let Err(e) = self.relay.send(email).await {
            // The cursor stays put, so the next tick tries again.
            log::error!("Failed to send daily stats: {e}");
            return Ok(false);
        }

        let watermark = summary.error_watermark;
        let drained = self
            .store
            .blocking(move |store| {
                store.set_stats_cursor(now)?;
                store.drain_errors_through(since, watermark)
            })
            .await
            .context("Failed to record sent stats")?;
        log::info!(
            "Sent daily stats: {} new record(s), {} error(s) reported",
            summary.new_records,
            drained.len()
        );
        Ok(true)
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_rate(now).await?;
        self.check_daily(now).await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for StatsChecker {
    fn name(&self) -> &'static str {
        "stats-checker"
    }

    fn cadence(&self) -> Duration {
        STATS_INTERVAL
    }

    async fn tick(&mut self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await?;
        Ok(TickOutcome::Idle)
    }
}
