use super::POLL_INTERVAL;
use crate::config::{Config, Recipients};
use crate::relay::{OutgoingEmail, Relay, RelayError};
use crate::store::{Datastore, EmailCorrelation, StoredRecord};
use crate::template::{plaintext_body, Templater};
use crate::worker::{TickOutcome, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Delivers decrypted records as threaded replies, at most once per
/// correlation unless retries are configured.
pub struct ReplySender {
    store: Datastore,
    templater: Arc<Templater>,
    relay: Arc<Relay>,
    recipients: Recipients,
    from: String,
    retry_count: u32,
    retry_backoff: Duration,
    cadence: Duration,
}

impl ReplySender {
    pub fn new(
        store: Datastore,
        templater: Arc<Templater>,
        relay: Arc<Relay>,
        recipients: Recipients,
        from: impl Into<String>,
    ) -> Self {
        ReplySender {
            store,
            templater,
            relay,
            recipients,
            from: from.into(),
            retry_count: 0,
            retry_backoff: Duration::from_secs(5),
            cadence: POLL_INTERVAL,
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
            config.decrypted_email_recipient.clone(),
            config.response_email_address.clone(),
        )
        .with_retries(config.reply_retry_count, Duration::from_secs(5))
    }

    pub fn with_retries(mut self, retry_count: u32, backoff: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    fn compose(&self, correlation: &EmailCorrelation, stored: &StoredRecord) -> OutgoingEmail {
        let metadata = &stored.record.metadata;
        let subject = match correlation
            .email_subject
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            Some(subject) => format!("Re: {subject}"),
            None => format!(
                "DiagnosticInfo: {} ({})",
                metadata.platform.display_name(),
                metadata.id
            ),
        };

        let html = self.templater.render_record(stored);
        if html.is_none() {
            log::warn!("Sending plaintext-only reply for {}", metadata.id);
        }

        OutgoingEmail::new(
            self.recipients.clone(),
            &self.from,
            subject,
            plaintext_body(&stored.record.tree),
        )
        .with_html(html)
        .in_reply_to(correlation.email_id.clone())
    }

    async fn send_with_retries(&self, email: OutgoingEmail) -> Result<(), RelayError> {
        let mut attempt = 0;
        loop {
            match self.relay.send_reply(email.clone()).await {
                Ok(()) => return Ok(()),
                Err(RelayError::Transport(e)) if attempt < self.retry_count => {
                    attempt += 1;
                    let backoff = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "Reply send failed ({e}); retry {attempt}/{} in {backoff:?}",
                        self.retry_count
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass over the pending correlations. Returns the number of
    /// replies attempted.
    pub async fn run_pass(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self
            .store
            .blocking(move |store| store.expire_email_correlations(now))
            .await
            .context("Failed to expire correlations")?;
        if expired > 0 {
            log::info!("Expired {expired} correlation(s) with no matching record");
        }

        let mut attempted = 0;
        let mut cursor = self.store.iterate_email_correlations();
        loop {
            let (rest, next) = self
                .store
                .blocking(move |store| {
                    let mut cursor = cursor;
                    let next = match cursor.next().transpose()? {
                        Some(correlation) => {
                            let stored = store
                                .find_diagnostic_by_client_id(&correlation.diagnostic_info_record_id)?;
                            Some((correlation, stored))
                        }
                        None => None,
                    };
                    Ok((cursor, next))
                })
                .await
                .context("Failed to read pending correlations")?;
            cursor = rest;

            let Some((correlation, stored)) = next else {
                break;
            };
            let Some(stored) = stored else {
                log::debug!(
                    "No record yet for {}; will look again",
                    correlation.diagnostic_info_record_id
                );
                continue;
            };

            // Removed before composing, so a record that breaks rendering
            // or sending is never retried.
            let removing = correlation.clone();
            self.store
                .blocking(move |store| store.remove_email_correlation(&removing))
                .await
                .context("Failed to remove correlation")?;

            let email = self.compose(&correlation, &stored);
            let subject = email.subject.clone();
            match self.send_with_retries(email).await {
                Ok(()) => log::info!("Sent reply {subject:?}"),
                Err(e) => log::error!("Failed to send reply {subject:?}: {e}"),
            }
            attempted += 1;
        }
        Ok(attempted)
    }
}

#[async_trait]
impl Worker for ReplySender {
    fn name(&self) -> &'static str {
        "mail-sender"
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn tick(&mut self) -> Result<TickOutcome> {
        self.run_pass().await?;
        Ok(TickOutcome::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::memory_store;
    use crate::record::DiagnosticRecord;
    use crate::relay::test_support::RecordingTransport;
    use crate::store::NewEmailCorrelation;
    use crate::transform::Registry;
    use serde_json::json;

    fn sender(store: Datastore, transport: Arc<RecordingTransport>) -> ReplySender {
        ReplySender::new(
            store,
            Arc::new(Templater::new(Arc::new(Registry::standard())).unwrap()),
            Arc::new(Relay::new(transport)),
            Recipients::single("ops@example.com").unwrap(),
            "noreply@example.com",
        )
    }

    fn store_record(store: &Datastore, id: &str) {
        let record = DiagnosticRecord::from_tree(json!({
            "Metadata": {"platform": "android", "version": 2, "id": id},
            "Feedback": {"Message": {"text": "hi"}}
        }))
        .unwrap();
        store.insert_diagnostic(&record).unwrap();
    }

    fn correlate(store: &Datastore, id: &str, subject: Option<&str>, email_id: Option<&str>) {
        store
            .insert_email_correlation(&NewEmailCorrelation {
                email_id: email_id.map(str::to_string),
                email_subject: subject.map(str::to_string),
                email_from: Some("user@example.com".to_string()),
                diagnostic_info_record_id: id.to_string(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_reply_is_threaded() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::default());
        store_record(&store, "abc");
        correlate(&store, "abc", Some("feedback"), Some("<m1@x>"));

        let sent_count = sender(store.clone(), transport.clone())
            .run_pass()
            .await
            .unwrap();
        assert_eq!(sent_count, 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("Subject").as_deref(), Some("Re: feedback"));
        assert_eq!(sent[0].header("In-Reply-To").as_deref(), Some("<m1@x>"));
        assert_eq!(sent[0].header("References").as_deref(), Some("<m1@x>"));
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
        assert_eq!(store.pending_correlation_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subject_without_original_email() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::default());
        store_record(&store, "abc");
        correlate(&store, "abc", None, None);

        sender(store, transport.clone()).run_pass().await.unwrap();
        let sent = transport.sent();
        assert_eq!(
            sent[0].header("Subject").as_deref(),
            Some("DiagnosticInfo: Android (abc)")
        );
        assert!(sent[0].header("In-Reply-To").is_none());
    }

    #[tokio::test]
    async fn test_missing_record_is_revisited() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::default());
        correlate(&store, "later", Some("feedback"), Some("<m2@x>"));
        let sender = sender(store.clone(), transport.clone());

        assert_eq!(sender.run_pass().await.unwrap(), 0);
        assert_eq!(store.pending_correlation_count().unwrap(), 1);

        store_record(&store, "later");
        assert_eq!(sender.run_pass().await.unwrap(), 1);
        assert_eq!(store.pending_correlation_count().unwrap(), 0);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_still_removes_correlation() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::failing());
        store_record(&store, "abc");
        correlate(&store, "abc", Some("feedback"), Some("<m1@x>"));

        let sender = sender(store.clone(), transport.clone())
            .with_retries(2, Duration::from_millis(1));
        assert_eq!(sender.run_pass().await.unwrap(), 1);
        assert_eq!(store.pending_correlation_count().unwrap(), 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_deeply_nested_record_is_replied_to() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::default());
        let deep = (0..100).fold(json!("bottom"), |inner, _| json!({ "k": inner }));
        let record = DiagnosticRecord::from_tree(json!({
            "Metadata": {"platform": "android", "version": 2, "id": "deep"},
            "Feedback": {"Message": {"text": "hi"}},
            "X": deep
        }))
        .unwrap();
        store.insert_diagnostic(&record).unwrap();
        correlate(&store, "deep", Some("feedback"), Some("<m3@x>"));

        assert_eq!(
            sender(store.clone(), transport.clone())
                .run_pass()
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.pending_correlation_count().unwrap(), 0);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].parsed().subparts.is_empty());
    }

    #[tokio::test]
    async fn test_expired_correlations_are_swept() {
        let store = memory_store();
        let transport = Arc::new(RecordingTransport::default());
        store
            .insert_email_correlation_at(
                &NewEmailCorrelation {
                    diagnostic_info_record_id: "never".to_string(),
                    ..Default::default()
                },
                Utc::now() - chrono::Duration::hours(7),
            )
            .unwrap();

        sender(store.clone(), transport.clone())
            .run_pass()
            .await
            .unwrap();
        assert_eq!(store.pending_correlation_count().unwrap(), 0);
        assert!(transport.sent().is_empty());
    }
}
