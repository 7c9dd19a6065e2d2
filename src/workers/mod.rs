pub mod bucket_ingestor;
pub mod mail_ingestor;
pub mod reply_sender;
pub mod stats_checker;

pub use bucket_ingestor::BucketIngestor;
pub use mail_ingestor::MailIngestor;
pub use reply_sender::ReplySender;
pub use stats_checker::StatsChecker;

use crate::config::{Config, Recipients};
use crate::relay::{OutgoingEmail, Relay};
use std::sync::Arc;
use std::time::Duration;

/// Idle sleep for the ingestors and the reply sender.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Largest excerpt of offending input included in an operator notification.
const NOTIFICATION_EXCERPT_LIMIT: usize = 64 * 1024;

/// Mails the operator about inputs that failed authentication.
#[derive(Clone)]
pub struct Notifier {
    relay: Arc<Relay>,
    recipients: Recipients,
    from: String,
}

impl Notifier {
    pub fn new(relay: Arc<Relay>, recipients: Recipients, from: impl Into<String>) -> Self {
        Notifier {
            relay,
            recipients,
            from: from.into(),
        }
    }

    pub fn from_config(relay: Arc<Relay>, config: &Config) -> Self {
        Self::new(
            relay,
            config.decrypted_email_recipient.clone(),
            config.response_email_address.clone(),
        )
    }

    /// Failures are logged and otherwise ignored.
    pub async fn notify(&self, subject: &str, error: &str, offending: &[u8]) {
        let mut excerpt = String::from_utf8_lossy(offending).into_owned();
        if excerpt.len() > NOTIFICATION_EXCERPT_LIMIT {
            let mut cut = NOTIFICATION_EXCERPT_LIMIT;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
            excerpt.push_str("\n[truncated]");
        }
        let body = format!("{error}\n\n{excerpt}\n");

        let email = OutgoingEmail::new(self.recipients.clone(), &self.from, subject, body);
        if let Err(e) = self.relay.send(email).await {
            log::error!("Failed to send operator notification {subject:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_support::RecordingTransport;

    fn notifier(transport: Arc<RecordingTransport>) -> Notifier {
        Notifier::new(
            Arc::new(Relay::new(transport)),
            Recipients::single("ops@example.com").unwrap(),
            "noreply@example.com",
        )
    }

    #[tokio::test]
    async fn test_notification_runs_on_spawned_task() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = notifier(transport.clone());
        tokio::spawn(async move {
            notifier
                .notify("bad object", "MAC verification failed", b"{\"iv\": \"x\"}")
                .await
        })
        .await
        .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("Subject").as_deref(), Some("bad object"));
        let body = String::from_utf8_lossy(&sent[0].raw).into_owned();
        assert!(body.contains("MAC verification failed"));
    }

    #[tokio::test]
    async fn test_large_excerpt_is_truncated() {
        let transport = Arc::new(RecordingTransport::default());
        let offending = vec![b'a'; NOTIFICATION_EXCERPT_LIMIT * 2];
        notifier(transport.clone())
            .notify("bad object", "invalid padding", &offending)
            .await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].raw.len() < NOTIFICATION_EXCERPT_LIMIT * 2);
    }
}
