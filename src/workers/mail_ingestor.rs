use super::{Notifier, POLL_INTERVAL};
use crate::envelope::Envelope;
use crate::inbound::{InboundAttachment, InboundMessage};
use crate::mailbox::{Mailbox, MailboxConnector, MessageInfo, MAX_MESSAGE_SIZE};
use crate::pipeline::{ErrorPolicy, IngestError, Pipeline};
use crate::store::NewEmailCorrelation;
use crate::worker::{TickOutcome, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const MODULE: &str = "mail_decryptor";
const BAD_ATTACHMENT_SUBJECT: &str = "MailDecryptor: bad attachment";

/// Whether a message may be removed from the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delete,
    /// A storage failure; the next session retries the whole message.
    Keep,
}

/// Drains the feedback mailbox, one session per cycle.
pub struct MailIngestor {
    connector: Arc<dyn MailboxConnector>,
    pipeline: Pipeline,
    notifier: Notifier,
    cadence: Duration,
    max_message_size: u64,
}

impl MailIngestor {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        pipeline: Pipeline,
        notifier: Notifier,
    ) -> Self {
        MailIngestor {
            connector,
            pipeline,
            notifier,
            cadence: POLL_INTERVAL,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    async fn drain(&self, mailbox: &mut dyn Mailbox, messages: &[MessageInfo]) -> Result<usize> {
        let mut kept = 0;
        for info in messages {
            if info.size > self.max_message_size {
                log::warn!(
                    "Deleting message {} unread: {} bytes exceeds {}",
                    info.number,
                    info.size,
                    self.max_message_size
                );
                self.pipeline
                    .record_error(
                        MODULE,
                        &IngestError::Transport(anyhow::anyhow!(
                            "oversized message: {} bytes",
                            info.size
                        )),
                    )
                    .await;
                mailbox
                    .delete(info.number)
                    .await
                    .with_context(|| format!("Failed to delete message {}", info.number))?;
                continue;
            }
            let raw = mailbox
                .retrieve(info.number)
                .await
                .with_context(|| format!("Failed to retrieve message {}", info.number))?;

            match self.handle_message(&raw).await {
                Disposition::Delete => mailbox
                    .delete(info.number)
                    .await
                    .with_context(|| format!("Failed to delete message {}", info.number))?,
                Disposition::Keep => {
                    log::warn!("Leaving message {} in the mailbox for retry", info.number);
                    kept += 1;
                }
            }
        }
        Ok(kept)
    }

    /// Everything that can go wrong with one message is handled here.
    async fn handle_message(&self, raw: &[u8]) -> Disposition {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping unparseable message ({} bytes): {e}", raw.len());
                self.pipeline
                    .record_error(
                        MODULE,
                        &IngestError::Transport(anyhow::anyhow!("unparseable message: {e}")),
                    )
                    .await;
                return Disposition::Delete;
            }
        };
        log::debug!(
            "Message {:?} from {:?} with {} attachment(s)",
            message.message_id,
            message.from,
            message.attachments.len()
        );

        let mut record_ids: Vec<String> = Vec::new();
        let mut disposition = Disposition::Delete;
        for attachment in &message.attachments {
            match self.handle_attachment(attachment).await {
                Ok(Some(id)) => {
                    if !record_ids.contains(&id) {
                        record_ids.push(id);
                    }
                }
                Ok(None) => {}
                Err(e) if e.policy() == ErrorPolicy::SourceRetaining => {
                    disposition = Disposition::Keep;
                }
                Err(_) => {}
            }
        }

        if record_ids.is_empty() {
            if let Some(id) = message.claimed_diagnostic_id() {
                log::info!("Message claims diagnostic id {id}; waiting for the upload");
                record_ids.push(id);
            }
        }

        // A kept message comes back next session and is correlated then.
        if disposition == Disposition::Keep || record_ids.is_empty() {
            return disposition;
        }
        let correlations: Vec<NewEmailCorrelation> = record_ids
            .into_iter()
            .map(|id| NewEmailCorrelation {
                email_id: message.message_id.clone(),
                email_subject: message.subject.clone(),
                email_from: message.from.clone(),
                diagnostic_info_record_id: id,
            })
            .collect();
        let inserted = self
            .pipeline
            .store()
            .blocking(move |store| store.insert_email_correlations(&correlations))
            .await;
        match inserted {
            Ok(_) => Disposition::Delete,
            Err(e) => {
                log::error!("Failed to record correlations: {e}");
                self.pipeline
                    .record_error(MODULE, &IngestError::Storage(e))
                    .await;
                Disposition::Keep
            }
        }
    }

    /// Returns the client id of a stored record, `None` for attachments that
    /// are not envelopes.
    async fn handle_attachment(
        &self,
        attachment: &InboundAttachment,
    ) -> Result<Option<String>, IngestError> {
        let Some(envelope) = Envelope::from_attachment(&attachment.data) else {
            log::debug!(
                "Skipping non-envelope attachment {:?} ({})",
                attachment.filename,
                attachment.content_type
            );
            return Ok(None);
        };

        match self.pipeline.ingest(envelope).await {
            Ok(ingested) => Ok(Some(ingested.record.metadata.id)),
            Err(e) => {
                log::warn!("Attachment {:?} rejected: {e}", attachment.filename);
                self.pipeline.record_error(MODULE, &e).await;
                if let IngestError::Envelope(envelope_error) = &e {
                    if envelope_error.notifies_operator() {
                        self.notifier
                            .notify(BAD_ATTACHMENT_SUBJECT, &e.to_string(), &attachment.data)
                            .await;
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Worker for MailIngestor {
    fn name(&self) -> &'static str {
        "mail-decryptor"
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn tick(&mut self) -> Result<TickOutcome> {
        let mut mailbox = self
            .connector
            .connect()
            .await
            .context("Failed to connect to mailbox")?;

        let messages = match mailbox.list().await {
            Ok(messages) => messages,
            Err(e) => {
                let _ = mailbox.quit().await;
                return Err(e).context("Failed to list mailbox");
            }
        };
        if messages.is_empty() {
            mailbox.quit().await.context("Failed to close mailbox")?;
            return Ok(TickOutcome::Idle);
        }
        log::info!("Processing {} message(s)", messages.len());

        let drained = self.drain(mailbox.as_mut(), &messages).await;
        // Deletions only take effect once the session is closed.
        let quit = mailbox.quit().await;
        let kept = drained?;
        quit.context("Failed to close mailbox")?;

        Ok(if kept == 0 {
            TickOutcome::Busy
        } else {
            TickOutcome::Idle
        })
    }
}
