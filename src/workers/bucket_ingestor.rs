use super::{Notifier, POLL_INTERVAL};
use crate::bucket::{ObjectStore, ObjectSummary};
use crate::config::{Config, BUCKET_OBJECT_MIN_SIZE};
use crate::envelope::{Envelope, EnvelopeError};
use crate::pipeline::{ErrorPolicy, IngestError, Pipeline};
use crate::store::{InsertOutcome, NewEmailCorrelation};
use crate::worker::{TickOutcome, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

const MODULE: &str = "s3_decryptor";
const BAD_OBJECT_SUBJECT: &str = "S3Decryptor: bad object";

/// What happened to one object, and whether it may be deleted.
#[derive(Debug)]
enum ObjectOutcome {
    Stored(InsertOutcome),
    Rejected,
    /// Left in the bucket for the next poll.
    Retained,
}

/// Result of the concurrent fetch-and-decrypt stage.
struct Fetched {
    object: ObjectSummary,
    raw: Vec<u8>,
    cleartext: Result<Vec<u8>, IngestError>,
}

/// Polls the upload bucket and feeds envelopes through the pipeline.
pub struct BucketIngestor {
    bucket: Arc<dyn ObjectStore>,
    pipeline: Pipeline,
    notifier: Notifier,
    size_range: RangeInclusive<u64>,
    concurrency: usize,
    cadence: Duration,
}

impl BucketIngestor {
    pub fn new(
        bucket: Arc<dyn ObjectStore>,
        pipeline: Pipeline,
        notifier: Notifier,
        max_object_size: u64,
        concurrency: usize,
    ) -> Self {
        BucketIngestor {
            bucket,
            pipeline,
            notifier,
            size_range: BUCKET_OBJECT_MIN_SIZE..=max_object_size,
            concurrency: concurrency.max(1),
            cadence: POLL_INTERVAL,
        }
    }

    pub fn from_config(
        config: &Config,
        bucket: Arc<dyn ObjectStore>,
        pipeline: Pipeline,
        notifier: Notifier,
    ) -> Self {
        Self::new(
            bucket,
            pipeline,
            notifier,
            config.s3_object_max_size,
            config.num_processes,
        )
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    async fn fetch(&self, object: ObjectSummary) -> Fetched {
        let raw = match self.bucket.get(&object.key).await {
            Ok(raw) => raw,
            Err(e) => {
                return Fetched {
                    object,
                    raw: Vec::new(),
                    cleartext: Err(IngestError::Transport(e)),
                }
            }
        };
        let cleartext = match Envelope::from_json(&raw) {
            Ok(envelope) => self.pipeline.decrypt(envelope).await,
            Err(e) => Err(EnvelopeError::MalformedEnvelope(e.to_string()).into()),
        };
        Fetched {
            object,
            raw,
            cleartext,
        }
    }

    async fn finish(&self, fetched: Fetched) -> ObjectOutcome {
        let Fetched {
            object,
            raw,
            cleartext,
        } = fetched;

        let result = match cleartext {
            Ok(cleartext) => self.pipeline.store_cleartext(&cleartext).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(ingested) => {
                if let InsertOutcome::Inserted(_) = ingested.outcome {
                    if ingested.record.wants_reply() {
                        let correlation = NewEmailCorrelation {
                            diagnostic_info_record_id: ingested.record.metadata.id.clone(),
                            ..Default::default()
                        };
                        let queued = self
                            .pipeline
                            .store()
                            .blocking(move |store| store.insert_email_correlation(&correlation))
                            .await;
                        if let Err(e) = queued {
                            log::error!(
                                "Failed to queue reply for {}: {e}",
                                ingested.record.metadata.id
                            );
                            self.pipeline
                                .record_error(MODULE, &IngestError::Storage(e))
                                .await;
                        }
                    }
                }
                ObjectOutcome::Stored(ingested.outcome)
            }
            Err(e) => {
                match e.policy() {
                    ErrorPolicy::SourceRetaining | ErrorPolicy::WorkerScoped => {
                        log::error!("Keeping object {} for retry: {e}", object.key);
                        self.pipeline.record_error(MODULE, &e).await;
                        return ObjectOutcome::Retained;
                    }
                    ErrorPolicy::RecordLocal => {}
                }

                log::warn!("Rejecting object {}: {e}", object.key);
                self.pipeline.record_error(MODULE, &e).await;
                if e.is_envelope_error() {
                    self.notifier
                        .notify(BAD_OBJECT_SUBJECT, &e.to_string(), &raw)
                        .await;
                }
                ObjectOutcome::Rejected
            }
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.bucket.delete(key).await {
            log::error!("Failed to delete object {key}: {e:#}");
        }
    }
}

#[async_trait]
impl Worker for BucketIngestor {
    fn name(&self) -> &'static str {
        "s3-decryptor"
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn tick(&mut self) -> Result<TickOutcome> {
        let objects = self
            .bucket
            .list()
            .await
            .context("Failed to list upload bucket")?;
        if objects.is_empty() {
            return Ok(TickOutcome::Idle);
        }
        log::debug!("Found {} object(s) in bucket", objects.len());

        let mut candidates = Vec::with_capacity(objects.len());
        for object in objects {
            if self.size_range.contains(&object.size) {
                candidates.push(object);
            } else {
                log::warn!(
                    "Deleting object {} with out-of-range size {} (allowed {:?})",
                    object.key,
                    object.size,
                    self.size_range
                );
                self.delete(&object.key).await;
            }
        }

        // Fetch and decrypt run concurrently; storing and deleting happen in
        // listing order.
        let this = &*self;
        let mut fetched = stream::iter(candidates)
            .map(|object| this.fetch(object))
            .buffered(this.concurrency);

        let (mut stored, mut duplicates, mut rejected, mut retained) = (0, 0, 0, 0);
        while let Some(item) = fetched.next().await {
            let key = item.object.key.clone();
            match this.finish(item).await {
                ObjectOutcome::Retained => {
                    retained += 1;
                    continue;
                }
                ObjectOutcome::Stored(InsertOutcome::Inserted(_)) => stored += 1,
                ObjectOutcome::Stored(InsertOutcome::Duplicate(_)) => duplicates += 1,
                ObjectOutcome::Rejected => rejected += 1,
            }
            this.delete(&key).await;
        }

        log::info!(
            "Bucket pass: {stored} stored, {duplicates} duplicate, {rejected} rejected, {retained} retained"
        );
        Ok(TickOutcome::Idle)
    }
}
