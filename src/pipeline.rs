use crate::config::Config;
use crate::envelope::{Envelope, EnvelopeError, EnvelopeKey};
use crate::psinet::Psinet;
use crate::record::{DiagnosticRecord, RecordError};
use crate::sanitize::Sanitizer;
use crate::store::{Datastore, ErrorLogEntry, InsertOutcome, StoreError};
use crate::transform::{Registry, Transformer};
use crate::translate::{GoogleTranslator, NoopTranslator, Translator};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("parse error: {0}")]
    Parse(RecordError),

    #[error("sanity check failed: {0}")]
    Insane(RecordError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
}

impl From<RecordError> for IngestError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::NotSane(_) => IngestError::Insane(e),
            other => IngestError::Parse(other),
        }
    }
}

/// How a failure affects the message or object it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and drop the record; the source is acknowledged.
    RecordLocal,
    /// Leave the source in place so the next poll retries it.
    SourceRetaining,
    /// Abandon the current cycle; the worker sleeps and tries again.
    WorkerScoped,
}

impl IngestError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            IngestError::Envelope(_) | IngestError::Parse(_) | IngestError::Insane(_) => {
                ErrorPolicy::RecordLocal
            }
            IngestError::Storage(_) => ErrorPolicy::SourceRetaining,
            IngestError::Transport(_) => ErrorPolicy::WorkerScoped,
        }
    }

    pub fn is_envelope_error(&self) -> bool {
        matches!(self, IngestError::Envelope(_))
    }
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub outcome: InsertOutcome,
    pub record: DiagnosticRecord,
}

/// Shared decrypt, normalise and store path used by both ingestors.
#[derive(Clone)]
pub struct Pipeline {
    key: Arc<EnvelopeKey>,
    transformer: Arc<Transformer>,
    sanitizer: Arc<Sanitizer>,
    store: Datastore,
}

impl Pipeline {
    pub fn new(
        key: Arc<EnvelopeKey>,
        transformer: Arc<Transformer>,
        sanitizer: Arc<Sanitizer>,
        store: Datastore,
    ) -> Self {
        Pipeline {
            key,
            transformer,
            sanitizer,
            store,
        }
    }

    /// Loads the private key, psinet inventory and translator named by
    /// `config`. A missing psinet export leaves addresses as `[UNKNOWN]`
    /// rather than stopping the worker.
    pub fn from_config(config: &Config, store: Datastore) -> anyhow::Result<Self> {
        let password = Some(config.private_key_password.expose()).filter(|p| !p.is_empty());
        let key = EnvelopeKey::from_file(&config.private_key_pem_file, password)?;

        let psinet = match Psinet::from_file(&config.psinet_path()) {
            Ok(psinet) => psinet,
            Err(e) => {
                log::warn!("Using an empty psinet inventory: {e:#}");
                Psinet::default()
            }
        };

        let translator: Arc<dyn Translator> = if config.google_api_key.is_empty() {
            log::warn!("googleApiKey is not set; feedback will not be translated");
            Arc::new(NoopTranslator)
        } else {
            Arc::new(GoogleTranslator::from_config(config)?)
        };

        let registry = Arc::new(Registry::standard());
        Ok(Pipeline::new(
            Arc::new(key),
            Arc::new(Transformer::new(registry, translator)),
            Arc::new(Sanitizer::new(
                Arc::new(psinet),
                config.default_sponsor_name.clone(),
                config.default_propagation_channel_name.clone(),
            )),
            store,
        ))
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }

    /// RSA unwrapping is CPU-bound, so it runs on the blocking pool.
    pub async fn decrypt(&self, envelope: Envelope) -> Result<Vec<u8>, IngestError> {
        let key = self.key.clone();
        let cleartext = tokio::task::spawn_blocking(move || key.decrypt(&envelope))
            .await
            .map_err(|e| IngestError::Transport(anyhow::anyhow!("decrypt task failed: {e}")))??;
        Ok(cleartext)
    }

    /// Parses, transforms, sanitises and stores decrypted cleartext.
    pub async fn store_cleartext(&self, cleartext: &[u8]) -> Result<Ingested, IngestError> {
        let mut record = DiagnosticRecord::from_cleartext(cleartext)?;
        self.transformer.transform(&mut record).await;
        self.sanitizer.sanitize(&mut record)?;

        let (outcome, record) = self
            .store
            .blocking(move |store| {
                store
                    .insert_diagnostic(&record)
                    .map(|outcome| (outcome, record))
            })
            .await?;
        match outcome {
            InsertOutcome::Inserted(id) => log::info!(
                "Stored {} record {} as {id}",
                record.metadata.platform,
                record.metadata.id
            ),
            InsertOutcome::Duplicate(id) => log::info!(
                "Skipping duplicate {} record {} (stored as {id})",
                record.metadata.platform,
                record.metadata.id
            ),
        }
        Ok(Ingested { outcome, record })
    }

    pub async fn ingest(&self, envelope: Envelope) -> Result<Ingested, IngestError> {
        let cleartext = self.decrypt(envelope).await?;
        self.store_cleartext(&cleartext).await
    }

    /// Appends to the datastore error log; failures here are only logged.
    pub async fn record_error(&self, module: &str, error: &IngestError) {
        let entry = ErrorLogEntry::now(module, error);
        if let Err(e) = self
            .store
            .blocking(move |store| store.append_error(&entry))
            .await
        {
            log::error!("Failed to append to error log: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::envelope::test_support::test_key;
    use crate::transform::test_support::UpperTranslator;

    pub fn pipeline(store: Datastore) -> Pipeline {
        let registry = Arc::new(Registry::standard());
        Pipeline::new(
            Arc::new(test_key()),
            Arc::new(Transformer::new(
                registry,
                Arc::new(UpperTranslator::default()),
            )),
            Arc::new(Sanitizer::new(
                Arc::new(Psinet::default()),
                "[UNKNOWN_SPONSOR]",
                "[UNKNOWN_CHANNEL]",
            )),
            store,
        )
    }

    pub fn memory_store() -> Datastore {
        Datastore::open_in_memory(chrono::Duration::minutes(360)).unwrap()
    }
}
