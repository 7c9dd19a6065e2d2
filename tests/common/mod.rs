#![allow(dead_code)]

use async_trait::async_trait;
use feedback_decryptor::bucket::{ObjectStore, ObjectSummary};
use feedback_decryptor::envelope::{Envelope, EnvelopeKey};
use feedback_decryptor::mailbox::{self, Mailbox, MailboxConnector, MailboxError, MessageInfo};
use feedback_decryptor::pipeline::Pipeline;
use feedback_decryptor::psinet::Psinet;
use feedback_decryptor::relay::{MailTransport, Relay, RelayError};
use feedback_decryptor::sanitize::Sanitizer;
use feedback_decryptor::store::Datastore;
use feedback_decryptor::transform::{Registry, Transformer};
use feedback_decryptor::translate::NoopTranslator;
use feedback_decryptor::workers::Notifier;
use feedback_decryptor::Recipients;
use mailparse::MailHeaderMap;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

pub const OPERATOR: &str = "ops@example.com";
pub const FROM: &str = "noreply@example.com";

pub const PSINET: &str = r#"{
    "servers": [{"id": "srv-1", "ip_address": "192.0.2.10"}],
    "deleted_servers": [],
    "sponsors": [{"id": "SP1", "name": "Sponsor One"}],
    "propagation_channels": []
}"#;

static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

pub fn private_key() -> RsaPrivateKey {
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
        .clone()
}

pub fn seal(plaintext: &[u8]) -> Envelope {
    let public = RsaPublicKey::from(&private_key());
    Envelope::seal(&public, plaintext, &mut rand::thread_rng()).unwrap()
}

pub fn temp_store() -> (TempDir, Datastore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feedback.db");
    let store = Datastore::open(path.to_str().unwrap(), chrono::Duration::minutes(360)).unwrap();
    (dir, store)
}

pub fn pipeline(store: Datastore) -> Pipeline {
    Pipeline::new(
        Arc::new(EnvelopeKey::new(private_key())),
        Arc::new(Transformer::new(
            Arc::new(Registry::standard()),
            Arc::new(NoopTranslator),
        )),
        Arc::new(Sanitizer::new(
            Arc::new(Psinet::from_json(PSINET).unwrap()),
            "[UNKNOWN_SPONSOR]",
            "[UNKNOWN_CHANNEL]",
        )),
        store,
    )
}

pub fn notifier(transport: Arc<RecordingTransport>) -> Notifier {
    Notifier::new(
        Arc::new(Relay::new(transport)),
        Recipients::single(OPERATOR).unwrap(),
        FROM,
    )
}

/// A feedback email whose attachment is the envelope JSON.
pub fn feedback_email(message_id: &str, subject: &str, envelope: &Envelope) -> String {
    let attachment = base64::Engine::encode(
        &base64::prelude::BASE64_STANDARD,
        serde_json::to_vec(envelope).unwrap(),
    );
    format!(
        "From: User <user@example.com>\r\n\
         To: feedback@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: {message_id}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"B\"\r\n\
         \r\n\
         --B\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Something is wrong.\r\n\
         --B\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Disposition: attachment; filename=\"diagnostic.json\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {attachment}\r\n\
         --B--\r\n"
    )
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub from: String,
    pub recipients: Vec<String>,
    pub raw: Vec<u8>,
}

impl SentEmail {
    pub fn header(&self, name: &str) -> Option<String> {
        mailparse::parse_mail(&self.raw)
            .unwrap()
            .headers
            .get_first_value(name)
    }
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_raw(
        &self,
        from: &str,
        recipients: &[String],
        raw: &[u8],
    ) -> Result<(), RelayError> {
        self.sent.lock().unwrap().push(SentEmail {
            from: from.to_string(),
            recipients: recipients.to_vec(),
            raw: raw.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBucket {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBucket {
    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.into());
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryBucket {
    async fn list(&self) -> anyhow::Result<Vec<ObjectSummary>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such key {key}"))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMaildrop {
    messages: Arc<Mutex<BTreeMap<u32, Vec<u8>>>>,
}

impl MemoryMaildrop {
    pub fn push(&self, raw: impl Into<Vec<u8>>) {
        let mut messages = self.messages.lock().unwrap();
        let next = messages.keys().last().copied().unwrap_or(0) + 1;
        messages.insert(next, raw.into());
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

struct MemorySession {
    maildrop: MemoryMaildrop,
    marked: Vec<u32>,
}

#[async_trait]
impl Mailbox for MemorySession {
    async fn list(&mut self) -> mailbox::Result<Vec<MessageInfo>> {
        Ok(self
            .maildrop
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(n, raw)| MessageInfo {
                number: *n,
                size: raw.len() as u64,
            })
            .collect())
    }

    async fn retrieve(&mut self, number: u32) -> mailbox::Result<Vec<u8>> {
        self.maildrop
            .messages
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| MailboxError::Protocol(format!("no message {number}")))
    }

    async fn delete(&mut self, number: u32) -> mailbox::Result<()> {
        self.marked.push(number);
        Ok(())
    }

    async fn quit(self: Box<Self>) -> mailbox::Result<()> {
        let mut messages = self.maildrop.messages.lock().unwrap();
        for number in &self.marked {
            messages.remove(number);
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxConnector for MemoryMaildrop {
    async fn connect(&self) -> mailbox::Result<Box<dyn Mailbox>> {
        Ok(Box::new(MemorySession {
            maildrop: self.clone(),
            marked: Vec::new(),
        }))
    }
}
