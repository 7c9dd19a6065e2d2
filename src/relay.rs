use crate::config::{Config, Recipients, Secret};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::{Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Largest raw message the bulk mailer accepts.
pub const MAX_RAW_EMAIL_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid email address {address:?}: {reason}")]
    Address { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("raw email is {size} bytes, over the {limit} byte limit")]
    Oversize { size: usize, limit: usize },

    #[error("mail transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub recipients: Recipients,
    pub from: String,
    pub subject: String,
    pub plaintext: String,
    pub html: Option<String>,
    /// Message-id of the email being replied to.
    pub reply_to_message_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutgoingEmail {
    pub fn new(
        recipients: Recipients,
        from: impl Into<String>,
        subject: impl Into<String>,
        plaintext: impl Into<String>,
    ) -> Self {
        OutgoingEmail {
            recipients,
            from: from.into(),
            subject: subject.into(),
            plaintext: plaintext.into(),
            html: None,
            reply_to_message_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_html(mut self, html: Option<String>) -> Self {
        self.html = html;
        self
    }

    pub fn in_reply_to(mut self, message_id: Option<String>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }
}

/// Submits an already-serialised message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_raw(&self, from: &str, recipients: &[String], raw: &[u8])
        -> Result<(), RelayError>;
}

fn parse_mailbox(address: &str) -> Result<Mailbox, RelayError> {
    address.parse::<Mailbox>().map_err(|e| RelayError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

fn parse_address(address: &str) -> Result<Address, RelayError> {
    parse_mailbox(address).map(|mailbox| mailbox.email)
}

/// Serialises `email` as multipart/mixed wrapping multipart/alternative,
/// with quoted-printable UTF-8 bodies.
pub fn build_raw_email(email: &OutgoingEmail) -> Result<Vec<u8>, RelayError> {
    let from = parse_mailbox(&email.from)?;
    let mut builder = Message::builder()
        .from(from.clone())
        .reply_to(from)
        .subject(email.subject.clone());
    for recipient in email.recipients.iter() {
        builder = builder.to(parse_mailbox(recipient)?);
    }
    if let Some(id) = &email.reply_to_message_id {
        builder = builder.in_reply_to(id.clone()).references(id.clone());
    }

    let text_part = |content_type: ContentType, body: &str| {
        SinglePart::builder()
            .header(content_type)
            .header(ContentTransferEncoding::QuotedPrintable)
            .body(body.to_string())
    };

    let mut alternative =
        MultiPart::alternative().singlepart(text_part(ContentType::TEXT_PLAIN, &email.plaintext));
    if let Some(html) = &email.html {
        alternative = alternative.singlepart(text_part(ContentType::TEXT_HTML, html));
    }

    let mut mixed = MultiPart::mixed().multipart(alternative);
    for attachment in &email.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|e| RelayError::Build(format!("{}: {e}", attachment.filename)))?;
        mixed = mixed.singlepart(
            AttachmentPart::new(attachment.filename.clone())
                .body(attachment.data.clone(), content_type),
        );
    }

    let message = builder
        .multipart(mixed)
        .map_err(|e| RelayError::Build(e.to_string()))?;
    Ok(message.formatted())
}

pub struct Relay {
    transport: Arc<dyn MailTransport>,
    max_size: usize,
}

impl Relay {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self::with_max_size(transport, MAX_RAW_EMAIL_SIZE)
    }

    pub fn with_max_size(transport: Arc<dyn MailTransport>, max_size: usize) -> Self {
        Relay {
            transport,
            max_size,
        }
    }

    /// Sends `email`, dropping the HTML alternative once if the message is
    /// over the size limit.
    pub async fn send(&self, mut email: OutgoingEmail) -> Result<(), RelayError> {
        let mut raw = build_raw_email(&email)?;
        if raw.len() > self.max_size && email.html.is_some() {
            log::warn!(
                "Email {:?} is {} bytes; dropping HTML body",
                email.subject,
                raw.len()
            );
            email.html = None;
            raw = build_raw_email(&email)?;
        }
        if raw.len() > self.max_size {
            return Err(RelayError::Oversize {
                size: raw.len(),
                limit: self.max_size,
            });
        }

        self.transport
            .send_raw(&email.from, email.recipients.as_slice(), &raw)
            .await?;
        log::info!(
            "Sent {:?} to {} recipient(s)",
            email.subject,
            email.recipients.as_slice().len()
        );
        Ok(())
    }

    /// Reply path: attachments are never forwarded.
    pub async fn send_reply(&self, mut email: OutgoingEmail) -> Result<(), RelayError> {
        if !email.attachments.is_empty() {
            log::debug!(
                "Stripping {} attachment(s) from reply",
                email.attachments.len()
            );
            email.attachments.clear();
        }
        self.send(email).await
    }
}

/// Bulk-mailer SMTP submission over implicit TLS.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(
        server: &str,
        port: u16,
        username: &str,
        password: &Secret,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(server)
            .with_context(|| format!("Failed to configure SMTP relay {server}"))?
            .port(port)
            .timeout(Some(timeout));
        if !username.is_empty() {
            builder = builder.credentials(Credentials::new(
                username.to_string(),
                password.expose().to_string(),
            ));
        }
        Ok(SmtpTransport {
            inner: builder.build(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let server = config
            .smtp_server
            .as_deref()
            .ok_or_else(|| anyhow!("smtpServer is not configured"))?;
        // SMTP sessions get a longer bound than HTTP-like calls.
        Self::new(
            server,
            config.smtp_port,
            &config.email_username,
            &config.email_password,
            config.http_timeout().max(Duration::from_secs(60)),
        )
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send_raw(
        &self,
        from: &str,
        recipients: &[String],
        raw: &[u8],
    ) -> Result<(), RelayError> {
        let to = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>, _>>()?;
        let envelope = lettre::address::Envelope::new(Some(parse_address(from)?), to)
            .map_err(|e| RelayError::Build(e.to_string()))?;
        self.inner
            .send_raw(&envelope, raw)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(())
    }
}
