use lazy_static::lazy_static;
use mailparse::{addrparse, DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use regex::Regex;

lazy_static! {
    static ref DIAGNOSTIC_ID_RE: Regex =
        Regex::new(r"(?i)DiagnosticInfo\s+ID:\s*([0-9a-f]+)\b").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// The parts of an inbound feedback email the ingestor cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub body_text: Option<String>,
    pub attachments: Vec<InboundAttachment>,
}

impl InboundMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, mailparse::MailParseError> {
        let mail = mailparse::parse_mail(raw)?;
        let headers = &mail.headers;

        let mut message = InboundMessage {
            message_id: headers
                .get_first_value("Message-ID")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            subject: headers
                .get_first_value("Subject")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            from: headers
                .get_first_value("From")
                .and_then(|v| first_address(&v)),
            ..Default::default()
        };
        collect_parts(&mail, &mut message)?;
        Ok(message)
    }

    /// A diagnostic id written into the body by the client, e.g.
    /// `DiagnosticInfo ID: 1a2b3c4d`.
    pub fn claimed_diagnostic_id(&self) -> Option<String> {
        let body = self.body_text.as_deref()?;
        DIAGNOSTIC_ID_RE
            .captures(body)
            .map(|caps| caps[1].to_string())
    }
}

fn first_address(value: &str) -> Option<String> {
    let list = addrparse(value).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.addr.clone()),
        MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    })
}

fn collect_parts(
    part: &ParsedMail<'_>,
    message: &mut InboundMessage,
) -> Result<(), mailparse::MailParseError> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, message)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if disposition.disposition == DispositionType::Attachment {
        message.attachments.push(InboundAttachment {
            filename: disposition
                .params
                .get("filename")
                .cloned()
                .or_else(|| part.ctype.params.get("name").cloned()),
            content_type: mimetype,
            data: part.get_body_raw()?,
        });
    } else if mimetype == "text/plain" {
        let text = part.get_body()?;
        match &mut message.body_text {
            Some(body) => body.push_str(&text),
            None => message.body_text = Some(text),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "From: \"A User\" <user@example.com>\r\n\
To: feedback@example.com\r\n\
Subject: feedback\r\n\
Message-ID: <m1@x>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please help.\r\n\
DiagnosticInfo ID: 0A1B2C3D\r\n\
--XYZ\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"diagnostic.dat\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8gd29ybGQ=\r\n\
--XYZ--\r\n";

    #[test]
    fn test_parse_headers_body_and_attachment() {
        let message = InboundMessage::parse(RAW.as_bytes()).unwrap();
        assert_eq!(message.message_id.as_deref(), Some("<m1@x>"));
        assert_eq!(message.subject.as_deref(), Some("feedback"));
        assert_eq!(message.from.as_deref(), Some("user@example.com"));
        assert!(message.body_text.as_deref().unwrap().contains("Please help."));

        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("diagnostic.dat"));
        assert_eq!(attachment.data, b"hello world");
    }

    #[test]
    fn test_claimed_diagnostic_id() {
        let message = InboundMessage::parse(RAW.as_bytes()).unwrap();
        assert_eq!(message.claimed_diagnostic_id().as_deref(), Some("0A1B2C3D"));

        let plain = InboundMessage {
            body_text: Some("no id here".to_string()),
            ..Default::default()
        };
        assert!(plain.claimed_diagnostic_id().is_none());
    }

    #[test]
    fn test_message_without_attachments() {
        let raw = "Subject: hi\r\nFrom: x@example.com\r\n\r\njust text\r\n";
        let message = InboundMessage::parse(raw.as_bytes()).unwrap();
        assert!(message.attachments.is_empty());
        assert!(message.message_id.is_none());
        assert_eq!(message.body_text.as_deref().map(str::trim), Some("just text"));
    }
}
