use crate::config::{Config, Secret};
use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Largest message the ingestor will retrieve.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;
/// Status and listing lines.
const MAX_LINE_LENGTH: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("mailbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("mailbox server rejected {command}: {response}")]
    Rejected {
        command: &'static str,
        response: String,
    },

    #[error("mailbox response exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("malformed mailbox response: {0}")]
    Protocol(String),

    #[error("mailbox is not configured: {0}")]
    NotConfigured(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MailboxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub number: u32,
    pub size: u64,
}

/// One authenticated mailbox session.
#[async_trait]
pub trait Mailbox: Send {
    async fn list(&mut self) -> Result<Vec<MessageInfo>>;
    async fn retrieve(&mut self, number: u32) -> Result<Vec<u8>>;
    /// Marks a message for deletion; committed by `quit`.
    async fn delete(&mut self, number: u32) -> Result<()>;
    async fn quit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Mailbox>>;
}

/// POP3 session over any byte stream.
pub struct Pop3Session<S> {
    stream: BufReader<S>,
    io_timeout: Duration,
    max_message_size: u64,
}

impl<S> Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Reads the server greeting and logs in.
    pub async fn login(
        stream: S,
        username: &str,
        password: &Secret,
        io_timeout: Duration,
    ) -> Result<Self> {
        let mut session = Pop3Session {
            stream: BufReader::new(stream),
            io_timeout,
            max_message_size: MAX_MESSAGE_SIZE,
        };
        session.expect_ok("greeting").await?;
        session
            .command("USER", &format!("USER {username}"))
            .await?;
        session
            .command("PASS", &format!("PASS {}", password.expose()))
            .await?;
        Ok(session)
    }

    pub fn with_max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Reads one raw line of at most `limit` bytes, terminator included.
    /// An empty result means the peer closed the connection.
    async fn read_bounded(&mut self, limit: u64) -> Result<Vec<u8>> {
        let io_timeout = self.io_timeout;
        let mut buf = Vec::new();
        let mut bounded = (&mut self.stream).take(limit);
        timeout(io_timeout, bounded.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| MailboxError::Timeout(io_timeout))??;
        if buf.len() as u64 >= limit && buf.last() != Some(&b'\n') {
            return Err(MailboxError::TooLarge { limit });
        }
        Ok(buf)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = self.read_bounded(MAX_LINE_LENGTH).await?;
        if buf.is_empty() {
            return Err(MailboxError::Protocol("connection closed".to_string()));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let payload = format!("{line}\r\n");
        timeout(self.io_timeout, async {
            let stream = self.stream.get_mut();
            stream.write_all(payload.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| MailboxError::Timeout(self.io_timeout))??;
        Ok(())
    }

    async fn expect_ok(&mut self, command: &'static str) -> Result<String> {
        let line = self.read_line().await?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else {
            Err(MailboxError::Rejected {
                command,
                response: line,
            })
        }
    }

    async fn command(&mut self, name: &'static str, line: &str) -> Result<String> {
        if name != "PASS" {
            log::debug!("POP3 > {line}");
        }
        self.write_line(line).await?;
        self.expect_ok(name).await
    }

    /// Reads a dot-terminated multi-line body, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(lines);
            }
            match line.strip_prefix('.') {
                Some(unstuffed) => lines.push(unstuffed.to_string()),
                None => lines.push(line),
            }
        }
    }

    /// Like `read_multiline` but keeps raw bytes. Fails once the body would
    /// pass `max_message_size`; the session is unusable afterwards.
    async fn read_multiline_bytes(&mut self) -> Result<Vec<u8>> {
        let limit = self.max_message_size;
        let mut body = Vec::new();
        loop {
            // Room for the terminating ".\r\n" even when the body is full.
            let remaining = limit.saturating_sub(body.len() as u64) + 3;
            let buf = self
                .read_bounded(remaining)
                .await
                .map_err(|e| match e {
                    MailboxError::TooLarge { .. } => MailboxError::TooLarge { limit },
                    e => e,
                })?;
            if buf.is_empty() {
                return Err(MailboxError::Protocol(
                    "connection closed mid-message".to_string(),
                ));
            }
            if buf == b".\r\n" || buf == b".\n" {
                return Ok(body);
            }
            let line = if buf.starts_with(b"..") { &buf[1..] } else { &buf[..] };
            if (body.len() + line.len()) as u64 > limit {
                return Err(MailboxError::TooLarge { limit });
            }
            body.extend_from_slice(line);
        }
    }
}

#[async_trait]
impl<S> Mailbox for Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn list(&mut self) -> Result<Vec<MessageInfo>> {
        self.command("LIST", "LIST").await?;
        self.read_multiline()
            .await?
            .iter()
            .map(|line| {
                let mut parts = line.split_whitespace();
                let number = parts.next().and_then(|n| n.parse().ok());
                let size = parts.next().and_then(|s| s.parse().ok());
                match (number, size) {
                    (Some(number), Some(size)) => Ok(MessageInfo { number, size }),
                    _ => Err(MailboxError::Protocol(format!("bad LIST line {line:?}"))),
                }
            })
            .collect()
    }

    async fn retrieve(&mut self, number: u32) -> Result<Vec<u8>> {
        self.command("RETR", &format!("RETR {number}")).await?;
        self.read_multiline_bytes().await
    }

    async fn delete(&mut self, number: u32) -> Result<()> {
        self.command("DELE", &format!("DELE {number}")).await?;
        Ok(())
    }

    async fn quit(mut self: Box<Self>) -> Result<()> {
        self.command("QUIT", "QUIT").await?;
        Ok(())
    }
}

/// Connects to a POP3-over-TLS server, one session per poll cycle.
pub struct Pop3Connector {
    host: String,
    port: u16,
    username: String,
    password: Secret,
    io_timeout: Duration,
}

impl std::fmt::Debug for Pop3Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pop3Connector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

impl Pop3Connector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: Secret,
        io_timeout: Duration,
    ) -> Self {
        Pop3Connector {
            host: host.into(),
            port,
            username: username.into(),
            password,
            io_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let host = config
            .pop_server
            .clone()
            .ok_or_else(|| MailboxError::NotConfigured(anyhow!("popServer is not set")))?;
        Ok(Self::new(
            host,
            config.pop_port,
            config.email_username.clone(),
            config.email_password.clone(),
            config.http_timeout().max(Duration::from_secs(30)),
        ))
    }
}

#[async_trait]
impl MailboxConnector for Pop3Connector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>> {
        let tcp = timeout(
            self.io_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| MailboxError::Timeout(self.io_timeout))??;

        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = timeout(self.io_timeout, connector.connect(&self.host, tcp))
            .await
            .map_err(|_| MailboxError::Timeout(self.io_timeout))??;

        log::debug!("Connected to {}:{}", self.host, self.port);
        let session =
            Pop3Session::login(tls, &self.username, &self.password, self.io_timeout).await?;
        Ok(Box::new(session))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Plays the server side of a scripted POP3 exchange. Each step is the
    /// expected client line (or `None` for the greeting) and the reply.
    async fn serve(mut server: DuplexStream, script: Vec<(Option<&'static str>, &'static str)>) {
        let mut pending = Vec::new();
        for (expected, reply) in script {
            if let Some(expected) = expected {
                let line = loop {
                    if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
                        let line: Vec<u8> = pending.drain(..pos + 2).collect();
                        break String::from_utf8(line).unwrap();
                    }
                    let mut buf = [0u8; 256];
                    let n = server.read(&mut buf).await.unwrap();
                    assert!(n > 0, "client hung up");
                    pending.extend_from_slice(&buf[..n]);
                };
                assert_eq!(line.trim_end(), expected);
            }
            server.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    fn login_script() -> Vec<(Option<&'static str>, &'static str)> {
        vec![
            (None, "+OK ready\r\n"),
            (Some("USER feedback"), "+OK\r\n"),
            (Some("PASS hunter2"), "+OK logged in\r\n"),
        ]
    }

    async fn session(
        script: Vec<(Option<&'static str>, &'static str)>,
    ) -> (Pop3Session<DuplexStream>, tokio::task::JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(serve(server, script));
        let session = Pop3Session::login(
            client,
            "feedback",
            &Secret::new("hunter2"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (session, handle)
    }

    #[tokio::test]
    async fn test_list_retrieve_delete_quit() {
        let mut script = login_script();
        script.extend([
            (Some("LIST"), "+OK 2 messages\r\n1 120\r\n2 4096\r\n.\r\n"),
            (
                Some("RETR 1"),
                "+OK\r\nSubject: hi\r\n\r\n..leading dot\r\nbody\r\n.\r\n",
            ),
            (Some("DELE 1"), "+OK deleted\r\n"),
            (Some("QUIT"), "+OK bye\r\n"),
        ]);
        let (mut session, handle) = session(script).await;

        let listing = session.list().await.unwrap();
        assert_eq!(
            listing,
            vec![
                MessageInfo {
                    number: 1,
                    size: 120
                },
                MessageInfo {
                    number: 2,
                    size: 4096
                }
            ]
        );

        let raw = session.retrieve(1).await.unwrap();
        assert_eq!(raw, b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n".to_vec());

        session.delete(1).await.unwrap();
        Box::new(session).quit().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let body: &'static str = Box::leak(
            format!("+OK\r\n{}\r\n.\r\n", "x".repeat(4096)).into_boxed_str(),
        );
        let mut script = login_script();
        script.push((Some("RETR 1"), body));
        let (session, handle) = session(script).await;
        let mut session = session.with_max_message_size(1024);

        let result = session.retrieve(1).await;
        assert!(matches!(
            result,
            Err(MailboxError::TooLarge { limit: 1024 })
        ));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_at_limit_is_read() {
        let mut script = login_script();
        script.push((Some("RETR 1"), "+OK\r\n0123456789\r\n.\r\n"));
        let (session, handle) = session(script).await;
        let mut session = session.with_max_message_size(12);

        let raw = session.retrieve(1).await.unwrap();
        assert_eq!(raw, b"0123456789\r\n".to_vec());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_endless_status_line_is_refused() {
        let greeting: &'static str =
            Box::leak(format!("+OK {}", "y".repeat(70 * 1024)).into_boxed_str());
        let (client, server) = duplex(256 * 1024);
        let handle = tokio::spawn(serve(server, vec![(None, greeting)]));
        let result = Pop3Session::login(
            client,
            "feedback",
            &Secret::new("x"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(MailboxError::TooLarge { .. })));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_mailbox() {
        let mut script = login_script();
        script.push((Some("LIST"), "+OK 0 messages\r\n.\r\n"));
        let (mut session, handle) = session(script).await;
        assert!(session.list().await.unwrap().is_empty());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (client, server) = duplex(1024);
        let handle = tokio::spawn(serve(
            server,
            vec![
                (None, "+OK ready\r\n"),
                (Some("USER feedback"), "+OK\r\n"),
                (Some("PASS wrong"), "-ERR invalid password\r\n"),
            ],
        ));
        let result = Pop3Session::login(
            client,
            "feedback",
            &Secret::new("wrong"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            result,
            Err(MailboxError::Rejected {
                command: "PASS",
                ..
            })
        ));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client, _server) = duplex(1024);
        let result = Pop3Session::login(
            client,
            "feedback",
            &Secret::new("x"),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(MailboxError::Timeout(_))));
    }

    #[test]
    fn test_password_not_in_debug() {
        let connector = Pop3Connector::new(
            "pop.example.com",
            995,
            "user",
            Secret::new("hunter2"),
            Duration::from_secs(1),
        );
        assert!(!format!("{connector:?}").contains("hunter2"));
    }
}
