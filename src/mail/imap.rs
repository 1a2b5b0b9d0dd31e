//! IMAP folder scanner: raw IMAP over TLS, driven from `spawn_blocking`.
//!
//! Only the handful of commands the responder needs are implemented:
//! LOGIN, SELECT, UID SEARCH ALL, UID FETCH, APPEND and LOGOUT. The
//! connection is generic over the byte stream so the protocol handling can
//! be exercised without a server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::EmailConfig;
use crate::error::MailError;
use crate::mail::message::{MailMessage, ParsedEmail};
use crate::mail::{MailSession, MailSource};

/// TLS stream used against real servers.
pub type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One server line, with the literals embedded in it.
#[derive(Debug)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Untagged lines followed by the tagged completion.
#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    /// Text after the tag, e.g. `OK SELECT completed`.
    status: String,
}

impl Response {
    fn is_ok(&self) -> bool {
        self.status.starts_with("OK")
    }
}

/// A synchronous IMAP client connection.
pub struct ImapConnection<S: Read + Write> {
    stream: BufReader<S>,
    tag: u32,
}

impl<S: Read + Write> ImapConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            tag: 0,
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    /// Read one logical line, pulling in any `{n}` literals it announces.
    fn read_line(&mut self) -> Result<ResponseLine, MailError> {
        let mut text = String::new();
        let mut literals = Vec::new();
        loop {
            let mut buf = Vec::new();
            if self.stream.read_until(b'\n', &mut buf)? == 0 {
                return Err(MailError::Protocol("IMAP connection closed".into()));
            }
            let chunk = String::from_utf8_lossy(&buf);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            text.push_str(chunk);

            match literal_len(chunk) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    literals.push(literal);
                }
                None => return Ok(ResponseLine { text, literals }),
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), MailError> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }

    fn read_until_tagged(&mut self, tag: &str) -> Result<Response, MailError> {
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line
                .text
                .strip_prefix(tag)
                .and_then(|rest| rest.strip_prefix(' '))
            {
                return Ok(Response {
                    untagged,
                    status: status.to_string(),
                });
            }
            untagged.push(line);
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = self.next_tag();
        self.send_line(&format!("{tag} {cmd}"))?;
        self.read_until_tagged(&tag)
    }

    /// Consume the server greeting.
    pub fn read_greeting(&mut self) -> Result<(), MailError> {
        let greeting = self.read_line()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            )))
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(MailError::AuthFailed {
                user: user.to_string(),
            })
        }
    }

    pub fn select(&mut self, folder: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("SELECT {}", quote(folder)))?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(MailError::Select {
                folder: folder.to_string(),
                reason: resp.status,
            })
        }
    }

    /// UIDs of every message in the selected folder, in server order.
    pub fn search_all(&mut self) -> Result<Vec<u32>, MailError> {
        let resp = self.command("UID SEARCH ALL")?;
        if !resp.is_ok() {
            return Err(MailError::Fetch(format!("UID SEARCH failed: {}", resp.status)));
        }
        let mut uids = Vec::new();
        for line in &resp.untagged {
            if let Some(rest) = line.text.strip_prefix("* SEARCH") {
                uids.extend(rest.split_whitespace().filter_map(|n| n.parse::<u32>().ok()));
            }
        }
        Ok(uids)
    }

    /// Raw RFC 822 bytes of one message, or `None` if it vanished meanwhile.
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailError> {
        let resp = self.command(&format!("UID FETCH {uid} (UID RFC822)"))?;
        if !resp.is_ok() {
            return Err(MailError::Fetch(format!(
                "UID FETCH {uid} failed: {}",
                resp.status
            )));
        }
        Ok(resp
            .untagged
            .into_iter()
            .filter(|line| line.text.contains("FETCH"))
            .find_map(|line| line.literals.into_iter().next()))
    }

    /// Store `message` in `folder` flagged as `\Seen`.
    pub fn append(&mut self, folder: &str, message: &[u8]) -> Result<(), MailError> {
        let tag = self.next_tag();
        self.send_line(&format!(
            "{tag} APPEND {} (\\Seen) {{{}}}",
            quote(folder),
            message.len()
        ))?;

        // Wait for the continuation request before sending the literal.
        loop {
            let line = self.read_line()?;
            if line.text.starts_with('+') {
                break;
            }
            if let Some(status) = line.text.strip_prefix(&format!("{tag} ")) {
                return Err(MailError::Append {
                    folder: folder.to_string(),
                    reason: status.to_string(),
                });
            }
        }

        let stream = self.stream.get_mut();
        stream.write_all(message)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;

        let resp = self.read_until_tagged(&tag)?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(MailError::Append {
                folder: folder.to_string(),
                reason: resp.status,
            })
        }
    }

    pub fn logout(&mut self) -> Result<(), MailError> {
        self.command("LOGOUT").map(|_| ())
    }
}

/// Length announced by a trailing `{n}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote a string for use as an IMAP quoted string.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Open a TLS connection, read the greeting and log in (blocking).
pub fn connect_tls(config: &EmailConfig) -> Result<ImapConnection<TlsStream>, MailError> {
    let connect_err = |reason: String| MailError::Connect {
        host: config.imap_host.clone(),
        port: config.imap_port,
        reason,
    };

    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
        .map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| MailError::Tls(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailError::Tls(e.to_string()))?;

    let mut imap = ImapConnection::new(rustls::StreamOwned::new(conn, tcp));
    imap.read_greeting()?;
    imap.login(&config.address, config.password.expose_secret())?;
    Ok(imap)
}

// ── Async session ───────────────────────────────────────────────────

/// An IMAP session usable from async code.
///
/// Each call moves the connection onto the blocking pool and back.
pub struct ImapSession<S: Read + Write + Send + 'static> {
    conn: Option<ImapConnection<S>>,
}

impl<S: Read + Write + Send + 'static> ImapSession<S> {
    pub fn new(conn: ImapConnection<S>) -> Self {
        Self { conn: Some(conn) }
    }

    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapConnection<S>) -> Result<T, MailError> + Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl<S: Read + Write + Send + 'static> MailSession for ImapSession<S> {
    async fn select(&mut self, folder: &str) -> Result<(), MailError> {
        let folder = folder.to_string();
        self.with_conn(move |conn| conn.select(&folder)).await
    }

    async fn list_all(&mut self) -> Result<Vec<Box<dyn MailMessage>>, MailError> {
        let parsed = self
            .with_conn(|conn| {
                let uids = conn.search_all()?;
                let mut messages = Vec::with_capacity(uids.len());
                for uid in uids {
                    match conn.fetch_raw(uid)? {
                        Some(raw) => match ParsedEmail::parse(uid, &raw) {
                            Some(msg) => messages.push(msg),
                            None => warn!(uid, "Skipping message that failed to parse"),
                        },
                        None => debug!(uid, "Message disappeared before fetch"),
                    }
                }
                Ok(messages)
            })
            .await?;

        Ok(parsed
            .into_iter()
            .map(|m| Box::new(m) as Box<dyn MailMessage>)
            .collect())
    }

    async fn append(&mut self, folder: &str, raw: Vec<u8>) -> Result<(), MailError> {
        let folder = folder.to_string();
        self.with_conn(move |conn| conn.append(&folder, &raw)).await
    }

    async fn logout(&mut self) {
        if let Err(e) = self.with_conn(|conn| conn.logout()).await {
            debug!("IMAP logout failed: {e}");
        }
        self.conn = None;
    }
}

/// Opens TLS IMAP sessions for the configured account.
pub struct ImapMailSource {
    config: EmailConfig,
}

impl ImapMailSource {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn connect(&self) -> Result<Box<dyn MailSession>, MailError> {
        let cfg = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || connect_tls(&cfg))
            .await
            .map_err(|e| MailError::Task(e.to_string()))??;
        debug!(host = %self.config.imap_host, "IMAP session opened");
        Ok(Box::new(ImapSession::new(conn)))
    }
}
