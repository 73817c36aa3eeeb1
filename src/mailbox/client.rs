//! Mailbox protocol client.
//!
//! The poller talks to the mailbox through [`MailboxClient`] and
//! [`MailboxSession`]. [`ImapMailbox`] is the production implementation:
//! raw IMAP4rev1 over TLS with blocking socket I/O run on the blocking pool.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;

/// One message as fetched from the server, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub source: Vec<u8>,
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated session with the folder selected.
///
/// Dropping a session without `logout` closes the underlying connection.
#[async_trait]
pub trait MailboxSession: Send {
    /// Messages without the `\Seen` flag. Fetching does not set the flag.
    async fn fetch_unseen(&mut self) -> Result<Vec<RawMessage>, MailboxError>;

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// IMAP over TLS, verified against the webpki root store.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|e| MailboxError::Protocol(format!("IMAP connect task failed: {e}")))??;
        Ok(Box::new(ImapSession { conn: Some(conn) }))
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn open_session(config: &MailboxConfig) -> Result<ImapConnection<TlsStream>, MailboxError> {
    let connection_failed = |reason: String| MailboxError::ConnectionFailed {
        host: config.host.clone(),
        port: config.port,
        reason,
    };

    let tcp = connect_tcp(&config.host, config.port).map_err(connection_failed)?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| MailboxError::Tls(format!("invalid server name {}: {e}", config.host)))?;
    let tls = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Tls(e.to_string()))?;

    let mut conn = ImapConnection::new(rustls::StreamOwned::new(tls, tcp));
    conn.read_greeting()
        .map_err(|e| connection_failed(e.to_string()))?;
    conn.login(&config.username, config.password.expose_secret())?;
    conn.select(&config.folder)?;
    debug!(host = %config.host, folder = %config.folder, "IMAP session opened");
    Ok(conn)
}

/// Try each resolved address in turn, bounding every attempt.
fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, String> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("resolve failed: {e}"))?;
    let mut last_error = format!("{host} resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_error = format!("{addr}: {e}"),
        }
    }
    Err(last_error)
}

struct ImapSession {
    conn: Option<ImapConnection<TlsStream>>,
}

impl ImapSession {
    /// Run a blocking operation on the connection off the async runtime.
    async fn with_conn<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapConnection<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| MailboxError::Protocol("session already closed".into()))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn fetch_unseen(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        self.with_conn(|conn| conn.fetch_unseen()).await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.with_conn(move |conn| conn.mark_seen(uid)).await
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        let result = self.with_conn(|conn| conn.logout()).await;
        self.conn = None;
        result
    }
}

// ── Protocol ────────────────────────────────────────────────────────

/// A server response line with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Blocking IMAP command/response loop over any byte stream.
struct ImapConnection<S> {
    stream: S,
    next_tag: u32,
}

impl<S: Read + Write> ImapConnection<S> {
    fn new(stream: S) -> Self {
        Self { stream, next_tag: 1 }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte)? {
                0 => return Err(MailboxError::Protocol("connection closed by server".into())),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
            }
        }
    }

    /// Read one logical response: a line plus every literal it announces.
    fn read_response(&mut self) -> Result<Untagged, MailboxError> {
        let mut response = Untagged::default();
        loop {
            let line = self.read_line()?;
            let text = String::from_utf8_lossy(&line).into_owned();
            let literal = literal_len(&text);
            response.text.push_str(&text);
            match literal {
                Some(len) => {
                    let mut data = vec![0u8; len];
                    self.stream.read_exact(&mut data)?;
                    response.literals.push(data);
                }
                None => return Ok(response),
            }
        }
    }

    fn read_greeting(&mut self) -> Result<(), MailboxError> {
        let greeting = self.read_response()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text.trim_end()
            )))
        }
    }

    /// Send a command and collect untagged responses until its completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(rest) = response
                .text
                .strip_prefix(tag.as_str())
                .and_then(|r| r.strip_prefix(' '))
            {
                let status = rest.trim();
                if status.starts_with("OK") {
                    return Ok(untagged);
                }
                let verb = cmd.split_whitespace().next().unwrap_or(cmd);
                return Err(MailboxError::Protocol(format!("{verb} failed: {status}")));
            }
            untagged.push(response);
        }
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("LOGIN {} {}", quote(user), quote(password)))
            .map(|_| ())
            .map_err(|e| {
                warn!(user, error = %e, "IMAP login rejected");
                MailboxError::AuthFailed { user: user.into() }
            })
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.command(&format!("SELECT {}", quote(folder))).map(|_| ())
    }

    fn fetch_unseen(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        let search = self.command("UID SEARCH UNSEEN")?;
        let uids: Vec<u32> = search
            .iter()
            .flat_map(|r| parse_search(&r.text))
            .collect();

        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            let fetched = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
            match fetched
                .into_iter()
                .find(|r| r.text.contains("FETCH") && !r.literals.is_empty())
                .and_then(|r| r.literals.into_iter().next())
            {
                Some(source) => messages.push(RawMessage { uid, source }),
                None => warn!(uid, "IMAP FETCH returned no body, skipping"),
            }
        }
        Ok(messages)
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
            .map(|_| ())
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }
}

/// Length of the literal announced at the end of a response line (`{123}\r\n`).
fn literal_len(line: &str) -> Option<usize> {
    let body = line.trim_end_matches("\r\n").strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from a `* SEARCH ...` response line.
fn parse_search(line: &str) -> Vec<u32> {
    line.strip_prefix("* SEARCH")
        .map(|rest| {
            rest.split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
