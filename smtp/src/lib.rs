use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use miette::{Diagnostic, IntoDiagnostic, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod parser;
pub mod spool;

use parser::{parse_command, SmtpCommand};
use spool::{Spool, SpoolFile};

/// Longest client command line we accept.
const MAX_LINE: usize = 2000;

/// Longest SMTP reply we buffer before giving up on the peer.
const MAX_REPLY: usize = 4096;

/// End-of-message marker in the DATA stream.
const DATA_END: &[u8] = b"\r\n.\r\n";

/// Generic failure reply when a filter produced no diagnostic of its own.
const DATA_FAILED: &str = "451 Local Error";

#[async_trait]
pub trait SmtpStream: AsyncRead + AsyncWrite + Unpin + Send {
    async fn write_line(&mut self, line: &[u8]) -> Result<(), SmtpError> {
        self.write_all(line).await?;
        self.write_all(b"\r\n").await?;
        Ok(())
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SmtpStream for T {}

#[derive(Debug, Error, Diagnostic)]
pub enum SmtpError {
    #[error("I/O error")]
    #[diagnostic(code(smtp::io_error))]
    IoError(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    #[diagnostic(code(smtp::protocol_error))]
    ProtocolError(String),
}

/// A complete (possibly multi-line) SMTP reply. `raw` keeps the exact bytes
/// so a relay can forward the reply untouched.
#[derive(Debug)]
pub struct Reply {
    pub raw: Bytes,
}

impl Reply {
    /// The 3-digit code of the first line, or `""` when the peer sent
    /// something that doesn't look like a reply.
    pub fn code(&self) -> &str {
        if self.raw.len() >= 3 && self.raw[..3].iter().all(u8::is_ascii_digit) {
            std::str::from_utf8(&self.raw[..3]).unwrap_or("")
        } else {
            ""
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code() == code
    }

    /// The reply as text, right-trimmed.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).trim_end().to_string()
    }
}

/// Reads one SMTP reply from `stream`, following continuation lines
/// (`250-…`) until the final line. `buf` carries partial data between calls
/// on the same stream.
pub async fn read_reply<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Reply, SmtpError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut line_start = 0;
    loop {
        while let Some(nl) = memchr::memmem::find(&buf[line_start..], b"\r\n") {
            let line_end = line_start + nl;
            let done = line_end - line_start < 4 || buf[line_start + 3] != b'-';
            if done {
                let raw = buf.split_to(line_end + 2).freeze();
                return Ok(Reply { raw });
            }
            line_start = line_end + 2;
        }

        if buf.len() >= MAX_REPLY {
            return Err(SmtpError::ProtocolError("reply too long".to_string()));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(SmtpError::ProtocolError(
                "connection closed while awaiting reply".to_string(),
            ));
        }
    }
}

/// Outcome of the pre-data hook.
#[derive(Debug, PartialEq)]
pub enum Hook {
    /// Carry on with the data phase.
    Proceed,
    /// The hook already answered the client; skip the data phase.
    Handled,
}

/// Hooks the proxy engine calls on the message path.
///
/// `on_envelope` runs when the client issues DATA, before anything is sent
/// on; `on_message` is the data hook proper and must produce exactly one
/// verdict through the session (`done_data`, `fail_data` or `fail_msg`).
#[async_trait]
pub trait ProxyCallbacks: Send + Sync {
    async fn on_envelope(&self, session: &mut Session) -> Result<Hook, SmtpError>;
    async fn on_message(&self, session: &mut Session) -> Result<(), SmtpError>;
}

/// What a filter driver may ask of the session it is filtering for.
///
/// The engine's `Session` implements this; tests substitute mocks.
#[async_trait]
pub trait MessageHost: Send {
    fn sender(&self) -> Option<&str>;
    fn recipients(&self) -> &[String];
    fn helo(&self) -> Option<&str>;
    fn peer_name(&self) -> &str;
    fn cache_path(&self) -> Option<&Utf8Path>;

    /// Environment published to a spawned filter process.
    fn filter_env(&self) -> Vec<(String, String)>;

    /// Cooperative shutdown signal; drivers abort their I/O loops on it.
    fn shutdown(&self) -> CancellationToken;

    /// Appends a structured field to the per-message log line.
    fn add_log(&mut self, key: &str, value: &str);

    /// Commits the whole message body to the cache file.
    async fn cache_body(&mut self) -> io::Result<()>;

    /// Pulls the next chunk of the message body; `None` at the end.
    async fn read_body(&mut self) -> io::Result<Option<Bytes>>;

    /// Opens the rewrite spool that will replace the message body.
    async fn begin_rewrite(&mut self) -> io::Result<()>;
    async fn write_rewrite(&mut self, chunk: &[u8]) -> io::Result<()>;
    async fn finish_rewrite(&mut self) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Upstream SMTP server the proxy relays to.
    pub upstream: String,
    /// Directory for spool files.
    pub spool_dir: Utf8PathBuf,
    /// Keep spool files instead of deleting them.
    pub keep_spool: bool,
}

/// The proxy engine: accepts a client connection, relays the SMTP dialog to
/// the upstream server, and hands the data phase to the callbacks.
#[derive(Clone)]
pub struct ProxyServer {
    callbacks: Arc<dyn ProxyCallbacks>,
    options: Arc<ProxyOptions>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new<C: ProxyCallbacks + 'static>(
        callbacks: C,
        options: ProxyOptions,
        shutdown: CancellationToken,
    ) -> Self {
        ProxyServer {
            callbacks: Arc::new(callbacks),
            options: Arc::new(options),
            shutdown,
        }
    }

    /// Handles one accepted client connection, dialing the configured
    /// upstream for it.
    pub async fn handle_client(
        &self,
        socket: TcpStream,
        peer: std::net::SocketAddr,
    ) -> Result<()> {
        let upstream = match TcpStream::connect(&self.options.upstream).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let mut socket = socket;
                let _ = socket.write_line(b"421 Service not available").await;
                return Err(e).into_diagnostic();
            }
        };
        self.handle_connection(Box::new(socket), Box::new(upstream), peer.ip().to_string())
            .await
    }

    /// Runs a session over already-established streams. Split out from
    /// `handle_client` so tests can drive the engine over in-memory pipes.
    pub async fn handle_connection(
        &self,
        client: Box<dyn SmtpStream>,
        upstream: Box<dyn SmtpStream>,
        peer_name: String,
    ) -> Result<()> {
        let mut session = Session {
            client,
            upstream,
            peer_name,
            client_buf: BytesMut::with_capacity(4096),
            upstream_buf: BytesMut::with_capacity(4096),
            helo: None,
            sender: None,
            recipients: Vec::new(),
            capture: Capture::default(),
            spool: Spool::new(&self.options.spool_dir, self.options.keep_spool),
            cache: None,
            rewrite: None,
            log_fields: Vec::new(),
            shutdown: self.shutdown.clone(),
        };
        session.run(self.callbacks.as_ref()).await.into_diagnostic()
    }
}

#[derive(Debug, Default)]
struct Capture {
    /// The client was told to start transmitting.
    started: bool,
    /// The terminator has been consumed.
    done: bool,
    /// No body bytes seen yet (a leading `.\r\n` ends an empty message).
    at_start: bool,
}

/// One inbound connection and the message currently being transmitted on it.
pub struct Session {
    client: Box<dyn SmtpStream>,
    upstream: Box<dyn SmtpStream>,
    peer_name: String,
    client_buf: BytesMut,
    upstream_buf: BytesMut,
    helo: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    capture: Capture,
    spool: Spool,
    cache: Option<SpoolFile>,
    rewrite: Option<SpoolFile>,
    log_fields: Vec<(String, String)>,
    shutdown: CancellationToken,
}

impl Session {
    async fn run(&mut self, callbacks: &dyn ProxyCallbacks) -> Result<(), SmtpError> {
        // Relay the upstream greeting.
        let greeting = read_reply(&mut self.upstream, &mut self.upstream_buf).await?;
        self.client.write_all(&greeting.raw).await?;

        loop {
            let line = match self.read_client_line().await? {
                Some(line) => line,
                None => return Ok(()),
            };
            let text = String::from_utf8_lossy(&line).trim_end().to_string();

            match parse_command(&text) {
                SmtpCommand::Helo(name) | SmtpCommand::Ehlo(name) => {
                    let reply = self.relay(&line).await?;
                    if reply.code().starts_with('2') {
                        self.helo = Some(name);
                    }
                }
                SmtpCommand::MailFrom(sender) => {
                    let reply = self.relay(&line).await?;
                    if reply.code().starts_with('2') {
                        self.sender = Some(sender);
                    }
                }
                SmtpCommand::RcptTo(rcpt) => {
                    let reply = self.relay(&line).await?;
                    if reply.code().starts_with('2') {
                        self.recipients.push(rcpt);
                    }
                }
                SmtpCommand::Rset => {
                    let reply = self.relay(&line).await?;
                    if reply.code().starts_with('2') {
                        self.reset_envelope();
                    }
                }
                SmtpCommand::Data => {
                    // DATA is never forwarded here: the upstream sees it only
                    // from done_data, after the filter accepted the message.
                    let result: Result<(), SmtpError> = async {
                        if callbacks.on_envelope(self).await? == Hook::Proceed {
                            callbacks.on_message(self).await?;
                        }
                        Ok(())
                    }
                    .await;
                    self.finish_message();
                    result?;
                }
                SmtpCommand::Quit => {
                    self.relay(&line).await?;
                    return Ok(());
                }
                SmtpCommand::Noop | SmtpCommand::Unknown => {
                    self.relay(&line).await?;
                }
            }
        }
    }

    /// Reads one CRLF-terminated line from the client, raw bytes included.
    async fn read_client_line(&mut self) -> Result<Option<BytesMut>, SmtpError> {
        loop {
            if let Some(pos) = memchr::memmem::find(&self.client_buf, b"\r\n") {
                return Ok(Some(self.client_buf.split_to(pos + 2)));
            }
            if self.client_buf.len() > MAX_LINE {
                return Err(SmtpError::ProtocolError(
                    "client command line too long".to_string(),
                ));
            }
            let n = self.client.read_buf(&mut self.client_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Forwards one client command to the upstream and relays the reply back
    /// verbatim.
    async fn relay(&mut self, line: &[u8]) -> Result<Reply, SmtpError> {
        self.upstream.write_all(line).await?;
        let reply = read_reply(&mut self.upstream, &mut self.upstream_buf).await?;
        self.client.write_all(&reply.raw).await?;
        Ok(reply)
    }

    /// Tells the client to start transmitting the message body.
    pub async fn start_data(&mut self) -> Result<(), SmtpError> {
        self.client
            .write_line(b"354 End data with <CR><LF>.<CR><LF>")
            .await?;
        self.capture = Capture {
            started: true,
            done: false,
            at_start: true,
        };
        Ok(())
    }

    /// Commits the accepted message: DATA to the upstream, optional header,
    /// the deliverable body (the rewrite spool when a filter produced one,
    /// else the cache), and relays the upstream's final reply to the client.
    pub async fn done_data(&mut self, header: Option<&str>) -> Result<(), SmtpError> {
        // The body must be fully consumed before we talk to the client again.
        while self.read_body().await?.is_some() {}

        self.upstream.write_line(b"DATA").await?;
        let reply = read_reply(&mut self.upstream, &mut self.upstream_buf).await?;
        if !reply.has_code("354") {
            self.client.write_all(&reply.raw).await?;
            return Err(SmtpError::ProtocolError(format!(
                "upstream refused DATA: {}",
                reply.text()
            )));
        }

        if let Some(header) = header {
            self.upstream.write_line(header.as_bytes()).await?;
        }

        let path = self
            .rewrite
            .as_ref()
            .or(self.cache.as_ref())
            .map(|spool| spool.path().to_owned())
            .ok_or_else(|| SmtpError::ProtocolError("no message body to deliver".to_string()))?;
        let mut file = tokio::fs::File::open(&path).await?;
        let mut chunk = [0u8; 4096];
        let mut tail = [b'\r', b'\n'];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.upstream.write_all(&chunk[..n]).await?;
            if n >= 2 {
                tail = [chunk[n - 2], chunk[n - 1]];
            } else {
                tail = [tail[1], chunk[0]];
            }
        }
        if tail != *b"\r\n" {
            self.upstream.write_all(b"\r\n").await?;
        }
        self.upstream.write_line(b".").await?;

        let reply = read_reply(&mut self.upstream, &mut self.upstream_buf).await?;
        self.client.write_all(&reply.raw).await?;
        if !reply.has_code("250") {
            return Err(SmtpError::ProtocolError(format!(
                "upstream rejected message: {}",
                reply.text()
            )));
        }
        Ok(())
    }

    /// Rejects the message at the data phase with the given reply line, or a
    /// generic failure when the filter produced none.
    pub async fn fail_data(&mut self, line: Option<&str>) -> Result<(), SmtpError> {
        // Keep the client in sync: discard whatever body is still in flight.
        while matches!(self.read_body().await, Ok(Some(_))) {}
        let reply = line.unwrap_or(DATA_FAILED);
        self.client.write_line(reply.trim_end().as_bytes()).await?;
        self.reset_upstream().await;
        Ok(())
    }

    /// Pre-data rejection: answers the DATA command itself.
    pub async fn fail_msg(&mut self, line: &str) -> Result<(), SmtpError> {
        self.client.write_line(line.trim_end().as_bytes()).await?;
        self.reset_upstream().await;
        Ok(())
    }

    /// Best-effort RSET so the upstream's envelope matches ours again.
    async fn reset_upstream(&mut self) {
        let result: Result<(), SmtpError> = async {
            self.upstream.write_line(b"RSET").await?;
            read_reply(&mut self.upstream, &mut self.upstream_buf).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("couldn't reset upstream after rejected message: {e}");
        }
    }

    /// Emits the per-message log line and resets transaction state.
    fn finish_message(&mut self) {
        let from = self.sender.as_deref().unwrap_or("").to_string();
        let to = self.recipients.join(",");
        let mut line = format!("from={from}, to={to}, client={}", self.peer_name);
        for (key, value) in self.log_fields.drain(..) {
            line.push_str(&format!(", {key}={value}"));
        }
        info!("{line}");

        self.reset_envelope();
    }

    fn reset_envelope(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.capture = Capture::default();
        self.cache = None;
        self.rewrite = None;
    }
}

#[async_trait]
impl MessageHost for Session {
    fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    fn recipients(&self) -> &[String] {
        &self.recipients
    }

    fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn cache_path(&self) -> Option<&Utf8Path> {
        self.cache.as_ref().map(|cache| cache.path())
    }

    fn filter_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("CLIENT".to_string(), self.peer_name.clone())];
        if let Some(cache) = &self.cache {
            env.push(("EMAIL".to_string(), cache.path().to_string()));
        }
        if let Some(sender) = &self.sender {
            env.push(("SENDER".to_string(), sender.clone()));
        }
        if !self.recipients.is_empty() {
            env.push(("RECIPIENTS".to_string(), self.recipients.join("\n")));
        }
        if let Some(helo) = &self.helo {
            env.push(("HELO".to_string(), helo.clone()));
        }
        env
    }

    fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn add_log(&mut self, key: &str, value: &str) {
        self.log_fields.push((key.to_string(), value.to_string()));
    }

    async fn cache_body(&mut self) -> io::Result<()> {
        if self.cache.is_some() {
            return Ok(());
        }
        let mut file = self.spool.create("msg").await?;
        while let Some(chunk) = self.read_body().await? {
            file.write(&chunk).await?;
        }
        file.finish().await?;
        self.cache = Some(file);
        Ok(())
    }

    async fn read_body(&mut self) -> io::Result<Option<Bytes>> {
        if !self.capture.started || self.capture.done {
            return Ok(None);
        }
        loop {
            // An empty message is just the terminator's final line.
            if self.capture.at_start && self.client_buf.starts_with(b".\r\n") {
                self.client_buf.advance(3);
                self.capture.done = true;
                return Ok(None);
            }

            if let Some(pos) = memchr::memmem::find(&self.client_buf, DATA_END) {
                let chunk = self.client_buf.split_to(pos + 2);
                self.client_buf.advance(3);
                self.capture.done = true;
                self.capture.at_start = false;
                if chunk.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(chunk.freeze()));
            }

            // Hold back enough bytes that a terminator split across reads is
            // still found whole.
            if self.client_buf.len() > DATA_END.len() - 1 {
                let emit = self.client_buf.len() - (DATA_END.len() - 1);
                let chunk = self.client_buf.split_to(emit);
                self.capture.at_start = false;
                return Ok(Some(chunk.freeze()));
            }

            let n = self.client.read_buf(&mut self.client_buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed connection during message data",
                ));
            }
        }
    }

    async fn begin_rewrite(&mut self) -> io::Result<()> {
        self.rewrite = Some(self.spool.create("out").await?);
        Ok(())
    }

    async fn write_rewrite(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.rewrite.as_mut() {
            Some(rewrite) => rewrite.write(chunk).await,
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rewrite spool not open",
            )),
        }
    }

    async fn finish_rewrite(&mut self) -> io::Result<()> {
        match self.rewrite.as_mut() {
            Some(rewrite) => rewrite.finish().await,
            None => Ok(()),
        }
    }
}
