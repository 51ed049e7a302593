use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use smtp::{read_reply, MessageHost, Reply};

use crate::config::Cfg;

use super::{FilterError, Verdict};

/// Name we introduce ourselves with to the downstream MTA.
const EHLO_NAME: &str = "shrike";

/// Hands the message to a downstream MTA over an XCLIENT-extended dialog,
/// so the downstream judges it as if it came straight from the original
/// client. The downstream's reply decides the verdict.
pub async fn run<H: MessageHost>(
    host: &mut H,
    cfg: &Cfg,
    address: &str,
) -> Result<Verdict, FilterError> {
    let sender = match host.sender() {
        Some(sender) => sender.to_string(),
        None => return Err(FilterError::Envelope),
    };
    let recipients = host.recipients().to_vec();
    if recipients.is_empty() {
        return Err(FilterError::Envelope);
    }

    host.cache_body().await?;

    let addr = resolve(address).await?;
    let wait = cfg.timeout();
    let mut stream = timeout(wait, TcpStream::connect(addr))
        .await
        .map_err(|_| FilterError::Timeout)??;
    let mut buf = BytesMut::with_capacity(4096);
    debug!(%addr, "connected to downstream filter");

    exchange(&mut stream, &mut buf, None, Some("220"), wait).await?;
    exchange(
        &mut stream,
        &mut buf,
        Some(&format!("EHLO {EHLO_NAME}")),
        Some("250"),
        wait,
    )
    .await?;

    // XCLIENT makes the downstream see the original client, not us.
    let mut xclient = format!(
        "XCLIENT ADDR={}{}",
        if host.peer_name().contains(':') {
            "IPv6:"
        } else {
            ""
        },
        host.peer_name()
    );
    if let Some(helo) = host.helo() {
        xclient.push_str(&format!(" HELO={helo}"));
    }
    exchange(&mut stream, &mut buf, Some(&xclient), Some("220"), wait).await?;

    exchange(
        &mut stream,
        &mut buf,
        Some(&format!("MAIL FROM: {sender}")),
        Some("250"),
        wait,
    )
    .await?;

    for rcpt in &recipients {
        let reply = exchange(
            &mut stream,
            &mut buf,
            Some(&format!("RCPT TO: {rcpt}")),
            None,
            wait,
        )
        .await?;
        if !reply.has_code("250") {
            // The downstream refused this recipient; its reply goes to the
            // sender verbatim.
            return Ok(Verdict::Reject(reply.text()));
        }
    }

    exchange(&mut stream, &mut buf, Some("DATA"), Some("354"), wait).await?;

    let path = host
        .cache_path()
        .ok_or_else(|| FilterError::Protocol("message body not cached".to_string()))?;
    let mut file = tokio::fs::File::open(path).await?;
    let mut chunk = [0u8; 4096];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        timeout(wait, stream.write_all(&chunk[..n]))
            .await
            .map_err(|_| FilterError::Timeout)??;
    }

    let reply = exchange(&mut stream, &mut buf, Some("."), None, wait).await?;
    let _ = exchange(&mut stream, &mut buf, Some("QUIT"), None, wait).await;

    if reply.has_code("250") {
        Ok(Verdict::Accept)
    } else {
        Ok(Verdict::Reject(reply.text()))
    }
}

/// Resolves the configured downstream address. A bare IPv4 literal keeps
/// its legacy meaning of port 25; anything else is host:port.
async fn resolve(address: &str) -> Result<SocketAddr, FilterError> {
    if let Ok(ip) = address.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::from((ip, 25)));
    }
    lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| FilterError::Protocol(format!("cannot resolve downstream address: {address}")))
}

/// Sends one command (when given) and reads one reply, each bounded by the
/// configured timeout. With an expected code, any other reply is a protocol
/// error carrying the downstream's text.
async fn exchange<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    send: Option<&str>,
    expect: Option<&str>,
    wait: Duration,
) -> Result<Reply, FilterError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(line) = send {
        let mut wire = line.to_string();
        wire.push_str("\r\n");
        timeout(wait, stream.write_all(wire.as_bytes()))
            .await
            .map_err(|_| FilterError::Timeout)??;
    }
    let reply = timeout(wait, read_reply(stream, buf))
        .await
        .map_err(|_| FilterError::Timeout)??;
    if let Some(code) = expect {
        if !reply.has_code(code) {
            return Err(FilterError::Protocol(format!(
                "expected {code} in response to {:?}, got: {}",
                send.unwrap_or("(greeting)"),
                reply.text()
            )));
        }
    }
    Ok(reply)
}
