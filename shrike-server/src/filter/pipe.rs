use std::io;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::timeout;
use tracing::debug;

use smtp::MessageHost;

use crate::config::Cfg;

use super::process::{self, Pipes};
use super::reject_line::RejectBuffer;
use super::{settle, FilterError, Verdict};

/// Runs the message body through the filter's stdin and captures its stdout
/// as the replacement body. Stderr feeds the reject accumulator, and the
/// exit code decides the verdict.
pub async fn run<H: MessageHost>(
    host: &mut H,
    cfg: &Cfg,
    command: &str,
) -> Result<Verdict, FilterError> {
    let mut child = process::spawn(
        host,
        command,
        Pipes {
            stdin: true,
            stdout: true,
            stderr: true,
        },
    )?;
    let mut reject = RejectBuffer::new();
    let pumped = pump(host, cfg, &mut child, &mut reject).await;
    settle(&mut child, cfg, pumped, reject).await
}

enum Event {
    In(io::Result<usize>),
    Out(io::Result<usize>),
    ErrOut(io::Result<usize>),
    Quit,
}

/// The three-stream pump: body chunks flow to the filter's stdin while its
/// stdout and stderr drain concurrently, so a stalled child can never wedge
/// the session. Each turn of the loop gets a fresh deadline.
async fn pump<H: MessageHost>(
    host: &mut H,
    cfg: &Cfg,
    child: &mut Child,
    reject: &mut RejectBuffer,
) -> Result<(), FilterError> {
    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let shutdown = host.shutdown();

    host.begin_rewrite().await?;

    let mut ibuf = Bytes::new();
    let mut obuf = [0u8; 1024];
    let mut ebuf = [0u8; 1024];
    let mut wrote: u64 = 0;
    let mut read_back: u64 = 0;

    while stdin.is_some() || stdout.is_some() || stderr.is_some() {
        if stdin.is_some() && ibuf.is_empty() {
            match host.read_body().await? {
                Some(chunk) => ibuf = chunk,
                None => stdin = None, // end of input: close the filter's stdin
            }
            continue;
        }

        let (stdin_open, stdout_open, stderr_open) =
            (stdin.is_some(), stdout.is_some(), stderr.is_some());
        let step = async {
            tokio::select! {
                r = async { stdin.as_mut().unwrap().write(&ibuf).await }, if stdin_open => Event::In(r),
                r = async { stdout.as_mut().unwrap().read(&mut obuf).await }, if stdout_open => Event::Out(r),
                r = async { stderr.as_mut().unwrap().read(&mut ebuf).await }, if stderr_open => Event::ErrOut(r),
                _ = shutdown.cancelled() => Event::Quit,
            }
        };
        let event = timeout(cfg.timeout(), step)
            .await
            .map_err(|_| FilterError::Timeout)?;

        match event {
            Event::In(Ok(n)) => {
                wrote += n as u64;
                ibuf.advance(n);
            }
            Event::In(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The filter stopped reading early; that's its prerogative.
                // Eat the rest of the body so the client stays in sync.
                debug!("filter command closed input early");
                while host.read_body().await?.is_some() {}
                ibuf = Bytes::new();
                stdin = None;
            }
            Event::In(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Event::In(Err(e)) => return Err(e.into()),

            Event::Out(Ok(0)) => stdout = None,
            Event::Out(Ok(n)) => {
                read_back += n as u64;
                host.write_rewrite(&obuf[..n]).await?;
            }
            Event::Out(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Event::Out(Err(e)) => return Err(e.into()),

            Event::ErrOut(Ok(0)) => stderr = None,
            Event::ErrOut(Ok(n)) => reject.append(&ebuf[..n]),
            Event::ErrOut(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Event::ErrOut(Err(e)) => return Err(e.into()),

            Event::Quit => return Err(FilterError::Cancelled),
        }
    }

    debug!(wrote, read_back, "filter stream totals");
    host.finish_rewrite().await?;
    Ok(())
}
