use std::io;

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use smtp::MessageHost;

use crate::config::Cfg;

use super::process::{self, Pipes};
use super::reject_line::RejectBuffer;
use super::{settle, FilterError, Verdict};

/// Commits the message to the cache file and lets the filter inspect it in
/// place; the filter finds the path in `$EMAIL` and its exit code is the
/// verdict. The cache file itself is the deliverable — nothing is rewritten.
pub async fn run<H: MessageHost>(
    host: &mut H,
    cfg: &Cfg,
    command: &str,
) -> Result<Verdict, FilterError> {
    host.cache_body().await?;

    let mut child = process::spawn(
        host,
        command,
        Pipes {
            stdin: false,
            stdout: false,
            stderr: true,
        },
    )?;
    let mut reject = RejectBuffer::new();
    let pumped = drain_stderr(host.shutdown(), cfg, &mut child, &mut reject).await;
    settle(&mut child, cfg, pumped, reject).await
}

async fn drain_stderr(
    shutdown: CancellationToken,
    cfg: &Cfg,
    child: &mut Child,
    reject: &mut RejectBuffer,
) -> Result<(), FilterError> {
    let Some(mut stderr) = child.stderr.take() else {
        return Ok(());
    };
    let mut ebuf = [0u8; 1024];
    loop {
        let step = async {
            tokio::select! {
                r = stderr.read(&mut ebuf) => Some(r),
                _ = shutdown.cancelled() => None,
            }
        };
        match timeout(cfg.timeout(), step).await {
            Err(_) => return Err(FilterError::Timeout),
            Ok(None) => return Err(FilterError::Cancelled),
            Ok(Some(Ok(0))) => return Ok(()),
            Ok(Some(Ok(n))) => reject.append(&ebuf[..n]),
            Ok(Some(Err(e))) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Some(Err(e))) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterType;
    use crate::filter::testing::{test_cfg, MockHost};

    fn cfg(command: &str) -> Cfg {
        test_cfg(FilterType::File, command)
    }

    #[tokio::test]
    async fn clean_exit_accepts_and_leaves_the_cache_alone() {
        let body = b"Subject: check\r\n\r\ncontent\r\n";
        let mut host = MockHost::new(body);
        let command = "exit 0";
        let verdict = run(&mut host, &cfg(command), command).await.unwrap();
        assert_eq!(verdict, Verdict::Accept);
        let cached = std::fs::read(host.cache.as_ref().unwrap()).unwrap();
        assert_eq!(cached, body);
        assert!(host.rewrite.is_empty());
    }

    #[tokio::test]
    async fn filter_sees_the_cache_path() {
        let mut host = MockHost::new(b"find me\r\n");
        let command = "grep -q find \"$EMAIL\"";
        let verdict = run(&mut host, &cfg(command), command).await.unwrap();
        assert_eq!(verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn nonzero_exit_rejects_with_the_stderr_line() {
        let mut host = MockHost::new(b"content\r\n");
        let command = "echo \"551 not today\" 1>&2; exit 2";
        let verdict = run(&mut host, &cfg(command), command).await.unwrap();
        assert_eq!(verdict, Verdict::Reject("551 not today".to_string()));
    }

    #[tokio::test]
    async fn stuck_filter_times_out() {
        let mut host = MockHost::new(b"content\r\n");
        let command = "sleep 120";
        let mut cfg = cfg(command);
        cfg.timeout = 1;
        let err = run(&mut host, &cfg, command).await;
        assert!(matches!(err, Err(FilterError::Timeout)));
    }
}
