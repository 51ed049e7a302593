/// The filter dispatcher: implements the proxy engine's hooks, selects the
/// configured backend for each message, and folds its verdict back into the
/// SMTP session.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use smtp::{Hook, MessageHost, ProxyCallbacks, Session, SmtpError};

use crate::config::{Cfg, FilterType};
use crate::filter::{self, Verdict};

pub struct FilterDispatch {
    cfg: Arc<Cfg>,
}

impl FilterDispatch {
    pub fn new(cfg: Arc<Cfg>) -> Self {
        FilterDispatch { cfg }
    }
}

#[async_trait]
impl ProxyCallbacks for FilterDispatch {
    async fn on_envelope(&self, session: &mut Session) -> Result<Hook, SmtpError> {
        if self.cfg.filter_type == FilterType::Reject {
            session.add_log("status", "REJECTED");
            session.fail_msg(&self.cfg.reject).await?;
            return Ok(Hook::Handled);
        }
        Ok(Hook::Proceed)
    }

    async fn on_message(&self, session: &mut Session) -> Result<(), SmtpError> {
        if self.cfg.filter_type == FilterType::Reject {
            session.add_log("status", "REJECTED");
            return session.fail_data(Some(&self.cfg.reject)).await;
        }

        session.start_data().await?;

        let Some(command) = self.cfg.command.as_deref() else {
            warn!("no filter command specified, passing message through");
            session.cache_body().await?;
            if let Err(e) = session.done_data(self.cfg.header.as_deref()).await {
                session.add_log("status", "FILTER-ERROR");
                return Err(e);
            }
            session.add_log("status", "PASSED");
            return Ok(());
        };

        match filter::dispatch(session, &self.cfg, command).await {
            Ok(Verdict::Accept) => {
                if let Err(e) = session.done_data(self.cfg.header.as_deref()).await {
                    session.add_log("status", "FILTER-ERROR");
                    return Err(e);
                }
                session.add_log("status", "FILTERED");
            }
            Ok(Verdict::Reject(line)) => {
                session.fail_data(Some(&line)).await?;
                session.add_log("status", &line);
            }
            Err(e) => {
                error!("filter failed: {e}");
                session.add_log("status", "FILTER-ERROR");
                session.fail_data(None).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::test_cfg;
    use camino::Utf8PathBuf;
    use smtp::{ProxyOptions, ProxyServer};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn server_for(cfg: Cfg) -> ProxyServer {
        let options = ProxyOptions {
            upstream: String::new(),
            spool_dir: Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap(),
            keep_spool: false,
        };
        ProxyServer::new(
            FilterDispatch::new(Arc::new(cfg)),
            options,
            CancellationToken::new(),
        )
    }

    async fn read_line(stream: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if stream.read_exact(&mut byte).await.is_err() {
                return String::from_utf8_lossy(&line).to_string();
            }
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                return String::from_utf8(line).unwrap();
            }
        }
    }

    /// Scripted upstream MTA for full-session tests; reports every command
    /// line and any received message body on the channel.
    async fn mock_upstream(mut stream: DuplexStream, report: mpsc::UnboundedSender<Vec<u8>>) {
        stream.write_all(b"220 upstream ESMTP\r\n").await.unwrap();
        loop {
            let line = read_line(&mut stream).await;
            if line.is_empty() {
                return;
            }
            report.send(line.clone().into_bytes()).unwrap();
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("DATA") {
                stream.write_all(b"354 go ahead\r\n").await.unwrap();
                let mut body = Vec::new();
                let mut byte = [0u8; 1];
                while !body.ends_with(b"\r\n.\r\n") {
                    stream.read_exact(&mut byte).await.unwrap();
                    body.push(byte[0]);
                }
                body.truncate(body.len() - 5);
                report.send(body).unwrap();
                stream.write_all(b"250 queued\r\n").await.unwrap();
            } else if upper.starts_with("QUIT") {
                stream.write_all(b"221 bye\r\n").await.unwrap();
                return;
            } else {
                stream.write_all(b"250 OK\r\n").await.unwrap();
            }
        }
    }

    struct Run {
        client: DuplexStream,
        upstream_log: mpsc::UnboundedReceiver<Vec<u8>>,
        engine: tokio::task::JoinHandle<miette::Result<()>>,
    }

    fn start(cfg: Cfg) -> Run {
        let (client_near, client_far) = duplex(512 * 1024);
        let (upstream_near, upstream_far) = duplex(512 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();

        let server = server_for(cfg);
        let engine = tokio::spawn(async move {
            server
                .handle_connection(
                    Box::new(client_far),
                    Box::new(upstream_near),
                    "192.0.2.9".to_string(),
                )
                .await
        });
        tokio::spawn(mock_upstream(upstream_far, tx));
        Run {
            client: client_near,
            upstream_log: rx,
            engine,
        }
    }

    async fn send_envelope(client: &mut DuplexStream) {
        assert!(read_line(client).await.starts_with("220"));
        client.write_all(b"EHLO test\r\n").await.unwrap();
        assert!(read_line(client).await.starts_with("250"));
        client
            .write_all(b"MAIL FROM: <a@example.com>\r\n")
            .await
            .unwrap();
        assert!(read_line(client).await.starts_with("250"));
        client
            .write_all(b"RCPT TO: <b@example.com>\r\n")
            .await
            .unwrap();
        assert!(read_line(client).await.starts_with("250"));
    }

    async fn quit(mut run: Run) -> Vec<Vec<u8>> {
        run.client.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("221"));
        drop(run.client);
        run.engine.await.unwrap().unwrap();
        let mut log = Vec::new();
        while let Ok(entry) = run.upstream_log.try_recv() {
            log.push(entry);
        }
        log
    }

    #[tokio::test]
    async fn reject_policy_answers_data_with_the_configured_line() {
        let mut cfg = test_cfg(FilterType::Reject, "");
        cfg.command = None;
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert_eq!(
            read_line(&mut run.client).await.trim_end(),
            "530 Email Rejected"
        );

        let log = quit(run).await;
        assert!(!log.iter().any(|entry| entry.starts_with(b"DATA")));
    }

    #[tokio::test]
    async fn missing_command_passes_the_message_through() {
        let mut cfg = test_cfg(FilterType::Pipe, "");
        cfg.command = None;
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("354"));
        run.client
            .write_all(b"Subject: hi\r\n\r\nuntouched\r\n.\r\n")
            .await
            .unwrap();
        assert!(read_line(&mut run.client).await.starts_with("250"));

        let log = quit(run).await;
        assert!(log.contains(&b"Subject: hi\r\n\r\nuntouched".to_vec()));
    }

    #[tokio::test]
    async fn cat_filter_delivers_the_body_intact() {
        let cfg = test_cfg(FilterType::Pipe, "cat");
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("354"));
        run.client
            .write_all(b"Subject: hi\r\n\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        assert!(read_line(&mut run.client).await.starts_with("250"));

        let log = quit(run).await;
        assert!(log.contains(&b"Subject: hi\r\n\r\nbody".to_vec()));
    }

    #[tokio::test]
    async fn accepted_messages_get_the_configured_header() {
        let mut cfg = test_cfg(FilterType::Pipe, "cat");
        cfg.header = Some("X-Filtered: shrike".to_string());
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("354"));
        run.client.write_all(b"body\r\n.\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("250"));

        let log = quit(run).await;
        assert!(log.contains(&b"X-Filtered: shrike\r\nbody".to_vec()));
    }

    #[tokio::test]
    async fn filter_timeout_fails_the_message_generically() {
        let mut cfg = test_cfg(FilterType::Pipe, "cat >/dev/null; sleep 120");
        cfg.timeout = 1;
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("354"));
        run.client.write_all(b"slow\r\n.\r\n").await.unwrap();
        assert_eq!(read_line(&mut run.client).await.trim_end(), "451 Local Error");

        let log = quit(run).await;
        assert!(!log.iter().any(|entry| entry.starts_with(b"DATA")));
    }

    #[tokio::test]
    async fn rejecting_filter_answers_the_client_and_resets_upstream() {
        let cfg = test_cfg(
            FilterType::Pipe,
            "cat >/dev/null; echo \"550 blocked by policy\" 1>&2; exit 1",
        );
        let mut run = start(cfg);

        send_envelope(&mut run.client).await;
        run.client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_line(&mut run.client).await.starts_with("354"));
        run.client.write_all(b"spam\r\n.\r\n").await.unwrap();
        assert_eq!(
            read_line(&mut run.client).await.trim_end(),
            "550 blocked by policy"
        );

        let log = quit(run).await;
        assert!(!log.iter().any(|entry| entry.starts_with(b"DATA")));
        assert!(log.iter().any(|entry| entry.starts_with(b"RSET")));
    }
}
