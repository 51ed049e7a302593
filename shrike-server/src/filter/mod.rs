use std::io;

use miette::Diagnostic;
use thiserror::Error;
use tracing::debug;

use ::smtp::{MessageHost, SmtpError};

use crate::config::{Cfg, FilterType};

pub mod file;
pub mod pipe;
pub mod process;
pub mod reject_line;
pub mod smtp;

use reject_line::RejectBuffer;

/// Outcome of a filter run for one message.
#[derive(Debug, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("couldn't launch filter command")]
    #[diagnostic(code(shrike::filter::spawn))]
    Spawn(#[source] io::Error),

    #[error("i/o error while driving filter")]
    #[diagnostic(code(shrike::filter::io))]
    Io(#[from] io::Error),

    #[error("timeout while listening to filter command")]
    #[diagnostic(code(shrike::filter::timeout))]
    Timeout,

    #[error("unexpected reply from downstream server: {0}")]
    #[diagnostic(code(shrike::filter::protocol))]
    Protocol(String),

    #[error("filter command terminated abnormally")]
    #[diagnostic(code(shrike::filter::abnormal_exit))]
    AbnormalExit,

    #[error("missing sender or recipient")]
    #[diagnostic(code(shrike::filter::envelope))]
    Envelope,

    #[error("shutting down")]
    #[diagnostic(code(shrike::filter::cancelled))]
    Cancelled,
}

impl From<SmtpError> for FilterError {
    fn from(e: SmtpError) -> Self {
        match e {
            SmtpError::IoError(e) => FilterError::Io(e),
            SmtpError::ProtocolError(message) => FilterError::Protocol(message),
        }
    }
}

/// Runs the driver selected by the configuration.
pub async fn dispatch<H: MessageHost>(
    host: &mut H,
    cfg: &Cfg,
    command: &str,
) -> Result<Verdict, FilterError> {
    match cfg.filter_type {
        FilterType::Pipe => pipe::run(host, cfg, command).await,
        FilterType::File => file::run(host, cfg, command).await,
        FilterType::Smtp => smtp::run(host, cfg, command).await,
        FilterType::Reject => Ok(Verdict::Reject(cfg.reject.clone())),
    }
}

/// Reaps the child and maps its exit status to a verdict: exit 0 accepts, a
/// non-zero exit rejects with the accumulated stderr line, a signal is an
/// error. When the pump itself failed, the child is terminated instead and
/// the pump error wins.
pub(crate) async fn settle(
    child: &mut tokio::process::Child,
    cfg: &Cfg,
    pumped: Result<(), FilterError>,
    reject: RejectBuffer,
) -> Result<Verdict, FilterError> {
    if let Err(e) = pumped {
        process::terminate(child, cfg.timeout()).await;
        return Err(e);
    }
    let status = match process::wait(child, cfg.timeout()).await {
        Ok(status) => status,
        Err(e) => {
            process::terminate(child, cfg.timeout()).await;
            return Err(e);
        }
    };
    let Some(code) = status.code() else {
        return Err(FilterError::AbnormalExit);
    };
    debug!(code, "filter exit code");
    if code == 0 {
        Ok(Verdict::Accept)
    } else {
        Ok(Verdict::Reject(reject.finalize()))
    }
}
