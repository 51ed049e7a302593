use std::time::Duration;

use camino::Utf8PathBuf;
use config::{Config, File};
use miette::{bail, IntoDiagnostic, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    Pipe,
    File,
    Smtp,
    Reject,
}

/// Proxy configuration. File keys are matched case-insensitively (the
/// `config` loader lowercases them), so `FilterCommand` and `filtercommand`
/// both work.
#[derive(Debug, Clone, Deserialize)]
pub struct Cfg {
    /// Address the proxy accepts client connections on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upstream SMTP server accepted messages are relayed to.
    #[serde(alias = "outaddress")]
    pub out_address: String,

    /// Shell command for the pipe/file filters, or the downstream MTA
    /// address for the smtp filter. Unset passes messages through.
    #[serde(alias = "filtercommand", default)]
    pub command: Option<String>,

    #[serde(alias = "filtertype", default)]
    pub filter_type: FilterType,

    /// Reply line used by the blanket-reject policy.
    #[serde(alias = "filterreject", default = "default_reject")]
    pub reject: String,

    /// Seconds a filter may keep any single I/O wait pending.
    #[serde(alias = "filtertimeout", default = "default_timeout")]
    pub timeout: i64,

    /// Directory for spool files.
    #[serde(alias = "tempdirectory", default = "default_directory")]
    pub directory: Utf8PathBuf,

    /// Header line injected into accepted messages.
    #[serde(default)]
    pub header: Option<String>,

    /// Keep spool files instead of deleting them.
    #[serde(alias = "debugfiles", default)]
    pub debug_files: bool,
}

fn default_listen() -> String {
    "127.0.0.1:10025".to_string()
}

fn default_reject() -> String {
    "530 Email Rejected".to_string()
}

fn default_timeout() -> i64 {
    30
}

fn default_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

impl Cfg {
    pub fn load(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::new(path, config::FileFormat::Toml))
            .build()
            .into_diagnostic()?;
        Self::validate(settings.try_deserialize().into_diagnostic()?)
    }

    #[cfg(test)]
    pub(crate) fn from_toml(source: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()
            .into_diagnostic()?;
        Self::validate(settings.try_deserialize().into_diagnostic()?)
    }

    fn validate(mut cfg: Cfg) -> Result<Cfg> {
        if cfg.timeout <= 0 {
            bail!("invalid setting: FilterTimeout must be greater than zero");
        }
        cfg.header = cfg.header.and_then(|header| {
            let header = header.trim().to_string();
            if header.is_empty() {
                None
            } else {
                Some(header)
            }
        });
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout as u64)
    }
}
