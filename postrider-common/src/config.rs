//! Engine configuration, loaded from a single YAML file.
//!
//! Durations are plain seconds; unknown hosts simply have no limit entry.
//! The DKIM block is optional: without a private key the mailer sends
//! unsigned.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use ahash::AHashMap;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::{Binding, Domain};

/// Configuration errors surfaced at startup. Everything here is fatal: the
/// engine refuses to run on a config it cannot fully honor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("can't parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Outgoing connections are bound to explicit source addresses; an empty
    /// list would leave the connector with nothing to bind.
    #[error("ips should be defined")]
    NoSourceAddresses,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Workers per pipeline stage. Defaults to the CPU count.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Source IPv4 addresses outgoing connections bind to, round-robined
    /// over preparer workers.
    pub ips: Vec<IpAddr>,

    /// Extra trust anchor (PEM) added to the TLS root store, for recipients
    /// running private CAs.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    /// DKIM private key (PEM). Signing is disabled when absent.
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    #[serde(default = "default_dkim_selector")]
    pub dkim_selector: String,

    /// Recipient hostnames the guardian refuses outright.
    #[serde(default)]
    pub exclude: Vec<Domain>,

    /// Per-destination rate limits.
    #[serde(default)]
    pub limits: AHashMap<Domain, LimitConfig>,

    #[serde(default)]
    pub log_level: LogLevel,

    /// `stdout` or a file path.
    #[serde(default = "default_log_output")]
    pub log_output: String,
}

impl Config {
    /// Reads and validates a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()
    }

    /// Checks the invariants a parsed config must still satisfy.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.ips.is_empty() {
            return Err(ConfigError::NoSourceAddresses);
        }
        if self.workers == 0 {
            self.workers = default_workers();
        }
        Ok(self)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn default_dkim_selector() -> String {
    "mail".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

/// A per-destination sending limit: at most `value` messages per `duration`,
/// overflow rerouted to `binding`.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    pub value: u32,

    /// Window length in seconds.
    #[serde(deserialize_with = "duration_secs")]
    pub duration: Duration,

    #[serde(rename = "bindingType")]
    pub binding: Binding,
}

/// Timeouts for every suspension point on the sending path.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Pacing for state polls and connection-acquisition retries.
    #[serde(default = "default_sleep", deserialize_with = "duration_secs")]
    pub sleep: Duration,

    /// How long an idle client may sit in its pool before it is torn down.
    #[serde(default = "default_waiting", deserialize_with = "duration_secs")]
    pub waiting: Duration,

    /// TCP dial deadline.
    #[serde(default = "default_connection", deserialize_with = "duration_secs")]
    pub connection: Duration,

    /// Greeting, EHLO/HELO and STARTTLS deadline.
    #[serde(default = "default_hello", deserialize_with = "duration_secs")]
    pub hello: Duration,

    /// MAIL FROM deadline.
    #[serde(default = "default_mail", deserialize_with = "duration_secs")]
    pub mail: Duration,

    /// RCPT TO deadline.
    #[serde(default = "default_rcpt", deserialize_with = "duration_secs")]
    pub rcpt: Duration,

    /// DATA, body transfer and end-of-data deadline.
    #[serde(default = "default_data", deserialize_with = "duration_secs")]
    pub data: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sleep: default_sleep(),
            waiting: default_waiting(),
            connection: default_connection(),
            hello: default_hello(),
            mail: default_mail(),
            rcpt: default_rcpt(),
            data: default_data(),
        }
    }
}

const fn default_sleep() -> Duration {
    Duration::from_secs(1)
}

const fn default_waiting() -> Duration {
    Duration::from_secs(30)
}

const fn default_connection() -> Duration {
    Duration::from_secs(300)
}

const fn default_hello() -> Duration {
    Duration::from_secs(300)
}

const fn default_mail() -> Duration {
    Duration::from_secs(300)
}

const fn default_rcpt() -> Duration {
    Duration::from_secs(300)
}

const fn default_data() -> Duration {
    Duration::from_secs(600)
}

fn duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Log verbosity, `warning` spelled the way the config file spells it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}
