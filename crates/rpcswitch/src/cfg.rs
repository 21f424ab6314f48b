//! Configuration for the `rpcswitch` binary.
//!
//! The configuration file is TOML.  It names the listeners, the policy
//! file, the static auth tables, and a handful of application tunables;
//! everything routing-related lives in the policy file instead, which can
//! be reloaded at runtime with SIGHUP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use rpcswitch_broker::BrokerOptions;
use serde::Deserialize;

/// The whole configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SwitchConfig {
    /// Application-wide tunables.
    #[serde(default)]
    pub(crate) application: ApplicationConfig,
    /// Where log output goes.
    #[serde(default)]
    pub(crate) logging: LoggingConfig,
    /// The sockets to accept peers on.  At least one is required.
    #[serde(default)]
    pub(crate) listeners: Vec<ListenerConfig>,
    /// Path to the policy file, resolved relative to the working directory.
    pub(crate) policy: PathBuf,
    /// Static auth tables: auth method to `who` to token.
    #[serde(default)]
    pub(crate) auth: HashMap<String, HashMap<String, String>>,
}

/// Application tunables.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ApplicationConfig {
    /// How often to probe workers for liveness.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub(crate) ping_interval: Duration,
    /// How long a probed worker gets to answer.
    #[serde(default = "default_pong_timeout", with = "humantime_serde")]
    pub(crate) pong_timeout: Duration,
    /// Largest JSON frame accepted from a peer, in bytes.
    #[serde(default = "default_max_frame_len")]
    pub(crate) max_frame_len: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            ping_interval: default_ping_interval(),
            pong_timeout: default_pong_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Default worker ping period.
fn default_ping_interval() -> Duration {
    Duration::from_secs(60)
}

/// Default pong deadline.
fn default_pong_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Default maximum frame length (1 MiB).
fn default_max_frame_len() -> usize {
    1 << 20
}

/// One socket to listen on.
#[derive(Clone, Debug, Deserialize)]
pub(crate) enum ListenerConfig {
    /// A TCP listener on this address.
    #[serde(rename = "tcp")]
    Tcp(SocketAddr),
    /// An AF_UNIX listener at this path.
    #[serde(rename = "unix")]
    Unix(PathBuf),
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingConfig {
    /// Filter for console output, e.g. `"info"` or
    /// `"rpcswitch_broker=debug,info"`.  Absent means `"info"`.
    pub(crate) console: Option<String>,
    /// Optional logfile.
    pub(crate) file: Option<LogfileConfig>,
}

/// One logfile destination.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LogfileConfig {
    /// Where to write the log.
    pub(crate) path: PathBuf,
    /// Filter for this file; falls back to the console filter.
    pub(crate) filter: Option<String>,
}

impl SwitchConfig {
    /// Load the configuration from a TOML file.
    pub(crate) fn load(path: &Path) -> anyhow::Result<SwitchConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let cfg: SwitchConfig = toml::from_str(&text)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// The broker tunables this configuration asks for.
    pub(crate) fn broker_options(&self) -> BrokerOptions {
        let mut opts = BrokerOptions::default();
        opts.ping_interval = self.application.ping_interval;
        opts.pong_timeout = self.application.pong_timeout;
        opts.max_frame_len = self.application.max_frame_len;
        opts
    }
}
