//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `TUNNELGATE_TUNNEL_BIN`,
//!    `TUNNELGATE_BIND_HOST`, `TUNNELGATE_LOG`
//! 2. **Config file** - path via `--config <path>`, or `tunnelgate.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [gateway]
//! bind_host = "127.0.0.1"          # port is always OS-assigned
//! app_path = "/app/"               # login page navigates here on success
//! listener_policy = "dormant"      # or "eager"
//!
//! [tunnel]
//! binary_path = "~/.tunnelgate/bin/cloudflared"
//! args = ["tunnel", "--no-autoupdate", "--url", "http://localhost:{port}"]
//! startup_timeout_secs = 45
//! stop_timeout_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Whether a purely local listener may start the upstream call of a shared
/// stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerPolicy {
    /// Listeners only join; the first socket observer starts the upstream.
    #[default]
    Dormant,
    /// A listener registration starts the upstream if none is running.
    Eager,
}

/// Gateway listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind (default `127.0.0.1`). The port is always 0.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Path the login page navigates to after `auth_success` (default `/app/`).
    #[serde(default = "default_app_path")]
    pub app_path: String,
    #[serde(default)]
    pub listener_policy: ListenerPolicy,
}

/// Tunnel client binary and process settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Where the tunnel binary lives (downloaded here when missing).
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Arguments passed to the binary. `{port}` is replaced with the gateway port.
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,
    /// Seconds to wait for the public URL before killing the process (default 45).
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Seconds to wait for a graceful exit on stop before SIGKILL (default 5).
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_app_path() -> String {
    "/app/".to_string()
}
fn default_binary_path() -> String {
    let name = if cfg!(windows) {
        "cloudflared.exe"
    } else {
        "cloudflared"
    };
    format!("~/.tunnelgate/bin/{name}")
}
fn default_tunnel_args() -> Vec<String> {
    ["tunnel", "--no-autoupdate", "--url", "http://localhost:{port}"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_startup_timeout_secs() -> u64 {
    45
}
fn default_stop_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            app_path: default_app_path(),
            listener_policy: ListenerPolicy::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            args: default_tunnel_args(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    /// Binary path with a leading `~` expanded.
    pub fn binary(&self) -> PathBuf {
        PathBuf::from(crate::util::expand_tilde(&self.binary_path).as_ref())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Arguments with `{port}` substituted.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `tunnelgate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("tunnelgate.toml").exists() {
            Self::from_file(Path::new("tunnelgate.toml"))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(bin) = std::env::var("TUNNELGATE_TUNNEL_BIN") {
            config.tunnel.binary_path = bin;
        }
        if let Ok(host) = std::env::var("TUNNELGATE_BIND_HOST") {
            config.gateway.bind_host = host;
        }
        if let Ok(level) = std::env::var("TUNNELGATE_LOG") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}
