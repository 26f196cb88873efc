//! Error taxonomy for the remote access gateway.
//!
//! Errors that belong to a single socket message (bad PIN, unknown procedure,
//! a failed call) are rendered into `error` frames and never close the
//! connection. Everything that can go wrong while enabling remote access is
//! funnelled into [`RemoteAccessError`] so the controller can tear down and
//! publish a single message.

use std::io;

use thiserror::Error;

/// Failures of the tunnel binary lifecycle (install, spawn, URL discovery).
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No download URL is mapped for this OS/architecture pair.
    #[error("tunnel binary is not available for platform {0}")]
    PlatformUnsupported(String),
    /// Network failure while fetching the binary.
    #[error("failed to download tunnel binary: {0}")]
    Download(String),
    /// The archive was fetched but could not be unpacked or installed.
    #[error("failed to extract tunnel binary: {0}")]
    Extract(String),
    /// The OS refused to start the process.
    #[error("failed to spawn tunnel process: {0}")]
    Spawn(#[source] io::Error),
    /// The process exited before printing a public URL.
    #[error("tunnel exited with {} before reporting a URL; output:\n{output}", describe_code(.code))]
    TunnelStartup { code: Option<i32>, output: String },
    /// No public URL appeared within the startup window.
    #[error("tunnel did not report a URL within {secs}s")]
    TunnelTimeout { secs: u64 },
}

#[allow(clippy::ref_option)]
fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("exit code {c}"))
}

/// Lookup and registration failures of the command router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("procedure path must be non-empty dotted segments: {0:?}")]
    InvalidPath(String),
    #[error("procedure registered twice: {0}")]
    Duplicate(String),
    #[error("router group not found: {0}")]
    GroupNotFound(String),
    #[error("procedure not found: {0}")]
    ProcedureNotFound(String),
    /// The handler ran and reported a failure.
    #[error("{0}")]
    Invocation(String),
}

/// Gateway server lifecycle failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind gateway listener on {addr}: {source}")]
    ServerBind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("gateway server is already running")]
    AlreadyRunning,
    #[error("gateway server is not running")]
    NotRunning,
}

/// Configuration load failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level error surfaced by the controller.
#[derive(Debug, Error)]
pub enum RemoteAccessError {
    /// `enable()` was called while a session is active.
    #[error("remote access is already enabled")]
    SessionAlreadyActive,
    /// A PIN did not match the active session.
    #[error("invalid PIN")]
    Authentication,
    /// `disable()` ran while `enable()` was still bringing things up.
    #[error("remote access was disabled while starting")]
    Cancelled,
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Router(#[from] RouterError),
}
