//! Remote access controller: wires tunnel, session and gateway together
//! behind `enable`/`disable` and publishes a status state machine.
//!
//! ```text
//! Disabled ─► Downloading(progress) ─► Starting ─► Active(url, pin, clients)
//!    ▲                                                   │
//!    └──────────────── disable() ◄─── Error(message) ◄───┘ (any step)
//! ```
//!
//! `enable` is the only place that enforces a single active session.
//! `disable` bumps an epoch that a running `enable` checks after every step,
//! and both sides tear down under one lifecycle lock, so a disable issued
//! mid-start always wins.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::auth::AccessSession;
use crate::config::Config;
use crate::error::{RemoteAccessError, TunnelError};
use crate::gateway::GatewayServer;
use crate::router::CommandRouter;
use crate::tunnel::{ensure_binary_available, TunnelProcessManager};

/// Status pushed to local observers. Serializes as
/// `{"status": "active", "url": ..., "pin": ..., "clients": 2}` etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RemoteStatus {
    Disabled,
    Downloading { progress: u8 },
    Starting,
    Active {
        url: String,
        pin: String,
        clients: usize,
    },
    Error { message: String },
}

/// Progress sink handed to the installer.
pub type ProgressFn = Box<dyn FnMut(u8) + Send>;

type Installer =
    Arc<dyn Fn(PathBuf, ProgressFn) -> BoxFuture<'static, Result<bool, TunnelError>> + Send + Sync>;

pub struct RemoteAccessController {
    tunnel: TunnelProcessManager,
    session: AccessSession,
    gateway: GatewayServer,
    installer: Installer,
    status_tx: Arc<watch::Sender<RemoteStatus>>,
    enabled: AtomicBool,
    epoch: AtomicU64,
    lifecycle: Mutex<()>,
}

impl RemoteAccessController {
    /// Build a controller whose gateway exposes `router`.
    pub fn new(config: &Config, router: Arc<CommandRouter>) -> Self {
        let session = AccessSession::new();
        let gateway = GatewayServer::new(config.gateway.clone(), session.clone(), router);
        let tunnel = TunnelProcessManager::new(config.tunnel.clone());
        Self::from_parts(tunnel, session, gateway)
    }

    /// Build from existing components. `gateway` must share `session`.
    pub fn from_parts(
        tunnel: TunnelProcessManager,
        session: AccessSession,
        gateway: GatewayServer,
    ) -> Self {
        let (status_tx, _) = watch::channel(RemoteStatus::Disabled);
        Self {
            tunnel,
            session,
            gateway,
            installer: Arc::new(|path: PathBuf, progress: ProgressFn| {
                async move { ensure_binary_available(&path, progress).await }.boxed()
            }),
            status_tx: Arc::new(status_tx),
            enabled: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    /// Replace the step that makes the tunnel binary available. It receives
    /// the binary path and a progress sink and returns whether it downloaded.
    #[must_use]
    pub fn with_installer<F, Fut>(mut self, install: F) -> Self
    where
        F: Fn(PathBuf, ProgressFn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, TunnelError>> + Send + 'static,
    {
        self.installer = Arc::new(move |path, progress| install(path, progress).boxed());
        self
    }

    pub fn gateway(&self) -> &GatewayServer {
        &self.gateway
    }

    pub fn session(&self) -> &AccessSession {
        &self.session
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Bring remote access up. Rejected while already enabled. On failure
    /// everything created so far is torn down, `Error` is published, and the
    /// error is returned. A concurrent `disable` makes this return
    /// [`RemoteAccessError::Cancelled`] with nothing left running.
    pub async fn enable(&self) -> Result<RemoteStatus, RemoteAccessError> {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RemoteAccessError::SessionAlreadyActive);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let _lifecycle = self.lifecycle.lock().await;

        match self.bring_up(epoch).await {
            Ok(status) => Ok(status),
            Err(RemoteAccessError::Cancelled) => {
                info!("Enable interrupted by disable");
                self.teardown().await;
                Err(RemoteAccessError::Cancelled)
            }
            Err(e) => {
                error!("Failed to enable remote access: {e}");
                self.teardown().await;
                self.enabled.store(false, Ordering::SeqCst);
                self.publish(RemoteStatus::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn bring_up(&self, epoch: u64) -> Result<RemoteStatus, RemoteAccessError> {
        let binary = self.tunnel.config().binary();
        let status_tx = Arc::clone(&self.status_tx);
        let progress: ProgressFn = Box::new(move |progress| {
            status_tx.send_replace(RemoteStatus::Downloading { progress });
        });
        let downloaded = (self.installer)(binary.clone(), progress).await;
        self.ensure_current(epoch)?;
        if downloaded? {
            debug!(path = %binary.display(), "Tunnel binary downloaded");
        }

        self.publish(RemoteStatus::Starting);
        let pin = self.session.create();
        let port = self.gateway.start().await?;
        self.ensure_current(epoch)?;
        let started = self.tunnel.start(port).await;
        self.ensure_current(epoch)?;
        let url = started?;
        self.session.set_url(&url);

        let status = RemoteStatus::Active {
            url: url.clone(),
            pin,
            clients: self.session.client_count(),
        };
        self.publish(status.clone());
        info!(url = %url, port, "Remote access active");
        Ok(status)
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), RemoteAccessError> {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            Err(RemoteAccessError::Cancelled)
        }
    }

    /// Stop the tunnel, stop the gateway, end the session. Safe to call
    /// repeatedly and while `enable` is still running.
    pub async fn disable(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        // Interrupts a start that is still waiting for its URL.
        self.tunnel.stop().await;
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
        self.enabled.store(false, Ordering::SeqCst);
        self.publish(RemoteStatus::Disabled);
        info!("Remote access disabled");
    }

    async fn teardown(&self) {
        self.tunnel.stop().await;
        if let Err(e) = self.gateway.stop().await {
            debug!("Gateway stop skipped: {e}");
        }
        self.session.end();
    }

    /// Current status, re-derived from the live session when one is active so
    /// the client count is current.
    pub fn status(&self) -> RemoteStatus {
        if self.gateway.is_running() {
            if let Some(record) = self.session.snapshot() {
                if let Some(url) = record.url {
                    return RemoteStatus::Active {
                        url,
                        pin: record.pin,
                        clients: record.clients.len(),
                    };
                }
            }
        }
        self.status_tx.borrow().clone()
    }

    /// Receiver of every published status.
    pub fn subscribe_status(&self) -> watch::Receiver<RemoteStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self, status: RemoteStatus) {
        self.status_tx.send_replace(status);
    }
}
