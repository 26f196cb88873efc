//! Gateway server: one HTTP listener on an OS-assigned port.
//!
//! | Route          | Purpose                                   |
//! |----------------|-------------------------------------------|
//! | `/`, `/login`  | PIN login page                            |
//! | `/ws`          | gateway socket (see [`protocol`])         |
//! | `/api/health`  | unauthenticated liveness probe            |
//!
//! All mutable gateway state (connection registry, shared streams) lives in
//! one [`GatewayServer`] instance, so independent gateways can coexist.

pub mod fanout;
pub mod login;
pub mod protocol;
mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{extract::State, response::Html, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use self::fanout::{ConnectionId, ListenerId, SharedSubscriptions};
use self::protocol::{ServerMessage, StreamEvent};
use crate::auth::AccessSession;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, RouterError};
use crate::router::CommandRouter;

/// Per-socket outbound queue depth. A socket that lets it fill is dropped.
pub(crate) const OUTBOUND_CAPACITY: usize = 256;

/// How long `stop` waits for the serve task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Per-socket record.
pub(crate) struct ClientConnection {
    /// Assigned at successful auth.
    client_id: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
    /// Broadcast topics.
    channels: HashSet<String>,
    /// Shared streams joined through `call`.
    streams: HashSet<String>,
}

impl ClientConnection {
    fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            client_id: None,
            tx,
            channels: HashSet::new(),
            streams: HashSet::new(),
        }
    }
}

/// State shared by every connection of one gateway.
#[derive(Clone)]
pub(crate) struct GatewayState {
    config: Arc<GatewayConfig>,
    session: AccessSession,
    router: Arc<CommandRouter>,
    streams: SharedSubscriptions,
    connections: Arc<RwLock<HashMap<ConnectionId, ClientConnection>>>,
    next_connection: Arc<AtomicU64>,
}

impl GatewayState {
    async fn is_authenticated(&self, conn: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(&conn)
            .is_some_and(|c| c.client_id.is_some())
    }

    async fn authenticated_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.client_id.is_some())
            .count()
    }
}

/// Axum state for one run of the server.
#[derive(Clone)]
pub(crate) struct AppState {
    gateway: GatewayState,
    shutdown: watch::Receiver<bool>,
    started_at: Instant,
}

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The gateway server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct GatewayServer {
    state: GatewayState,
    running: Arc<Mutex<Option<Running>>>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, session: AccessSession, router: Arc<CommandRouter>) -> Self {
        let streams = SharedSubscriptions::new(Arc::clone(&router), config.listener_policy);
        Self {
            state: GatewayState {
                config: Arc::new(config),
                session,
                router,
                streams,
                connections: Arc::new(RwLock::new(HashMap::new())),
                next_connection: Arc::new(AtomicU64::new(1)),
            },
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Bind `bind_host:0` and start serving. Returns the assigned port.
    pub async fn start(&self) -> Result<u16, GatewayError> {
        if self.is_running() {
            return Err(GatewayError::AlreadyRunning);
        }
        let addr = format!("{}:0", self.state.config.bind_host);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::ServerBind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| GatewayError::ServerBind {
                addr: addr.clone(),
                source,
            })?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.app(shutdown_rx.clone());
        let mut signal = shutdown_rx;
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.changed().await;
                })
                .await;
            if let Err(e) = served {
                error!("Gateway server error: {e}");
            }
        });

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            task.abort();
            return Err(GatewayError::AlreadyRunning);
        }
        *running = Some(Running {
            port,
            shutdown_tx,
            task,
        });
        info!(port, host = %self.state.config.bind_host, "Gateway listening");
        Ok(port)
    }

    /// Close every socket, discard every shared stream, and release the port.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let running = {
            let mut guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(Running {
            port,
            shutdown_tx,
            mut task,
        }) = running
        else {
            return Err(GatewayError::NotRunning);
        };

        let _ = shutdown_tx.send(true);
        self.state.streams.clear().await;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
        info!(port, "Gateway stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.port)
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.state.router
    }

    pub fn subscriptions(&self) -> &SharedSubscriptions {
        &self.state.streams
    }

    /// Number of authenticated sockets.
    pub async fn client_count(&self) -> usize {
        self.state.authenticated_count().await
    }

    /// Send `data` to every authenticated socket subscribed to `channel`.
    /// Returns the number of sockets reached.
    pub async fn broadcast(&self, channel: &str, data: Value) -> usize {
        let connections = self.state.connections.read().await;
        connections
            .values()
            .filter(|c| c.client_id.is_some() && c.channels.contains(channel))
            .filter(|c| {
                c.tx
                    .try_send(ServerMessage::subscription(None, channel, data.clone()))
                    .is_ok()
            })
            .count()
    }

    /// Register an in-process observer of a shared stream.
    pub async fn add_listener<F>(
        &self,
        stream_id: &str,
        request: Option<(String, Value)>,
        callback: F,
    ) -> Result<ListenerId, RouterError>
    where
        F: Fn(&str, &StreamEvent) + Send + Sync + 'static,
    {
        self.state
            .streams
            .add_listener(stream_id, request, callback)
            .await
    }

    pub async fn remove_listener(&self, stream_id: &str, id: ListenerId) -> bool {
        self.state.streams.remove_listener(stream_id, id).await
    }

    fn app(&self, shutdown: watch::Receiver<bool>) -> Router {
        let state = AppState {
            gateway: self.state.clone(),
            shutdown,
            started_at: Instant::now(),
        };
        Router::new()
            .route("/", get(login_page))
            .route("/login", get(login_page))
            .route("/ws", get(ws::ws_upgrade))
            .route("/api/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

async fn login_page(State(app): State<AppState>) -> Html<String> {
    Html(login::render(&app.gateway.config.app_path))
}

/// `GET /api/health` - liveness probe, no authentication.
async fn health(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": app.started_at.elapsed().as_secs(),
        "clients": app.gateway.authenticated_count().await,
        "streams": app.gateway.streams.len().await,
    }))
}
