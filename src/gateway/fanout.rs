//! Shared-subscription registry.
//!
//! A shared stream is keyed by a caller-supplied identifier. The registry
//! guarantees at most one live upstream call per identifier and fans every
//! upstream event out to all current observers, in upstream order.
//!
//! | Observer kind | Added by                          | Removed by                            |
//! |---------------|-----------------------------------|---------------------------------------|
//! | socket        | `call` to a shared-stream method  | `unsubscribe`, socket close           |
//! | listener      | [`SharedSubscriptions::add_listener`] | [`SharedSubscriptions::remove_listener`] |
//!
//! The only teardown point is a member removal that leaves both member sets
//! empty: the upstream task is aborted (dropping the upstream stream) and the
//! record is deleted.
//!
//! Delivery happens while the registry lock is held, so a removal either
//! happens before an event (the removed member does not see it) or after it.
//! Subscribers must therefore never block. A socket whose bounded outbound
//! queue is full or closed is dropped from the stream on the spot, which can
//! itself trigger teardown.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{ServerMessage, StreamEvent};
use crate::config::ListenerPolicy;
use crate::error::RouterError;
use crate::router::{CommandRouter, EventStream};

/// Gateway-assigned id of one socket connection.
pub type ConnectionId = u64;

/// Handle returned by [`SharedSubscriptions::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Anything that can receive stream events.
pub trait Subscriber: Send + Sync {
    /// Deliver one event. Returns `false` if the subscriber is gone.
    fn deliver(&self, stream_id: &str, event: &StreamEvent) -> bool;
}

/// Deliver `event` to every subscriber, regardless of kind. Returns how many
/// accepted it.
pub fn publish<'a, I>(stream_id: &str, event: &StreamEvent, subscribers: I) -> usize
where
    I: IntoIterator<Item = &'a Arc<dyn Subscriber>>,
{
    subscribers
        .into_iter()
        .filter(|s| s.deliver(stream_id, event))
        .count()
}

/// Forwards events to a socket's outbound queue as `subscription` frames,
/// correlated to the `call` that joined the stream.
pub struct SocketSubscriber {
    request_id: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
}

impl SocketSubscriber {
    pub fn new(request_id: Option<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { request_id, tx }
    }
}

impl Subscriber for SocketSubscriber {
    fn deliver(&self, stream_id: &str, event: &StreamEvent) -> bool {
        let msg = ServerMessage::subscription(self.request_id.clone(), stream_id, event.to_value());
        // Full means the peer stopped reading; treat it like a closed socket.
        self.tx.try_send(msg).is_ok()
    }
}

/// In-process callback observer.
pub struct ListenerSubscriber<F>(pub F);

impl<F> Subscriber for ListenerSubscriber<F>
where
    F: Fn(&str, &StreamEvent) + Send + Sync,
{
    fn deliver(&self, stream_id: &str, event: &StreamEvent) -> bool {
        (self.0)(stream_id, event);
        true
    }
}

struct Upstream {
    generation: u64,
    task: JoinHandle<()>,
}

struct SharedSubscription {
    /// Procedure and params that start the upstream. `None` for a listener
    /// placeholder that no socket has joined yet.
    request: Option<(String, Value)>,
    upstream: Option<Upstream>,
    sockets: HashMap<ConnectionId, Arc<dyn Subscriber>>,
    listeners: HashMap<ListenerId, Arc<dyn Subscriber>>,
}

impl SharedSubscription {
    fn new(request: Option<(String, Value)>) -> Self {
        Self {
            request,
            upstream: None,
            sockets: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.sockets.is_empty() && self.listeners.is_empty()
    }
}

#[derive(Default)]
struct Registry {
    streams: HashMap<String, SharedSubscription>,
    next_generation: u64,
    next_listener: u64,
}

/// Registry of live shared streams, owned by one gateway instance.
#[derive(Clone)]
pub struct SharedSubscriptions {
    inner: Arc<Mutex<Registry>>,
    router: Arc<CommandRouter>,
    policy: ListenerPolicy,
}

impl SharedSubscriptions {
    pub fn new(router: Arc<CommandRouter>, policy: ListenerPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            router,
            policy,
        }
    }

    /// Add a socket observer, starting the upstream call if none is running.
    ///
    /// `on_joined` runs under the registry lock once the socket is a member,
    /// before any event can reach it. Rejoining with the same connection
    /// replaces its subscriber. On error the registry is left as it was.
    pub async fn join_socket<F>(
        &self,
        conn: ConnectionId,
        stream_id: &str,
        method: &str,
        params: Value,
        subscriber: Arc<dyn Subscriber>,
        on_joined: F,
    ) -> Result<(), RouterError>
    where
        F: FnOnce() + Send,
    {
        let mut registry = self.inner.lock().await;
        let created = !registry.streams.contains_key(stream_id);
        let record = registry
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| SharedSubscription::new(None));
        if record.request.is_none() {
            record.request = Some((method.to_string(), params));
        }
        let previous = record.sockets.insert(conn, subscriber);

        if let Err(e) = self.ensure_upstream(&mut registry, stream_id) {
            if created {
                registry.streams.remove(stream_id);
            } else if let Some(record) = registry.streams.get_mut(stream_id) {
                match previous {
                    Some(prev) => record.sockets.insert(conn, prev),
                    None => record.sockets.remove(&conn),
                };
            }
            return Err(e);
        }
        on_joined();
        debug!(stream = %stream_id, conn, "Socket joined shared stream");
        Ok(())
    }

    /// Remove one socket from one stream. Returns `true` if it was a member.
    pub async fn leave_socket(&self, conn: ConnectionId, stream_id: &str) -> bool {
        let mut registry = self.inner.lock().await;
        let removed = registry
            .streams
            .get_mut(stream_id)
            .is_some_and(|r| r.sockets.remove(&conn).is_some());
        if removed {
            reap(&mut registry, stream_id);
        }
        removed
    }

    /// Remove a closed connection from every stream it belongs to.
    pub async fn remove_connection(&self, conn: ConnectionId) {
        let mut registry = self.inner.lock().await;
        let joined: Vec<String> = registry
            .streams
            .iter_mut()
            .filter_map(|(id, r)| r.sockets.remove(&conn).map(|_| id.clone()))
            .collect();
        for stream_id in joined {
            reap(&mut registry, &stream_id);
        }
    }

    /// Register an in-process observer.
    ///
    /// `request` names the procedure and params that would start the
    /// upstream; it is only used under [`ListenerPolicy::Eager`] or when a
    /// later socket joins without a running upstream.
    pub async fn add_listener<F>(
        &self,
        stream_id: &str,
        request: Option<(String, Value)>,
        callback: F,
    ) -> Result<ListenerId, RouterError>
    where
        F: Fn(&str, &StreamEvent) + Send + Sync + 'static,
    {
        let mut registry = self.inner.lock().await;
        registry.next_listener += 1;
        let id = ListenerId(registry.next_listener);
        let created = !registry.streams.contains_key(stream_id);
        let record = registry
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| SharedSubscription::new(None));
        if record.request.is_none() {
            record.request = request;
        }
        record
            .listeners
            .insert(id, Arc::new(ListenerSubscriber(callback)));

        if self.policy == ListenerPolicy::Eager {
            if let Err(e) = self.ensure_upstream(&mut registry, stream_id) {
                if created {
                    registry.streams.remove(stream_id);
                } else if let Some(record) = registry.streams.get_mut(stream_id) {
                    record.listeners.remove(&id);
                }
                return Err(e);
            }
        }
        debug!(stream = %stream_id, "Listener added to shared stream");
        Ok(id)
    }

    /// Remove an in-process observer. Returns `true` if it was registered.
    pub async fn remove_listener(&self, stream_id: &str, id: ListenerId) -> bool {
        let mut registry = self.inner.lock().await;
        let removed = registry
            .streams
            .get_mut(stream_id)
            .is_some_and(|r| r.listeners.remove(&id).is_some());
        if removed {
            reap(&mut registry, stream_id);
        }
        removed
    }

    /// Number of shared-stream records, placeholders included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, stream_id: &str) -> bool {
        self.inner.lock().await.streams.contains_key(stream_id)
    }

    /// Whether an upstream call is currently running for `stream_id`.
    pub async fn is_live(&self, stream_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(stream_id)
            .is_some_and(|r| r.upstream.is_some())
    }

    /// Drop every record and abort every upstream, without delivering
    /// anything further.
    pub async fn clear(&self) {
        let mut registry = self.inner.lock().await;
        let count = registry.streams.len();
        for (_, record) in registry.streams.drain() {
            if let Some(upstream) = record.upstream {
                upstream.task.abort();
            }
        }
        if count > 0 {
            info!(count, "Discarded shared streams");
        }
    }

    /// Start the upstream for `stream_id` unless one is running or the
    /// record has no request to start it with.
    fn ensure_upstream(&self, registry: &mut Registry, stream_id: &str) -> Result<(), RouterError> {
        let Some(record) = registry.streams.get(stream_id) else {
            return Ok(());
        };
        if record.upstream.is_some() {
            return Ok(());
        }
        let Some((method, params)) = record.request.clone() else {
            return Ok(());
        };
        let stream = self.router.open_stream(&method, params)?;

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let task = tokio::spawn(pump(
            Arc::clone(&self.inner),
            stream_id.to_string(),
            generation,
            stream,
        ));
        if let Some(record) = registry.streams.get_mut(stream_id) {
            record.upstream = Some(Upstream { generation, task });
        }
        info!(stream = %stream_id, method = %method, "Started shared upstream");
        Ok(())
    }
}

/// Delete the record if it has no members left, cancelling its upstream.
fn reap(registry: &mut Registry, stream_id: &str) {
    if !registry.streams.get(stream_id).is_some_and(SharedSubscription::is_empty) {
        return;
    }
    if let Some(record) = registry.streams.remove(stream_id) {
        if let Some(upstream) = record.upstream {
            upstream.task.abort();
            info!(stream = %stream_id, "Last observer left, cancelled shared upstream");
        } else {
            debug!(stream = %stream_id, "Last observer left shared stream");
        }
    }
}

/// Drive one upstream, publishing each event to the record's members.
async fn pump(
    inner: Arc<Mutex<Registry>>,
    stream_id: String,
    generation: u64,
    mut upstream: EventStream,
) {
    loop {
        let event = match upstream.next().await {
            Some(Ok(data)) => StreamEvent::Data { data },
            Some(Err(error)) => StreamEvent::Error { error },
            None => StreamEvent::Complete,
        };
        let mut registry = inner.lock().await;
        let Some(record) = registry.streams.get_mut(&stream_id) else {
            return;
        };
        if record.upstream.as_ref().map(|u| u.generation) != Some(generation) {
            return;
        }
        let stalled: Vec<ConnectionId> = record
            .sockets
            .iter()
            .filter(|(_, socket)| !socket.deliver(&stream_id, &event))
            .map(|(conn, _)| *conn)
            .collect();
        publish(&stream_id, &event, record.listeners.values());
        let terminal = event.is_terminal();
        if terminal {
            record.upstream = None;
            debug!(stream = %stream_id, "Shared upstream finished");
        }
        if !stalled.is_empty() {
            for conn in &stalled {
                record.sockets.remove(conn);
            }
            warn!(stream = %stream_id, dropped = stalled.len(), "Dropped sockets that stopped reading");
            reap(&mut registry, &stream_id);
        }
        if terminal || !registry.streams.contains_key(&stream_id) {
            return;
        }
    }
}
