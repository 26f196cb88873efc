//! Command router: the table of procedures callable through the gateway.
//!
//! Procedures are registered once at startup under dotted paths
//! (`group.procedure`, groups may nest: `a.b.procedure`). [`RouterBuilder::build`]
//! validates every path, so the callable surface is fixed and enumerable
//! before the gateway accepts a single connection.
//!
//! Two kinds of procedure exist:
//!
//! - **call** - `params -> Result<Value, String>`, answered with one `result`
//!   (or `error`) frame.
//! - **shared stream** - `params -> Stream<Item = Result<Value, String>>`,
//!   keyed by a caller-supplied identifier read from `params[key_field]`. The
//!   gateway runs at most one upstream stream per identifier and fans its
//!   events out to every observer.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;

use crate::error::RouterError;

pub type CallFuture = BoxFuture<'static, Result<Value, String>>;
pub type EventStream = BoxStream<'static, Result<Value, String>>;

type CallHandler = Arc<dyn Fn(Value) -> CallFuture + Send + Sync>;
type StreamHandler = Arc<dyn Fn(Value) -> EventStream + Send + Sync>;

/// A registered procedure.
#[derive(Clone)]
pub enum Procedure {
    Call(CallHandler),
    SharedStream {
        /// Field of `params` that carries the stream identifier.
        key_field: String,
        handler: StreamHandler,
    },
}

impl Procedure {
    /// Stream identifier carried by `params`, for shared-stream procedures.
    pub fn stream_key(&self, params: &Value) -> Option<String> {
        let Procedure::SharedStream { key_field, .. } = self else {
            return None;
        };
        match params.get(key_field.as_str())? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Procedure::SharedStream { .. })
    }
}

/// Collects registrations; [`build`](Self::build) validates them.
#[derive(Default)]
pub struct RouterBuilder {
    entries: Vec<(String, Procedure)>,
}

impl RouterBuilder {
    /// Register a request/response procedure.
    #[must_use]
    pub fn call<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |params| handler(params).boxed());
        self.entries.push((path.to_string(), Procedure::Call(handler)));
        self
    }

    /// Register a shared streaming procedure keyed by `params[key_field]`.
    #[must_use]
    pub fn shared_stream<F, S>(mut self, path: &str, key_field: &str, handler: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, String>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |params| handler(params).boxed());
        self.entries.push((
            path.to_string(),
            Procedure::SharedStream {
                key_field: key_field.to_string(),
                handler,
            },
        ));
        self
    }

    pub fn build(self) -> Result<CommandRouter, RouterError> {
        let mut procedures = BTreeMap::new();
        let mut groups = HashSet::new();
        for (path, procedure) in self.entries {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(RouterError::InvalidPath(path));
            }
            let mut prefix = path.as_str();
            while let Some((group, _)) = prefix.rsplit_once('.') {
                groups.insert(group.to_string());
                prefix = group;
            }
            if procedures.insert(path.clone(), procedure).is_some() {
                return Err(RouterError::Duplicate(path));
            }
        }
        Ok(CommandRouter { procedures, groups })
    }
}

/// Immutable procedure table shared by every connection.
pub struct CommandRouter {
    procedures: BTreeMap<String, Procedure>,
    groups: HashSet<String>,
}

impl CommandRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Locate a procedure by dotted path. All segments but the last name the
    /// group; the last names the procedure.
    pub fn resolve(&self, method: &str) -> Result<&Procedure, RouterError> {
        if let Some((group, _)) = method.rsplit_once('.') {
            if !self.groups.contains(group) {
                return Err(RouterError::GroupNotFound(group.to_string()));
            }
        }
        self.procedures
            .get(method)
            .ok_or_else(|| RouterError::ProcedureNotFound(method.to_string()))
    }

    /// Invoke a call procedure.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, RouterError> {
        match self.resolve(method)? {
            Procedure::Call(handler) => handler(params).await.map_err(RouterError::Invocation),
            Procedure::SharedStream { .. } => Err(RouterError::Invocation(format!(
                "{method} is a stream and cannot be called directly"
            ))),
        }
    }

    /// Open the upstream stream of a shared-stream procedure.
    pub fn open_stream(&self, method: &str, params: Value) -> Result<EventStream, RouterError> {
        match self.resolve(method)? {
            Procedure::SharedStream { handler, .. } => Ok(handler(params)),
            Procedure::Call(_) => Err(RouterError::Invocation(format!(
                "{method} is not a stream"
            ))),
        }
    }

    /// Registered paths in sorted order.
    pub fn procedures(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }
}
