#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunnelgate - temporary PIN-gated remote access to an in-process command
//! surface through an outbound quick tunnel.
//!
//! ## Architecture
//!
//! ```text
//! config.rs          - TOML + env-var configuration
//! error.rs           - error taxonomy
//! auth.rs            - AccessSession (PIN, URL, client accounting)
//! router.rs          - CommandRouter registration table
//! tunnel/
//!   platform.rs      - platform-keyed download table
//!   install.rs       - ensure_binary_available (download, extract, chmod)
//!   process.rs       - TunnelProcessManager (spawn, URL discovery, stop)
//! gateway/
//!   protocol.rs      - socket wire format
//!   fanout.rs        - shared-subscription registry and publish
//!   ws.rs            - per-connection auth state machine and dispatch
//!   login.rs         - login page
//!   mod.rs           - GatewayServer (bind, serve, stop, broadcast)
//! controller.rs      - RemoteAccessController and status push
//! demo.rs            - demonstration procedures for the binary
//! ```

pub mod auth;
pub mod config;
pub mod controller;
pub mod demo;
pub mod error;
pub mod gateway;
pub mod router;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::AccessSession;
pub use config::Config;
pub use controller::{RemoteAccessController, RemoteStatus};
pub use error::{GatewayError, RemoteAccessError, RouterError, TunnelError};
pub use gateway::GatewayServer;
pub use router::CommandRouter;
pub use tunnel::TunnelProcessManager;
