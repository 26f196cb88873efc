//! Outbound quick-tunnel supervision.
//!
//! - [`platform`] maps the host OS/architecture to a download URL.
//! - [`install`] makes sure the tunnel binary exists on disk.
//! - [`process`] spawns the binary against a local port and discovers the
//!   public URL it was assigned.

pub mod install;
pub mod platform;
pub mod process;

pub use install::ensure_binary_available;
pub use process::{find_tunnel_url, TunnelProcessManager};
