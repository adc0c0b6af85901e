//! LAN text chat: a TCP server that gives every client a unique username and
//! relays lines between them.
//!
//! - [`registry`] tracks live sessions and claimed usernames.
//! - [`session`] is the per-connection state machine with its own outbound
//!   queue and writer.
//! - [`router`] turns broadcast, private, system and roster envelopes into
//!   deliveries.
//! - [`server`] binds the listener, accepts connections and owns shutdown.
//! - [`protocol`] is the newline-delimited wire format.
//! - [`sink`] is the event/audit log collaborator (tracing and log files).
//! - [`cli`], [`config`] and [`client`] back the `lan-chat` binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod sink;

pub use config::ServerConfig;
pub use error::ChatError;
pub use server::{ChatServer, ServerHandle};
