use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::protocol::DEFAULT_PORT;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runtime settings for [`crate::server::ChatServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Lines a session may have queued before it counts as unreachable.
    pub outbound_capacity: usize,
    /// How long `stop` waits for sessions before aborting them.
    pub shutdown_grace: Duration,
    /// Directory for `server.log` and `messages.log`; file logging is off when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port; what tests want.
    pub fn local_ephemeral() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
