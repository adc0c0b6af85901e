use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{DEFAULT_OUTBOUND_CAPACITY, ServerConfig},
    protocol::DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections on the LAN.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Lines queued per client before it is treated as unreachable.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Milliseconds to wait for clients to disconnect on shutdown.
    #[arg(long, default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Write server.log and messages.log into this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            outbound_capacity: args.outbound_capacity,
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            log_dir: args.log_dir,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to request when joining.
    #[arg(long)]
    pub username: String,

    /// Address of the server to connect to.
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    pub server: SocketAddr,
}
