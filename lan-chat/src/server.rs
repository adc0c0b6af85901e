//! Listener and server lifecycle.

use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::Mutex,
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::ChatError,
    registry::Registry,
    session::{Session, SessionContext},
    sink::EventSink,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// TEST-NET-1; only used to pick an outbound interface.
const ROUTE_PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// A bound but not yet accepting chat server.
pub struct ChatServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<Registry>,
    sink: Arc<dyn EventSink>,
}

impl ChatServer {
    /// Binds the listening socket. Nothing is spawned unless this succeeds.
    pub async fn bind(config: ServerConfig, sink: Arc<dyn EventSink>) -> Result<Self, ChatError> {
        let addr = config.bind_addr();
        let bound = async {
            let listener = TcpListener::bind(addr).await?;
            let local_addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, local_addr))
        };

        let (listener, local_addr) = match bound.await {
            Ok(bound) => bound,
            Err(source) => {
                let err = ChatError::bind(addr, source);
                sink.log_error(&format!("unable to start server: {err}"));
                return Err(err);
            }
        };

        Ok(Self {
            listener,
            local_addr,
            config,
            registry: Arc::new(Registry::new()),
            sink,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Spawns the accept loop and returns a handle for stopping it.
    pub fn start(self) -> ServerHandle {
        let ChatServer {
            listener,
            local_addr,
            config,
            registry,
            sink,
        } = self;

        let shutdown = CancellationToken::new();
        let ctx = SessionContext::new(Arc::clone(&registry), sink, config.outbound_capacity);
        ctx.sink
            .log_server_event(&format!("server started on {local_addr}"));

        let accept_loop = tokio::spawn(accept_loop(
            listener,
            ctx,
            shutdown.clone(),
            config.shutdown_grace,
        ));

        ServerHandle {
            local_addr,
            registry,
            shutdown,
            accept_loop: Mutex::new(Some(accept_loop)),
        }
    }

    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let handle = self.start();
        shutdown.await;
        handle.stop().await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Binds and starts a server in one step.
pub async fn start(
    config: ServerConfig,
    sink: Arc<dyn EventSink>,
) -> Result<ServerHandle, ChatError> {
    Ok(ChatServer::bind(config, sink).await?.start())
}

/// Addresses clients on the LAN can use to reach a server bound at `local`.
///
/// A wildcard bind is resolved to the IPv4 address of the interface that
/// carries the default route. Connecting a UDP socket only selects a route;
/// nothing is sent. An empty result means no non-loopback route exists.
pub async fn lan_addrs(local: SocketAddr) -> Vec<SocketAddr> {
    if !local.ip().is_unspecified() {
        return vec![local];
    }

    let probe = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(ROUTE_PROBE_TARGET).await?;
        socket.local_addr()
    };

    match probe.await {
        Ok(routed) if !routed.ip().is_loopback() && !routed.ip().is_unspecified() => {
            vec![SocketAddr::new(routed.ip(), local.port())]
        }
        Ok(_) => Vec::new(),
        Err(err) => {
            debug!(error = ?err, "no route for LAN address discovery");
            Vec::new()
        }
    }
}

/// Control handle for a running server.
///
/// Dropping the handle signals shutdown without waiting for it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops accepting, closes every session and waits for them to finish.
    /// Calling it again after the first call returns immediately.
    pub async fn stop(&self) {
        let Some(accept_loop) = self.accept_loop.lock().await.take() else {
            return;
        };

        self.shutdown.cancel();
        if let Err(err) = accept_loop.await {
            warn!(error = ?err, "accept loop ended abnormally");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let accepted = handle_accept_result(accepted, &ctx, &shutdown, &mut sessions);
                if !accepted && !back_off(&shutdown).await {
                    break;
                }
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                reap(finished, &ctx, sessions.len());
            }
        }
    }

    drop(listener);
    info!("chat server shutting down");
    shutdown_sessions(&ctx, sessions, grace).await;
    ctx.sink.log_server_event("server stopped");
}

/// Returns `false` when the accept itself failed.
fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    ctx: &SessionContext,
    shutdown: &CancellationToken,
    sessions: &mut JoinSet<()>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, ctx, shutdown, sessions);
            ctx.sink.log_server_event(&format!(
                "new connection from {peer} (connected clients: {})",
                sessions.len()
            ));
            true
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            ctx.sink
                .log_error(&format!("error accepting a client: {err}"));
            false
        }
    }
}

/// Pauses after a failed accept so errors like EMFILE do not spin the loop.
/// Returns `false` if shutdown was requested while waiting.
async fn back_off(shutdown: &CancellationToken) -> bool {
    select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(ACCEPT_BACKOFF) => true,
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &SessionContext,
    shutdown: &CancellationToken,
    sessions: &mut JoinSet<()>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "could not disable nagle");
    }

    let session = Session::new(ctx.registry.next_session_id(), peer, shutdown.child_token());
    let ctx = ctx.clone();
    sessions.spawn(async move {
        let id = session.id();
        let state = session.run(stream, &ctx).await;
        debug!(%id, %peer, ?state, "session finished");
    });
}

fn reap(finished: Result<(), tokio::task::JoinError>, ctx: &SessionContext, remaining: usize) {
    if let Err(err) = finished {
        warn!(error = ?err, "session task failed");
    }
    ctx.sink.log_server_event(&format!(
        "client disconnected (connected clients: {remaining})"
    ));
}

async fn shutdown_sessions(ctx: &SessionContext, mut sessions: JoinSet<()>, grace: Duration) {
    // Sessions still waiting for a name are children of the shutdown token
    // and are already cancelled; registered ones are closed explicitly.
    for session in ctx.registry.snapshot().await {
        session.close();
    }

    let drained = timeout(grace, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                warn!(error = ?err, "session task failed during shutdown");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions did not finish within the grace period; aborting"
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}
