//! Per-connection state machine.
//!
//! A session reads the requested username, registers it, then relays each
//! inbound line through the [`Router`]. Outbound lines never go straight to
//! the socket: they are queued on a bounded channel and written by a writer
//! that runs alongside the reader, so a slow client only ever stalls itself.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc::{self, error::TrySendError},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{ChatError, DeliveryFailure},
    protocol::{self, Command},
    registry::Registry,
    router::{Envelope, Router},
    sink::EventSink,
};

/// How long a closing session keeps trying to flush already-queued lines.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    AwaitingName,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connected, AwaitingName)
                | (AwaitingName, Active)
                | (AwaitingName, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// What the registry and router hold for a registered session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: Arc<str>,
    peer: SocketAddr,
    outbound: mpsc::Sender<String>,
    closer: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        username: &str,
        peer: SocketAddr,
        outbound: mpsc::Sender<String>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id,
            username: Arc::from(username),
            peer,
            outbound,
            closer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues one line without waiting.
    pub fn try_deliver(&self, line: String) -> Result<(), DeliveryFailure> {
        if self.closer.is_cancelled() {
            return Err(DeliveryFailure::Closed);
        }
        self.outbound.try_send(line).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryFailure::QueueFull,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Asks the session to wind down. Unblocks a pending read.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// Everything a session needs from the server it belongs to.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub router: Router,
    pub sink: Arc<dyn EventSink>,
    pub outbound_capacity: usize,
}

impl SessionContext {
    pub fn new(
        registry: Arc<Registry>,
        sink: Arc<dyn EventSink>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            router: Router::new(Arc::clone(&registry), Arc::clone(&sink)),
            registry,
            sink,
            outbound_capacity,
        }
    }
}

enum ReadOutcome {
    Line(String),
    Eof,
    Failed(ChatError),
    Cancelled,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: SessionState,
    closer: CancellationToken,
}

impl Session {
    /// `closer` should be a child of the server's shutdown token so that
    /// stopping the server unblocks this session's reads.
    pub fn new(id: SessionId, peer: SocketAddr, closer: CancellationToken) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Connected,
            closer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drives the connection to completion and returns the final state.
    pub async fn run<S>(mut self, stream: S, ctx: &SessionContext) -> SessionState
    where
        S: AsyncRead + AsyncWrite,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let (outbound, queue) = mpsc::channel(ctx.outbound_capacity.max(1));
        let closer = self.closer.clone();
        let writer = drain_outbound(queue, writer, self.closer.clone());

        let session = async {
            self.drive(&mut reader, outbound, ctx).await;
            closer.cancel();
        };
        tokio::join!(session, writer);

        self.advance(SessionState::Closed);
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(id = %self.id, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }

    async fn drive<R>(
        &mut self,
        reader: &mut R,
        outbound: mpsc::Sender<String>,
        ctx: &SessionContext,
    ) where
        R: AsyncBufRead + Unpin,
    {
        self.advance(SessionState::AwaitingName);

        let requested = match next_line(reader, &self.closer).await {
            ReadOutcome::Line(line) => protocol::requested_username(&line),
            ReadOutcome::Eof => None,
            ReadOutcome::Failed(err) => {
                debug!(id = %self.id, error = %err, "could not read username");
                None
            }
            ReadOutcome::Cancelled => {
                self.advance(SessionState::Closing);
                return;
            }
        };
        let username =
            requested.unwrap_or_else(|| protocol::placeholder_username(self.id.value()));

        let handle = SessionHandle::new(
            self.id,
            &username,
            self.peer,
            outbound,
            self.closer.clone(),
        );
        if let Err(err) = ctx.registry.register(handle.clone()).await {
            let _ = handle.try_deliver(protocol::name_taken_line(&username));
            ctx.sink
                .log_error(&format!("rejected connection from {}: {err}", self.peer));
            self.advance(SessionState::Closing);
            return;
        }

        self.advance(SessionState::Active);
        ctx.sink.log_connect(&username, self.peer);
        info!(id = %self.id, peer = %self.peer, %username, "client joined");

        ctx.router
            .deliver(&Envelope::system(
                Some(&username),
                protocol::joined_notice(&username),
            ))
            .await;
        ctx.router.broadcast_user_list().await;

        self.relay(reader, &handle, ctx).await;

        self.advance(SessionState::Closing);
        if ctx.registry.unregister(self.id).await.is_some() {
            ctx.sink.log_disconnect(&username);
            info!(id = %self.id, %username, "client left");
            ctx.router
                .deliver(&Envelope::system(
                    Some(&username),
                    protocol::left_notice(&username),
                ))
                .await;
            ctx.router.broadcast_user_list().await;
        }
    }

    /// The `Active` read loop. Returns when the session should close.
    async fn relay<R>(&self, reader: &mut R, handle: &SessionHandle, ctx: &SessionContext)
    where
        R: AsyncBufRead + Unpin,
    {
        let username = handle.username();

        loop {
            let line = match next_line(reader, &self.closer).await {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Eof | ReadOutcome::Cancelled => return,
                ReadOutcome::Failed(err) => {
                    ctx.sink
                        .log_error(&format!("error with client {username}: {err}"));
                    return;
                }
            };

            match protocol::parse_command(&line) {
                Command::Blank => {}
                Command::Quit => return,
                Command::Private { target, text } => {
                    let envelope = Envelope::private(username, &target, &text);
                    let reply = if ctx.router.deliver_private(&envelope).await {
                        protocol::private_sent_line(&target)
                    } else {
                        protocol::private_failed_line(&target)
                    };
                    if let Err(reason) = handle.try_deliver(reply) {
                        debug!(id = %self.id, %reason, "could not queue reply");
                        return;
                    }
                }
                Command::Chat(text) => {
                    ctx.sink.log_message(username, &text);
                    ctx.router
                        .deliver(&Envelope::broadcast(username, &text))
                        .await;
                }
            }
        }
    }
}

async fn next_line<R>(reader: &mut R, closer: &CancellationToken) -> ReadOutcome
where
    R: AsyncBufRead + Unpin,
{
    select! {
        biased;
        _ = closer.cancelled() => ReadOutcome::Cancelled,
        line = protocol::read_line(reader) => match line {
            Ok(Some(line)) => ReadOutcome::Line(line),
            Ok(None) => ReadOutcome::Eof,
            Err(err) => ReadOutcome::Failed(err.into()),
        },
    }
}

/// Writes queued lines until the session closes, then gives the remaining
/// backlog [`FLUSH_GRACE`] to go out before shutting the write half down.
async fn drain_outbound<W>(
    mut queue: mpsc::Receiver<String>,
    mut writer: W,
    closer: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let flush = async {
        loop {
            let line = select! {
                biased;
                line = queue.recv() => line,
                _ = closer.cancelled() => None,
            };
            let Some(line) = line else { break };
            if let Err(err) = protocol::write_line(&mut writer, &line).await {
                debug!(error = %err, "client write failed");
                closer.cancel();
                return;
            }
        }

        while let Ok(line) = queue.try_recv() {
            if protocol::write_line(&mut writer, &line).await.is_err() {
                return;
            }
        }
    };

    let deadline = async {
        closer.cancelled().await;
        sleep(FLUSH_GRACE).await;
    };

    select! {
        _ = flush => {}
        _ = deadline => debug!("gave up flushing a stalled client"),
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
pub(crate) fn test_handle(id: SessionId, username: &str) -> (SessionHandle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(4);
    let peer = SocketAddr::from(([127, 0, 0, 1], 40_000));
    (
        SessionHandle::new(id, username, peer, tx, CancellationToken::new()),
        rx,
    )
}
