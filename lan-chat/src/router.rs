//! Turns envelopes into deliveries onto session outbound queues.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::{ChatError, DeliveryFailure},
    protocol,
    registry::Registry,
    session::SessionHandle,
    sink::EventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Broadcast,
    Private,
    System,
    UserListUpdate,
}

/// One message on its way through the router. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub body: String,
}

impl Envelope {
    /// Chat from `sender` to everyone else; the body carries the display prefix.
    pub fn broadcast(sender: &str, text: &str) -> Self {
        Self {
            kind: EnvelopeKind::Broadcast,
            sender: Some(sender.to_string()),
            recipient: None,
            body: protocol::chat_line(sender, text),
        }
    }

    pub fn private(sender: &str, recipient: &str, text: &str) -> Self {
        Self {
            kind: EnvelopeKind::Private,
            sender: Some(sender.to_string()),
            recipient: Some(recipient.to_string()),
            body: text.to_string(),
        }
    }

    /// Server notice about `subject`, who does not receive it.
    pub fn system(subject: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::System,
            sender: subject.map(str::to_string),
            recipient: None,
            body: body.into(),
        }
    }

    pub fn user_list<S: AsRef<str>>(usernames: &[S]) -> Self {
        Self {
            kind: EnvelopeKind::UserListUpdate,
            sender: None,
            recipient: None,
            body: protocol::join_usernames(usernames),
        }
    }

    /// The line as it goes out on the wire.
    pub fn render(&self) -> String {
        match self.kind {
            EnvelopeKind::Broadcast => self.body.clone(),
            EnvelopeKind::System => protocol::system_line(&self.body),
            EnvelopeKind::UserListUpdate => protocol::users_line(&self.body),
            EnvelopeKind::Private => {
                protocol::private_line(self.sender.as_deref().unwrap_or_default(), &self.body)
            }
        }
    }
}

/// Stateless delivery logic over the shared [`Registry`].
///
/// Every send is a non-blocking enqueue. A recipient whose queue is full or
/// gone is closed, which makes its own session run the normal disconnect
/// path; the sender never hears about it.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    sink: Arc<dyn EventSink>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    /// Dispatches by kind and returns how many sessions the line was queued for.
    pub async fn deliver(&self, envelope: &Envelope) -> usize {
        match envelope.kind {
            EnvelopeKind::Private => usize::from(self.deliver_private(envelope).await),
            EnvelopeKind::UserListUpdate => self.deliver_to_all(&envelope.render()).await,
            EnvelopeKind::Broadcast | EnvelopeKind::System => {
                self.deliver_broadcast(envelope).await
            }
        }
    }

    /// Sends to every live session except the sender.
    pub async fn deliver_broadcast(&self, envelope: &Envelope) -> usize {
        let line = envelope.render();
        let mut delivered = 0;

        for session in self.registry.snapshot().await {
            if envelope.sender.as_deref() == Some(session.username()) {
                continue;
            }
            if send(&session, &line) {
                delivered += 1;
            }
        }

        debug!(kind = ?envelope.kind, delivered, "broadcast delivered");
        delivered
    }

    /// Sends a tagged private line to the session named by `recipient`.
    /// Returns `false` when nobody by that name is connected.
    pub async fn deliver_private(&self, envelope: &Envelope) -> bool {
        let Some(recipient) = envelope.recipient.as_deref() else {
            return false;
        };

        let target = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .find(|session| session.username() == recipient);

        let Some(target) = target else {
            debug!(recipient, "private message target not found");
            return false;
        };

        let delivered = send(&target, &envelope.render());
        if delivered {
            let from = envelope.sender.as_deref().unwrap_or_default();
            self.sink
                .log_message(&format!("{from} -> {recipient}"), &envelope.body);
        }
        delivered
    }

    /// Sends the current roster to every live session.
    pub async fn broadcast_user_list(&self) -> usize {
        let usernames = self.registry.usernames_snapshot().await;
        self.deliver(&Envelope::user_list(&usernames)).await
    }

    async fn deliver_to_all(&self, line: &str) -> usize {
        let mut delivered = 0;
        for session in self.registry.snapshot().await {
            if send(&session, line) {
                delivered += 1;
            }
        }
        delivered
    }
}

fn send(session: &SessionHandle, line: &str) -> bool {
    match session.try_deliver(line.to_string()) {
        Ok(()) => true,
        Err(DeliveryFailure::Closed) => {
            debug!(id = %session.id(), user = session.username(), "skipping closed session");
            session.close();
            false
        }
        Err(reason @ DeliveryFailure::QueueFull) => {
            let err = ChatError::Delivery {
                user: session.username().to_string(),
                reason,
            };
            warn!(
                id = %session.id(),
                peer = %session.peer(),
                error = %err,
                "dropping unreachable session"
            );
            session.close();
            false
        }
    }
}
