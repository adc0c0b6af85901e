use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures the chat core can observe.
///
/// Only [`ChatError::Bind`] is fatal. The others stay inside the session that
/// hit them and surface to everyone else as an ordinary disconnect.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Another live session already owns the requested username.
    #[error("username '{0}' is already in use")]
    NameCollision(String),

    /// Reading from or writing to a client connection failed.
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),

    /// The listening socket could not be bound at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A line could not be queued for one recipient.
    #[error("could not deliver to {user}: {reason}")]
    Delivery { user: String, reason: DeliveryFailure },
}

/// Why a single outbound line was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

impl ChatError {
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// True for errors that terminate the whole process rather than one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }
}
