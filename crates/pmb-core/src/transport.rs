//! Transport port: the chat network is consumed as a black-box client that
//! emits events on a serial stream and accepts a few commands.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    credentials::{CredentialUpdate, SessionCredentials},
    domain::{ChatId, InboundMessage},
    Result,
};

/// Authentication challenge surfaced while pairing. The payload is opaque to us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Challenge {
    Qr(String),
    PairingCode(String),
}

/// Why the transport closed, mapped from its status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::ConnectionLost,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    /// Only an explicit logout is terminal; everything else is retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::BadSession => f.write_str("bad session"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::Other(code) => write!(f, "status {code}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Challenge(Challenge),
    Open,
    Close(DisconnectReason),
    CredentialsUpdate(CredentialUpdate),
    Message(InboundMessage),
}

/// Commands accepted by an open transport session.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()>;

    /// Ask for a pairing code for `phone`. The code arrives later as a
    /// [`Challenge::PairingCode`] event.
    async fn request_pairing_code(&self, phone: &str) -> Result<()>;

    /// Close the connection without invalidating credentials.
    async fn close(&self) -> Result<()>;

    /// Unlink this device. The transport answers with a logged-out close.
    async fn logout(&self) -> Result<()>;
}

pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn open(&self, credentials: Option<SessionCredentials>) -> Result<TransportConnection>;
}
