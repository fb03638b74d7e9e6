//! # Session Transport
//!
//! The remote speech session is modelled as a message-passing boundary rather
//! than a set of callbacks:
//!
//! - **outbound channel**: `Outbound::Media` for every captured frame, `Outbound::Close` once
//! - **inbound channel**: `SessionEvent::{Open, Message, Closed, Error}`
//!
//! `SessionConnector` is the seam. `GeminiLiveConnector` speaks the real
//! WebSocket protocol; tests feed synthetic events through the same channels.

pub mod gemini;
pub mod messages;

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use gemini::GeminiLiveConnector;
pub use messages::{ConnectRequest, RealtimeInput, ServerMessage};

/// Lifecycle and data events coming from the remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session is ready to receive audio.
    Open,
    /// A decoded server message (audio chunks, interruption, ...).
    Message(ServerMessage),
    /// The remote side closed the session.
    Closed { reason: Option<String> },
    /// The session failed.
    Error(String),
}

/// Commands for the task that owns the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Media(RealtimeInput),
    Close,
}

/// Sending half of an established session.
#[derive(Debug, Clone)]
pub struct SessionSender {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SessionSender {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue one realtime input message.
    pub fn send(&self, input: RealtimeInput) -> Result<()> {
        self.outbound
            .send(Outbound::Media(input))
            .map_err(|_| anyhow!("remote session {} is closed", self.id))
    }

    /// Ask the session to close. Fails if it is already gone.
    pub fn close(&self) -> Result<()> {
        self.outbound
            .send(Outbound::Close)
            .map_err(|_| anyhow!("remote session {} already closed", self.id))
    }
}

/// An established session: a sender plus the stream of inbound events.
#[derive(Debug)]
pub struct RemoteSession {
    pub sender: SessionSender,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl RemoteSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            sender: SessionSender {
                id: Uuid::new_v4(),
                outbound,
            },
            events,
        }
    }
}

/// Establishes remote sessions.
///
/// The returned future resolves once the transport is usable; the session
/// reports `SessionEvent::Open` on its event channel when audio may flow.
pub trait SessionConnector: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<RemoteSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::messages::MediaBlob;

    #[test]
    fn test_sender_reports_closed_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let session = RemoteSession::new(tx, event_rx);
        let sender = session.sender.clone();
        drop(rx);

        let input = RealtimeInput {
            media: MediaBlob {
                data: String::new(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            },
        };
        assert!(sender.send(input).is_err());
        assert!(sender.close().is_err());
    }

    #[test]
    fn test_sender_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let session = RemoteSession::new(tx, event_rx);

        for data in ["a", "b"] {
            session
                .sender
                .send(RealtimeInput {
                    media: MediaBlob {
                        data: data.to_string(),
                        mime_type: "audio/pcm;rate=16000".to_string(),
                    },
                })
                .unwrap();
        }
        session.sender.close().unwrap();

        match rx.try_recv().unwrap() {
            Outbound::Media(input) => assert_eq!(input.media.data, "a"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Outbound::Media(input) => assert_eq!(input.media.data, "b"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }
}
