//! Outbound half of a peer socket.
//!
//! The socket's writer task owns the receiving end; everything else in the
//! gateway only ever holds a [`PeerLink`] and never touches the socket.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::StateError;

/// Default queue depth between frame producers and a socket writer.
pub const LINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// A text frame to write.
    Frame(String),
    /// Close the socket with the given reason.
    Close(String),
}

#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: String,
    tx: mpsc::Sender<LinkCommand>,
}

impl PeerLink {
    pub fn channel(peer: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<LinkCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                peer: peer.into(),
                tx,
            },
            rx,
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a text frame without waiting. Never blocks the caller on a
    /// slow socket.
    pub fn try_send_text(&self, text: String) -> Result<(), StateError> {
        self.tx.try_send(LinkCommand::Frame(text)).map_err(|e| match e {
            TrySendError::Full(_) => StateError::LinkFull(self.peer.clone()),
            TrySendError::Closed(_) => StateError::LinkClosed(self.peer.clone()),
        })
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        self.try_send_text(serde_json::to_string(value)?)
    }

    /// Ask the writer to close the socket. A link that is already gone is
    /// closed by definition.
    pub fn close(&self, reason: &str) {
        let _ = self.tx.try_send(LinkCommand::Close(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_the_writer_in_order() {
        let (link, mut rx) = PeerLink::channel("bot:1", 4);
        link.try_send_text("a".into()).unwrap();
        link.send_json(&serde_json::json!({"b": 1})).unwrap();
        link.close("bye");

        assert_eq!(rx.recv().await, Some(LinkCommand::Frame("a".into())));
        assert_eq!(rx.recv().await, Some(LinkCommand::Frame("{\"b\":1}".into())));
        assert_eq!(rx.recv().await, Some(LinkCommand::Close("bye".into())));
    }

    #[test]
    fn dropped_writer_reports_closed() {
        let (link, rx) = PeerLink::channel("worker:w", 4);
        drop(rx);
        assert!(link.is_closed());
        assert!(matches!(link.try_send_text("x".into()), Err(StateError::LinkClosed(_))));
    }

    #[test]
    fn full_link_reports_full() {
        let (link, _rx) = PeerLink::channel("bot:2", 1);
        link.try_send_text("1".into()).unwrap();
        assert!(matches!(link.try_send_text("2".into()), Err(StateError::LinkFull(_))));
    }
}
