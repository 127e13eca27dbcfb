use crate::services::session::Participant;
use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use huddle_protocol::ServerMessage;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outbound side of one participant's control connection
///
/// Fan-out never awaits: events are pushed with `try_send` into a bounded
/// queue, and a recipient whose queue is full is disconnected instead of
/// stalling the sender.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    events: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    peer: SocketAddr,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains
    pub fn channel(
        peer: SocketAddr,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (events, rx) = mpsc::channel(capacity);
        let handle = Self {
            events,
            shutdown: parent.child_token(),
            peer,
        };
        (handle, rx)
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_disconnected(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ask the owning handler to tear the connection down
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    /// Queue an already-encoded frame; returns whether it was accepted
    pub fn deliver(&self, frame: Bytes) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        match self.events.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    peer = %self.peer,
                    "Outbound queue full, disconnecting slow consumer"
                );
                self.disconnect();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer = %self.peer, "Outbound queue closed");
                false
            }
        }
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        self.deliver(message.encode())
    }
}

/// Send one event to every participant in `recipients` except `exclude`
///
/// The message is encoded once and the frame shared. Returns how many
/// recipients accepted it.
pub fn broadcast(recipients: &[Participant], message: &ServerMessage, exclude: Option<Uuid>) -> usize {
    let frame = message.encode();
    let mut delivered = 0;

    for participant in recipients {
        if Some(participant.id) == exclude {
            continue;
        }
        if participant.connection.deliver(frame.clone()) {
            delivered += 1;
        }
    }

    tracing::trace!(
        "Broadcast delivered to {}/{} participants",
        delivered,
        recipients.len()
    );
    delivered
}

/// Drain a connection's queues into its socket
///
/// Events take priority over bulk download chunks so that chat and presenter
/// changes are not held up behind a large file. Returns when both queues are
/// closed or the socket fails.
pub async fn write_outbound<S>(
    mut sink: S,
    mut events: mpsc::Receiver<Bytes>,
    mut bulk: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let mut bulk_open = true;

    loop {
        let frame = tokio::select! {
            biased;
            frame = events.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            frame = bulk.recv(), if bulk_open => match frame {
                Some(frame) => frame,
                None => {
                    bulk_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Control channel write failed: {}", e);
            shutdown.cancel();
            return;
        }
    }

    // Events closed: flush what downloads still queued before closing
    if bulk_open {
        while let Ok(frame) = bulk.try_recv() {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    }
    let _ = sink.close().await;
}
