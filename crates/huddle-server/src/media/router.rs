//! Media Router
//!
//! Single receive loop for the media socket. Video and screen datagrams are
//! forwarded byte-for-byte to the other members of the sender's session;
//! audio goes through the [`AudioMixer`].

use super::AudioMixer;
use crate::services::{PresenterArbiter, SessionRegistry};
use crate::state::AppState;
use bytes::Bytes;
use huddle_protocol::{MediaDatagram, MediaKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub struct MediaRouter {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionRegistry>,
    presenter: Arc<PresenterArbiter>,
    mixer: Arc<AudioMixer>,
    max_datagram_size: usize,
}

impl MediaRouter {
    pub fn new(socket: Arc<UdpSocket>, state: &AppState) -> Self {
        Self {
            socket,
            sessions: state.sessions.clone(),
            presenter: state.presenter.clone(),
            mixer: state.mixer.clone(),
            max_datagram_size: state.config.max_datagram_size,
        }
    }

    /// Receive and route datagrams until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        // One spare byte tells an oversized datagram apart from a maximal one
        let mut buf = vec![0u8; self.max_datagram_size + 1];
        tracing::info!(
            "Media router listening on {:?}",
            self.socket.local_addr().ok()
        );

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable from a departed client surfaces here
                        tracing::debug!("Media socket receive error: {}", e);
                        continue;
                    }
                },
            };

            if len > self.max_datagram_size {
                tracing::trace!("Dropping oversized datagram ({}+ bytes) from {}", len, from);
                continue;
            }

            for (target, datagram) in self.route(&buf[..len], from).await {
                if let Err(e) = self.socket.send_to(&datagram, target).await {
                    tracing::debug!("Failed to send media to {}: {}", target, e);
                }
            }
        }

        tracing::info!("Media router stopped");
    }

    /// Decide where one received datagram goes
    pub async fn route(&self, packet: &[u8], from: SocketAddr) -> Vec<(SocketAddr, Bytes)> {
        let datagram = match MediaDatagram::parse(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::trace!("Dropping datagram from {}: {}", from, e);
                return Vec::new();
            }
        };

        if !self
            .sessions
            .rebind_endpoint(datagram.sender, datagram.session, from)
            .await
        {
            tracing::trace!(
                "Dropping datagram from {} for unknown participant {} in {}",
                from,
                datagram.sender,
                datagram.session
            );
            return Vec::new();
        }

        let members = self.sessions.list_participants(datagram.session).await;

        match datagram.kind {
            MediaKind::Audio => {
                if datagram.payload.is_empty() {
                    return Vec::new();
                }
                self.mixer
                    .ingest(datagram.session, datagram.sender, datagram.payload, &members)
                    .await
                    .into_iter()
                    .map(|mixed| (mixed.endpoint, mixed.datagram))
                    .collect()
            }
            MediaKind::Video | MediaKind::Screen => {
                if datagram.kind == MediaKind::Screen
                    && self.presenter.holder(datagram.session).await != Some(datagram.sender)
                {
                    tracing::trace!(
                        session = datagram.session,
                        participant = %datagram.sender,
                        "Dropping screen frame from non-presenter"
                    );
                    return Vec::new();
                }

                let frame = Bytes::copy_from_slice(packet);
                members
                    .iter()
                    .filter(|member| member.id != datagram.sender)
                    .filter_map(|member| member.media_endpoint)
                    .map(|endpoint| (endpoint, frame.clone()))
                    .collect()
            }
        }
    }
}
