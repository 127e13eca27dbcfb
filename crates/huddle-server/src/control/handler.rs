use super::connections::{ConnectionHandle, broadcast, write_outbound};
use super::{Inbound, control_codec, next_inbound};
use crate::error::{RelayError, Result};
use crate::services::{Departure, Download, Participant, PresenterDecision, SessionGuard, Upload};
use crate::state::AppState;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, Stream, StreamExt};
use huddle_protocol::{ClientMessage, ServerMessage, StreamKind};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long queued events may take to flush once a connection is done
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a connection stopped being served
enum Exit {
    Left,
    Cancelled,
    Failed(RelayError),
}

enum Flow {
    Continue,
    Leave,
}

/// Serve one control connection from handshake to cleanup
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
    }

    let framed = Framed::new(stream, control_codec(state.config.max_frame_length));
    let (mut sink, mut source) = framed.split::<Bytes>();

    // First message must be a join
    let handshake = timeout(state.config.handshake_timeout(), next_inbound(&mut source)).await;
    let (session, username, media_port) = match read_join(handshake) {
        Ok(join) => join,
        Err(e) => {
            tracing::info!(peer = %peer, "Handshake failed: {}", e);
            if !matches!(e, RelayError::ConnectionLost(_)) {
                let reply = if e.closes_connection() {
                    e.to_event()
                } else {
                    e.to_rejection()
                };
                let _ = sink.send(reply.encode()).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (handle, events) =
        ConnectionHandle::channel(peer, state.config.outbound_queue, &state.shutdown);
    let endpoint = media_port
        .filter(|port| *port != 0)
        .map(|port| SocketAddr::new(peer.ip(), port));

    let id = match admit(&state, &session, &username, handle.clone(), endpoint).await {
        Ok(id) => id,
        Err(e) => {
            tracing::info!(peer = %peer, session = %session, "Join rejected: {}", e);
            let _ = sink.send(e.to_rejection().encode()).await;
            let _ = sink.close().await;
            return;
        }
    };

    let (bulk, bulk_rx) = mpsc::channel(state.config.download_queue);
    let mut writer = tokio::spawn(write_outbound(
        sink,
        events,
        bulk_rx,
        handle.shutdown_token().clone(),
    ));

    tracing::info!(
        peer = %peer,
        session = %session,
        participant = %id,
        "{} connected",
        username
    );

    let mut connection = Connection {
        state,
        id,
        session,
        username,
        peer,
        handle,
        bulk,
        uploads: HashMap::new(),
        downloads: JoinSet::new(),
    };
    let exit = connection.serve(&mut source).await;
    connection.finish(exit).await;

    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        tracing::debug!(peer = %peer, "Outbound writer did not drain in time");
        writer.abort();
    }
}

/// Register a joiner, greet it with a snapshot and announce it
///
/// The snapshot is read under the session guard after registration, so every
/// presenter change or new file shows up for the joiner exactly once: in the
/// snapshot or as a later event.
async fn admit(
    state: &AppState,
    session: &str,
    username: &str,
    connection: ConnectionHandle,
    endpoint: Option<SocketAddr>,
) -> Result<Uuid> {
    let outcome = state
        .sessions
        .join(session, username, connection.clone(), endpoint)
        .await?;
    let id = outcome.participant_id;
    let roster = outcome.session.members();

    connection.send(&ServerMessage::Joined {
        participant_id: id,
        session: session.to_string(),
        participants: roster.iter().map(Participant::info).collect(),
        presenter: state.presenter.holder(session).await,
        files: state.files.inventory(session).await,
    });

    if let Some(me) = roster.iter().find(|p| p.id == id) {
        broadcast(
            &roster,
            &ServerMessage::ParticipantJoined {
                participant: me.info(),
            },
            Some(id),
        );
    }
    broadcast(
        &roster,
        &ServerMessage::Notice {
            text: format!("{} has joined the session", username),
        },
        Some(id),
    );
    Ok(id)
}

type Handshake = std::result::Result<Result<Inbound>, tokio::time::error::Elapsed>;

fn read_join(handshake: Handshake) -> Result<(String, String, Option<u16>)> {
    match handshake {
        Err(_) => Err(RelayError::InvalidJoin("no join received in time".into())),
        Ok(Ok(Inbound::Message(ClientMessage::Join {
            session,
            username,
            media_port,
        }))) => Ok((session, username, media_port)),
        Ok(Ok(Inbound::Malformed(e))) => Err(RelayError::MalformedMessage(e.to_string())),
        Ok(Ok(_)) => Err(RelayError::InvalidJoin("first message must be join".into())),
        Ok(Err(e)) => Err(e),
    }
}

/// Per-connection state of a joined participant
struct Connection {
    state: AppState,
    id: Uuid,
    session: String,
    username: String,
    peer: SocketAddr,
    handle: ConnectionHandle,
    bulk: mpsc::Sender<Bytes>,
    /// Uploads in progress on this connection, by filename
    uploads: HashMap<String, Upload>,
    downloads: JoinSet<()>,
}

impl Connection {
    async fn serve<S>(&mut self, source: &mut S) -> Exit
    where
        S: Stream<Item = io::Result<BytesMut>> + Unpin,
    {
        let liveness = self.state.config.liveness_timeout();
        let shutdown = self.handle.shutdown_token().clone();
        let mut deadline = Instant::now() + liveness;

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => return Exit::Cancelled,
                Some(finished) = self.downloads.join_next(), if !self.downloads.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::warn!(participant = %self.id, "Download task panicked");
                        }
                    }
                    continue;
                }
                _ = sleep_until(deadline) => {
                    return Exit::Failed(RelayError::ConnectionLost(format!(
                        "no traffic for {}s",
                        liveness.as_secs()
                    )));
                }
                inbound = next_inbound(source) => inbound,
            };
            deadline = Instant::now() + liveness;

            match inbound {
                Ok(Inbound::Message(message)) => {
                    let kind = message.kind_name();
                    match self.dispatch(message).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Leave) => return Exit::Left,
                        Err(e) if e.closes_connection() => return Exit::Failed(e),
                        Err(e) => {
                            tracing::debug!(
                                participant = %self.id,
                                "Rejected {} message: {}",
                                kind,
                                e
                            );
                            self.handle.send(&e.to_event());
                        }
                    }
                }
                Ok(Inbound::Unknown(kind)) => {
                    tracing::debug!(
                        participant = %self.id,
                        "Ignoring unknown message kind 0x{:02x}",
                        kind
                    );
                }
                Ok(Inbound::Malformed(e)) => {
                    tracing::warn!(participant = %self.id, "Malformed message: {}", e);
                    self.handle
                        .send(&RelayError::MalformedMessage(e.to_string()).to_event());
                }
                Err(e) => {
                    if matches!(e, RelayError::Protocol(_)) {
                        self.handle.send(&e.to_event());
                    }
                    return Exit::Failed(e);
                }
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Flow> {
        match message {
            ClientMessage::Chat { message, timestamp } => {
                let sequence = self
                    .state
                    .sessions
                    .next_chat_sequence(self.id)
                    .await
                    .ok_or(RelayError::NotJoined)?;
                let exclude = (!self.state.config.chat_echo).then_some(self.id);
                let event = ServerMessage::Chat {
                    sender_id: self.id,
                    username: self.username.clone(),
                    message,
                    timestamp,
                    sequence,
                };
                broadcast(&self.members().await, &event, exclude);
            }
            ClientMessage::VideoStatus { streaming } => {
                self.set_streaming(StreamKind::Video, streaming).await?;
            }
            ClientMessage::AudioStatus { streaming } => {
                self.set_streaming(StreamKind::Audio, streaming).await?;
            }
            ClientMessage::ScreenShareRequest => self.request_presenter().await?,
            ClientMessage::ScreenShareStop => {
                let session = self.lock_session().await?;
                if self.state.presenter.stop(&self.session, self.id).await {
                    announce_release(&session.members(), self.id, &self.username);
                }
            }
            ClientMessage::FileMetadata {
                session,
                filename,
                size,
            } => {
                if session != self.session {
                    return Err(RelayError::InvalidSession {
                        requested: session,
                        actual: self.session.clone(),
                    });
                }
                if self.uploads.contains_key(&filename) {
                    return Err(RelayError::UploadInProgress(filename));
                }
                let upload = self
                    .state
                    .files
                    .begin_upload(&self.session, &filename, size, self.id, &self.username)
                    .await?;
                self.uploads.insert(filename, upload);
            }
            ClientMessage::FileChunk { filename, data } => {
                let Some(upload) = self.uploads.get_mut(&filename) else {
                    return Err(no_upload(&filename));
                };
                let written = self.state.files.write_chunk(upload, &data).await;
                if let Err(e) = written {
                    if let Some(upload) = self.uploads.remove(&filename) {
                        self.state.files.discard_upload(upload).await;
                    }
                    return Err(e);
                }
            }
            ClientMessage::FileEnd { filename } => {
                let upload = self
                    .uploads
                    .remove(&filename)
                    .ok_or_else(|| no_upload(&filename))?;
                let finished = self.state.files.complete_upload(upload).await?;
                let session = self.lock_session().await?;
                let entry = self.state.files.publish(finished).await;
                let event = ServerMessage::FileAvailable {
                    filename: entry.filename,
                    size: entry.size,
                    sender: entry.sender,
                };
                broadcast(&session.members(), &event, None);
            }
            ClientMessage::FileRequest { filename } => {
                let download = self
                    .state
                    .files
                    .begin_download(&self.session, &filename)
                    .await?;
                tracing::info!(
                    participant = %self.id,
                    "Streaming {} ({} bytes)",
                    download.filename(),
                    download.size()
                );
                self.downloads
                    .spawn(stream_download(download, self.bulk.clone(), self.handle.clone()));
            }
            ClientMessage::Heartbeat { media_port } => {
                if let Some(port) = media_port.filter(|port| *port != 0) {
                    let addr = SocketAddr::new(self.peer.ip(), port);
                    self.state
                        .sessions
                        .rebind_endpoint(self.id, &self.session, addr)
                        .await;
                }
            }
            ClientMessage::Join { .. } => {
                return Err(RelayError::MalformedMessage("already joined".into()));
            }
            ClientMessage::Leave => return Ok(Flow::Leave),
        }
        Ok(Flow::Continue)
    }

    async fn members(&self) -> Vec<Participant> {
        self.state.sessions.list_participants(&self.session).await
    }

    /// Hold the session while publishing state a joiner's snapshot includes
    async fn lock_session(&self) -> Result<SessionGuard> {
        self.state
            .sessions
            .lock(self.id)
            .await
            .ok_or(RelayError::NotJoined)
    }

    async fn set_streaming(&self, kind: StreamKind, streaming: bool) -> Result<()> {
        let updated = self
            .state
            .sessions
            .set_streaming(self.id, kind, streaming)
            .await
            .ok_or(RelayError::NotJoined)?;

        let event = match kind {
            StreamKind::Video => ServerMessage::VideoStatus {
                participant_id: self.id,
                username: updated.username,
                streaming,
            },
            StreamKind::Audio => {
                if !streaming {
                    self.state.mixer.forget(&self.session, self.id).await;
                }
                ServerMessage::AudioStatus {
                    participant_id: self.id,
                    username: updated.username,
                    streaming,
                }
            }
        };
        broadcast(&self.members().await, &event, Some(self.id));
        Ok(())
    }

    async fn request_presenter(&self) -> Result<()> {
        let session = self.lock_session().await?;
        let decision = self
            .state
            .presenter
            .request(&self.session, self.id, &self.username)
            .await;

        let granted = ServerMessage::PresenterGranted {
            participant_id: self.id,
            username: self.username.clone(),
        };
        match decision {
            PresenterDecision::Granted => {
                let members = session.members();
                broadcast(&members, &granted, None);
                broadcast(
                    &members,
                    &ServerMessage::Notice {
                        text: format!("{} started sharing their screen", self.username),
                    },
                    Some(self.id),
                );
            }
            PresenterDecision::AlreadyPresenting => {
                self.handle.send(&granted);
            }
            PresenterDecision::Denied {
                holder_id,
                holder_username,
            } => {
                let reason = RelayError::PresenterConflict {
                    holder: holder_username.clone(),
                }
                .to_string();
                self.handle.send(&ServerMessage::PresenterDenied {
                    holder_id,
                    holder_username,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Cleanup cascade; the connection is unusable afterwards
    async fn finish(mut self, exit: Exit) {
        match &exit {
            Exit::Left => tracing::info!(participant = %self.id, "{} left", self.username),
            Exit::Cancelled => {
                tracing::info!(participant = %self.id, "{} disconnected by server", self.username)
            }
            Exit::Failed(e) => {
                tracing::info!(participant = %self.id, "{} disconnected: {}", self.username, e)
            }
        }

        self.handle.disconnect();
        self.downloads.shutdown().await;
        for (_, upload) in self.uploads.drain() {
            self.state.files.discard_upload(upload).await;
        }
        depart(&self.state, self.id).await;
    }
}

fn no_upload(filename: &str) -> RelayError {
    RelayError::MalformedMessage(format!("no upload of {} in progress", filename))
}

fn announce_release(members: &[Participant], participant_id: Uuid, username: &str) {
    broadcast(
        members,
        &ServerMessage::PresenterReleased { participant_id },
        None,
    );
    broadcast(
        members,
        &ServerMessage::Notice {
            text: format!("{} stopped sharing their screen", username),
        },
        Some(participant_id),
    );
}

/// Remove a participant and tell the rest of the session
///
/// Safe to call repeatedly; only the first call for an id has any effect.
/// Returns whether this call removed the participant.
pub async fn depart(state: &AppState, participant_id: Uuid) -> bool {
    let Some(departure) = state.sessions.leave(participant_id).await else {
        return false;
    };
    let Departure {
        username,
        session_closed,
        session: guard,
        ..
    } = departure;
    let session = guard.name().to_string();

    let released = state.presenter.force_release(&session, participant_id).await;
    state.mixer.forget(&session, participant_id).await;

    if session_closed {
        // The name stays reserved until retired, so this cannot reach a successor
        state.mixer.drop_session(&session).await;
        state.files.drop_session(&session).await;
        state.sessions.retire(guard).await;
    } else {
        let remaining = guard.members();
        if released {
            announce_release(&remaining, participant_id, &username);
        }
        broadcast(
            &remaining,
            &ServerMessage::ParticipantLeft {
                participant_id,
                username: username.clone(),
            },
            None,
        );
        broadcast(
            &remaining,
            &ServerMessage::Notice {
                text: format!("{} has left the session", username),
            },
            None,
        );
        drop(guard);
    }

    let discarded = state.files.discard_owner(participant_id).await;
    if discarded > 0 {
        tracing::debug!(
            session = %session,
            participant = %participant_id,
            "Discarded {} unfinished uploads",
            discarded
        );
    }
    true
}

async fn stream_download(mut download: Download, bulk: mpsc::Sender<Bytes>, connection: ConnectionHandle) {
    let shutdown = connection.shutdown_token().clone();
    let filename = download.filename().to_string();

    let start = ServerMessage::FileStart {
        filename: filename.clone(),
        size: download.size(),
    };
    if !send_bulk(&bulk, &shutdown, start.encode()).await {
        return;
    }

    loop {
        match download.next_chunk().await {
            Ok(Some((offset, data))) => {
                let chunk = ServerMessage::FileChunk {
                    filename: filename.clone(),
                    offset,
                    data,
                };
                if !send_bulk(&bulk, &shutdown, chunk.encode()).await {
                    tracing::debug!("Download of {} abandoned at {} bytes", filename, offset);
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                connection.send(&RelayError::Io(e).to_event());
                return;
            }
        }
    }

    send_bulk(&bulk, &shutdown, ServerMessage::FileEnd { filename }.encode()).await;
}

/// Queue a download frame, waiting for room unless the connection is closing
async fn send_bulk(bulk: &mpsc::Sender<Bytes>, shutdown: &CancellationToken, frame: Bytes) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = bulk.send(frame) => sent.is_ok(),
    }
}
