use crate::control::connections::ConnectionHandle;
use crate::error::{RelayError, Result};
use huddle_protocol::{ParticipantInfo, StreamKind};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// Longest accepted session or user name, in bytes
pub const MAX_NAME_LEN: usize = 64;

/// A joined participant as seen by fan-out and routing
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: Uuid,
    pub username: String,
    pub connection: ConnectionHandle,
    pub media_endpoint: Option<SocketAddr>,
    pub video_on: bool,
    pub audio_on: bool,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id,
            username: self.username.clone(),
            video_on: self.video_on,
            audio_on: self.audio_on,
        }
    }
}

struct Session {
    name: String,
    state: Arc<Mutex<SessionState>>,
}

#[derive(Default)]
struct SessionState {
    members: HashMap<Uuid, Participant>,
    /// Set once the last member left; a closed session is never reused
    closed: bool,
    chat_sequence: u64,
}

/// Exclusive hold on one session's membership
///
/// Joins into the session wait while a guard is alive. Presenter changes and
/// new files are published and broadcast under a guard, so a joiner sees each
/// of them exactly once: in its snapshot, or as an event after it.
pub struct SessionGuard {
    session: Arc<Session>,
    state: OwnedMutexGuard<SessionState>,
}

impl SessionGuard {
    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn members(&self) -> Vec<Participant> {
        self.state.members.values().cloned().collect()
    }
}

/// Result of a successful join
pub struct JoinOutcome {
    pub participant_id: Uuid,
    /// Held until the joiner has been greeted and announced
    pub session: SessionGuard,
}

/// What a removal left behind, for the departure broadcast
pub struct Departure {
    pub participant_id: Uuid,
    pub username: String,
    pub session_closed: bool,
    /// Still held; a closed session goes back through [`SessionRegistry::retire`]
    pub session: SessionGuard,
}

/// Session name → participants
///
/// Each session has its own lock, so joins and leaves in different sessions
/// never wait on each other. The two maps are only held long enough to look
/// up or swap an entry.
pub struct SessionRegistry {
    max_participants: usize,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    participants: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            max_participants,
            sessions: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Add a participant to `session`, creating the session if needed
    ///
    /// The session stays locked until the returned guard is dropped, so
    /// whatever the caller queues for the joiner first precedes every
    /// broadcast that includes it.
    pub async fn join(
        &self,
        session: &str,
        username: &str,
        connection: ConnectionHandle,
        media_endpoint: Option<SocketAddr>,
    ) -> Result<JoinOutcome> {
        validate_name("session", session)?;
        validate_name("username", username)?;

        loop {
            let entry = {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(session.to_string())
                    .or_insert_with(|| {
                        tracing::info!(session, "Session created");
                        Arc::new(Session {
                            name: session.to_string(),
                            state: Arc::new(Mutex::new(SessionState::default())),
                        })
                    })
                    .clone()
            };

            let mut state = entry.state.clone().lock_owned().await;
            if state.closed {
                // Lost a race with the last leave; the next lookup creates a fresh one
                drop(state);
                self.unpublish(&entry).await;
                continue;
            }

            if state.members.len() >= self.max_participants {
                return Err(RelayError::SessionFull {
                    session: session.to_string(),
                    limit: self.max_participants,
                });
            }
            if state.members.values().any(|p| p.username == username) {
                return Err(RelayError::UsernameTaken(username.to_string()));
            }

            let participant_id = Uuid::new_v4();
            state.members.insert(
                participant_id,
                Participant {
                    id: participant_id,
                    username: username.to_string(),
                    connection,
                    media_endpoint,
                    video_on: false,
                    audio_on: false,
                },
            );

            self.participants
                .write()
                .await
                .insert(participant_id, entry.clone());

            tracing::info!(
                session,
                participant = %participant_id,
                "{} joined ({} members)",
                username,
                state.members.len()
            );
            return Ok(JoinOutcome {
                participant_id,
                session: SessionGuard {
                    session: entry,
                    state,
                },
            });
        }
    }

    /// Lock the session `participant_id` belongs to; `None` if it left
    pub async fn lock(&self, participant_id: Uuid) -> Option<SessionGuard> {
        let entry = self.participants.read().await.get(&participant_id).cloned()?;
        let state = entry.state.clone().lock_owned().await;
        if !state.members.contains_key(&participant_id) {
            return None;
        }
        Some(SessionGuard {
            session: entry,
            state,
        })
    }

    /// Remove a participant; `None` if it was already gone
    ///
    /// A session left empty is marked closed but keeps its name until the
    /// returned guard is passed to [`retire`](Self::retire), so cleanup keyed
    /// by the name cannot reach a successor session.
    pub async fn leave(&self, participant_id: Uuid) -> Option<Departure> {
        let entry = self.participants.write().await.remove(&participant_id)?;

        let mut state = entry.state.clone().lock_owned().await;
        let removed = state.members.remove(&participant_id)?;

        let session_closed = state.members.is_empty();
        if session_closed {
            state.closed = true;
        }

        tracing::info!(
            session = %entry.name,
            participant = %participant_id,
            "{} left",
            removed.username
        );

        Some(Departure {
            participant_id,
            username: removed.username,
            session_closed,
            session: SessionGuard {
                session: entry,
                state,
            },
        })
    }

    /// Free the name of a session closed by [`leave`](Self::leave)
    ///
    /// Joins waiting on the guard then create a fresh session.
    pub async fn retire(&self, guard: SessionGuard) {
        if !guard.state.closed {
            return;
        }
        self.unpublish(&guard.session).await;
        tracing::info!(session = %guard.name(), "Session closed");
    }

    async fn unpublish(&self, entry: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&entry.name)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            sessions.remove(&entry.name);
        }
    }

    /// Snapshot of a session's members, empty if it does not exist
    pub async fn list_participants(&self, session: &str) -> Vec<Participant> {
        let Some(entry) = self.sessions.read().await.get(session).cloned() else {
            return Vec::new();
        };
        let state = entry.state.lock().await;
        state.members.values().cloned().collect()
    }

    pub async fn participant(&self, participant_id: Uuid) -> Option<(String, Participant)> {
        let entry = self.participants.read().await.get(&participant_id).cloned()?;
        let state = entry.state.lock().await;
        let participant = state.members.get(&participant_id)?.clone();
        Some((entry.name.clone(), participant))
    }

    /// Point a participant's media traffic at `addr`
    ///
    /// Returns false when `participant_id` is not a member of `session`. An
    /// address held by another member of the same session moves to this one.
    pub async fn rebind_endpoint(&self, participant_id: Uuid, session: &str, addr: SocketAddr) -> bool {
        let Some(entry) = self.participants.read().await.get(&participant_id).cloned() else {
            return false;
        };
        if entry.name != session {
            return false;
        }

        let mut state = entry.state.lock().await;
        let Some(current) = state.members.get(&participant_id).map(|p| p.media_endpoint) else {
            return false;
        };
        if current == Some(addr) {
            return true;
        }

        for (id, other) in state.members.iter_mut() {
            if *id != participant_id && other.media_endpoint == Some(addr) {
                tracing::debug!(
                    session,
                    participant = %id,
                    "Media endpoint {} taken over by {}",
                    addr,
                    participant_id
                );
                other.media_endpoint = None;
            }
        }
        if let Some(participant) = state.members.get_mut(&participant_id) {
            tracing::debug!(
                session,
                participant = %participant_id,
                "Media endpoint bound to {}",
                addr
            );
            participant.media_endpoint = Some(addr);
        }
        true
    }

    /// Update a streaming flag and return the updated participant
    pub async fn set_streaming(
        &self,
        participant_id: Uuid,
        kind: StreamKind,
        streaming: bool,
    ) -> Option<Participant> {
        let entry = self.participants.read().await.get(&participant_id).cloned()?;
        let mut state = entry.state.lock().await;
        let participant = state.members.get_mut(&participant_id)?;
        match kind {
            StreamKind::Video => participant.video_on = streaming,
            StreamKind::Audio => participant.audio_on = streaming,
        }
        Some(participant.clone())
    }

    /// Next chat sequence number in the participant's session
    pub async fn next_chat_sequence(&self, participant_id: Uuid) -> Option<u64> {
        let entry = self.participants.read().await.get(&participant_id).cloned()?;
        let mut state = entry.state.lock().await;
        if !state.members.contains_key(&participant_id) {
            return None;
        }
        state.chat_sequence += 1;
        Some(state.chat_sequence)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RelayError::InvalidJoin(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(RelayError::InvalidJoin(format!(
            "{} longer than {} bytes",
            field, MAX_NAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn handle() -> ConnectionHandle {
        let root = CancellationToken::new();
        let (handle, _rx) = ConnectionHandle::channel("127.0.0.1:1".parse().unwrap(), 8, &root);
        handle
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Join and release the session right away
    async fn join(registry: &SessionRegistry, session: &str, username: &str) -> Result<Uuid> {
        join_at(registry, session, username, None).await
    }

    async fn join_at(
        registry: &SessionRegistry,
        session: &str,
        username: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<Uuid> {
        let outcome = registry.join(session, username, handle(), endpoint).await?;
        Ok(outcome.participant_id)
    }

    /// Leave and finish the departure the way the control handler does
    async fn leave(registry: &SessionRegistry, id: Uuid) -> Option<(bool, usize)> {
        let departure = registry.leave(id).await?;
        let outcome = (departure.session_closed, departure.session.members().len());
        registry.retire(departure.session).await;
        Some(outcome)
    }

    #[tokio::test]
    async fn test_join_respects_cap() {
        let registry = SessionRegistry::new(2);
        join(&registry, "S", "alice").await.unwrap();
        let bob = registry.join("S", "bob", handle(), None).await.unwrap();
        assert_eq!(bob.session.members().len(), 2);
        assert_eq!(bob.session.name(), "S");
        drop(bob);

        let err = join(&registry, "S", "charlie").await.unwrap_err();
        assert!(matches!(err, RelayError::SessionFull { limit: 2, .. }));

        // other sessions are unaffected
        join(&registry, "T", "charlie").await.unwrap();
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_username_unique_within_session() {
        let registry = SessionRegistry::new(8);
        join(&registry, "S", "alice").await.unwrap();
        let err = join(&registry, "S", "alice").await.unwrap_err();
        assert!(matches!(err, RelayError::UsernameTaken(_)));
        join(&registry, "T", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let registry = SessionRegistry::new(8);
        let long = "x".repeat(MAX_NAME_LEN + 1);
        for (session, user) in [("", "alice"), ("S", "  "), (long.as_str(), "alice")] {
            let err = join(&registry, session, user).await.unwrap_err();
            assert!(matches!(err, RelayError::InvalidJoin(_)));
        }
    }

    #[tokio::test]
    async fn test_empty_session_is_destroyed_and_recreated_fresh() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        registry.next_chat_sequence(alice).await.unwrap();

        assert_eq!(leave(&registry, alice).await, Some((true, 0)));
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.list_participants("S").await.is_empty());

        let bob = join(&registry, "S", "bob").await.unwrap();
        assert_eq!(registry.list_participants("S").await.len(), 1);
        assert_eq!(registry.next_chat_sequence(bob).await, Some(1));
    }

    #[tokio::test]
    async fn test_closed_session_keeps_name_until_retired() {
        let registry = Arc::new(SessionRegistry::new(8));
        let alice = join(&registry, "S", "alice").await.unwrap();
        let departure = registry.leave(alice).await.unwrap();
        assert!(departure.session_closed);

        let joining = tokio::spawn({
            let registry = registry.clone();
            async move { join(&registry, "S", "bob").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joining.is_finished());
        assert_eq!(registry.session_count().await, 1);

        registry.retire(departure.session).await;
        let bob = joining.await.unwrap().unwrap();
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.next_chat_sequence(bob).await, Some(1));
    }

    #[tokio::test]
    async fn test_dropped_closed_guard_does_not_wedge_joins() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        drop(registry.leave(alice).await.unwrap());

        join(&registry, "S", "bob").await.unwrap();
        assert_eq!(registry.list_participants("S").await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        join(&registry, "S", "bob").await.unwrap();

        assert_eq!(leave(&registry, alice).await, Some((false, 1)));
        assert!(leave(&registry, alice).await.is_none());
        assert_eq!(registry.list_participants("S").await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_requires_membership() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        let guard = registry.lock(alice).await.unwrap();
        assert_eq!(guard.members().len(), 1);
        drop(guard);

        leave(&registry, alice).await;
        assert!(registry.lock(alice).await.is_none());
        assert!(registry.lock(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_rebind_last_writer_wins() {
        let registry = SessionRegistry::new(8);
        let alice = join_at(&registry, "S", "alice", Some(addr(5000))).await.unwrap();
        let bob = join(&registry, "S", "bob").await.unwrap();

        assert!(registry.rebind_endpoint(bob, "S", addr(5000)).await);
        let (_, alice_now) = registry.participant(alice).await.unwrap();
        let (_, bob_now) = registry.participant(bob).await.unwrap();
        assert_eq!(alice_now.media_endpoint, None);
        assert_eq!(bob_now.media_endpoint, Some(addr(5000)));

        assert!(registry.rebind_endpoint(alice, "S", addr(6000)).await);
        let (_, alice_now) = registry.participant(alice).await.unwrap();
        assert_eq!(alice_now.media_endpoint, Some(addr(6000)));
    }

    #[tokio::test]
    async fn test_rebind_requires_membership() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        assert!(!registry.rebind_endpoint(alice, "T", addr(1)).await);
        assert!(!registry.rebind_endpoint(Uuid::new_v4(), "S", addr(1)).await);
    }

    #[tokio::test]
    async fn test_streaming_flags() {
        let registry = SessionRegistry::new(8);
        let alice = join(&registry, "S", "alice").await.unwrap();
        let updated = registry
            .set_streaming(alice, StreamKind::Audio, true)
            .await
            .unwrap();
        assert!(updated.audio_on);
        assert!(!updated.video_on);
        assert!(updated.info().audio_on);
    }
}
