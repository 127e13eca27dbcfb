use crate::services::session::Participant;
use bytes::Bytes;
use huddle_media::{MixBus, PcmFrame};
use huddle_protocol::{MIXER_SENDER, MediaKind, encode_datagram};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

struct AudioSlot {
    frame: PcmFrame,
    received_at: Instant,
}

/// One mixed frame ready to go out
#[derive(Debug, Clone)]
pub struct MixedFrame {
    pub recipient: Uuid,
    pub endpoint: SocketAddr,
    pub datagram: Bytes,
}

/// Latest-frame-only N-1 audio mixer
///
/// Every received frame replaces the sender's slot and immediately produces a
/// fresh mix for each other member with a known media endpoint.
pub struct AudioMixer {
    stale_after: Option<Duration>,
    sessions: Mutex<HashMap<String, HashMap<Uuid, AudioSlot>>>,
}

impl AudioMixer {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            stale_after,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Store `sender`'s frame and mix for everyone else in `members`
    pub async fn ingest(
        &self,
        session: &str,
        sender: Uuid,
        payload: &[u8],
        members: &[Participant],
    ) -> Vec<MixedFrame> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let slots = sessions.entry(session.to_string()).or_default();
        slots.insert(
            sender,
            AudioSlot {
                frame: PcmFrame::from_le_bytes(payload),
                received_at: now,
            },
        );

        if members.len() < 2 {
            return Vec::new();
        }

        // Departed members may still have a slot if their cleanup is in flight
        slots.retain(|id, _| members.iter().any(|m| m.id == *id));

        let mut bus = MixBus::new();
        let mut fresh: HashMap<Uuid, &PcmFrame> = HashMap::new();
        for (id, slot) in slots.iter() {
            let stale = self
                .stale_after
                .is_some_and(|limit| now.duration_since(slot.received_at) > limit);
            if !stale {
                bus.add(&slot.frame);
                fresh.insert(*id, &slot.frame);
            }
        }

        let mut out = Vec::with_capacity(members.len() - 1);
        for member in members {
            if member.id == sender {
                continue;
            }
            let Some(endpoint) = member.media_endpoint else {
                continue;
            };

            let mix = bus.mix_excluding(fresh.get(&member.id).copied());
            match encode_datagram(MediaKind::Audio, MIXER_SENDER, session, &mix.to_le_bytes()) {
                Ok(datagram) => out.push(MixedFrame {
                    recipient: member.id,
                    endpoint,
                    datagram,
                }),
                Err(e) => {
                    tracing::debug!(session, "Cannot package mixed audio: {}", e);
                    break;
                }
            }
        }

        tracing::trace!(
            session,
            "Mixed {} contributions for {} recipients",
            bus.contributors(),
            out.len()
        );
        out
    }

    /// Drop a participant's slot, e.g. when they mute or leave
    pub async fn forget(&self, session: &str, participant_id: Uuid) {
        if let Some(slots) = self.sessions.lock().await.get_mut(session) {
            slots.remove(&participant_id);
        }
    }

    pub async fn drop_session(&self, session: &str) {
        self.sessions.lock().await.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::connections::ConnectionHandle;
    use huddle_media::FRAME_SAMPLES;
    use huddle_protocol::MediaDatagram;
    use tokio_util::sync::CancellationToken;

    fn member(port: Option<u16>) -> Participant {
        let root = CancellationToken::new();
        let (connection, _rx) =
            ConnectionHandle::channel("127.0.0.1:1".parse().unwrap(), 4, &root);
        Participant {
            id: Uuid::new_v4(),
            username: format!("user{}", port.unwrap_or(0)),
            connection,
            media_endpoint: port.map(|p| SocketAddr::from(([127, 0, 0, 1], p))),
            video_on: false,
            audio_on: true,
        }
    }

    fn pcm(value: i16) -> Bytes {
        PcmFrame::from_samples(vec![value; FRAME_SAMPLES]).to_le_bytes()
    }

    fn decode(frame: &MixedFrame) -> PcmFrame {
        let parsed = MediaDatagram::parse(&frame.datagram).unwrap();
        assert_eq!(parsed.kind, MediaKind::Audio);
        assert_eq!(parsed.sender, MIXER_SENDER);
        PcmFrame::from_le_bytes(parsed.payload)
    }

    fn mix_for(frames: &[MixedFrame], recipient: Uuid) -> PcmFrame {
        let frame = frames.iter().find(|f| f.recipient == recipient).unwrap();
        decode(frame)
    }

    fn constant(value: i16) -> PcmFrame {
        PcmFrame::from_samples(vec![value; FRAME_SAMPLES])
    }

    #[tokio::test]
    async fn test_each_recipient_hears_everyone_else() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1)), member(Some(2)), member(Some(3))];
        let (alice, bob, charlie) = (members[0].id, members[1].id, members[2].id);

        mixer.ingest("S", alice, &pcm(100), &members).await;
        mixer.ingest("S", bob, &pcm(20), &members).await;
        let out = mixer.ingest("S", charlie, &pcm(3), &members).await;

        // charlie's own frame is never sent back to charlie
        assert_eq!(out.len(), 2);
        assert_eq!(mix_for(&out, alice), constant(23));
        assert_eq!(mix_for(&out, bob), constant(103));

        // bob's mix also excludes bob once alice sends again
        let out = mixer.ingest("S", alice, &pcm(100), &members).await;
        assert_eq!(mix_for(&out, bob), constant(103));
        assert_eq!(mix_for(&out, charlie), constant(120));
    }

    #[tokio::test]
    async fn test_silent_until_others_speak() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1)), member(Some(2))];
        let out = mixer.ingest("S", members[0].id, &pcm(500), &members).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, members[1].id);
        assert_eq!(decode(&out[0]), constant(500));

        // the sender has no one else's frame yet, so bob hears only alice
        let out = mixer.ingest("S", members[1].id, &pcm(-7), &members).await;
        assert_eq!(mix_for(&out, members[0].id), constant(-7));
    }

    #[tokio::test]
    async fn test_single_member_is_noop() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1))];
        assert!(mixer.ingest("S", members[0].id, &pcm(1), &members).await.is_empty());
    }

    #[tokio::test]
    async fn test_recipients_without_endpoint_are_skipped() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1)), member(None), member(Some(3))];
        let out = mixer.ingest("S", members[0].id, &pcm(9), &members).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, members[2].id);
    }

    #[tokio::test]
    async fn test_mix_saturates() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1)), member(Some(2)), member(Some(3))];
        mixer.ingest("S", members[0].id, &pcm(30_000), &members).await;
        let out = mixer.ingest("S", members[1].id, &pcm(30_000), &members).await;
        assert_eq!(mix_for(&out, members[2].id), constant(i16::MAX));
    }

    #[tokio::test]
    async fn test_stale_frames_become_silence() {
        let mixer = AudioMixer::new(Some(Duration::from_millis(20)));
        let members = vec![member(Some(1)), member(Some(2)), member(Some(3))];
        mixer.ingest("S", members[0].id, &pcm(100), &members).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let out = mixer.ingest("S", members[1].id, &pcm(5), &members).await;
        assert_eq!(mix_for(&out, members[2].id), constant(5));
    }

    #[tokio::test]
    async fn test_forget_and_departed_members() {
        let mixer = AudioMixer::new(None);
        let members = vec![member(Some(1)), member(Some(2)), member(Some(3))];
        mixer.ingest("S", members[0].id, &pcm(100), &members).await;
        mixer.forget("S", members[0].id).await;
        let out = mixer.ingest("S", members[1].id, &pcm(5), &members).await;
        assert_eq!(mix_for(&out, members[2].id), constant(5));

        // members[1] departs; its slot must not leak into later mixes
        let remaining = vec![members[0].clone(), members[2].clone()];
        let out = mixer.ingest("S", members[2].id, &pcm(1), &remaining).await;
        assert_eq!(mix_for(&out, members[0].id), constant(1));
    }
}
