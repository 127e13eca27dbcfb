use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    participant_id: Uuid,
    username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterDecision {
    Granted,
    /// The requester already holds the lock; nothing changed
    AlreadyPresenting,
    Denied {
        holder_id: Uuid,
        holder_username: String,
    },
}

/// Single-holder screen share lock, one per session
///
/// Sessions with no entry are idle. A holder is always a session member, so
/// releasing on the holder's departure leaves no entry behind for a destroyed
/// session.
#[derive(Default)]
pub struct PresenterArbiter {
    holders: Mutex<HashMap<String, Holder>>,
}

impl PresenterArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(&self, session: &str, participant_id: Uuid, username: &str) -> PresenterDecision {
        let mut holders = self.holders.lock().await;
        match holders.get(session) {
            Some(holder) if holder.participant_id == participant_id => {
                PresenterDecision::AlreadyPresenting
            }
            Some(holder) => PresenterDecision::Denied {
                holder_id: holder.participant_id,
                holder_username: holder.username.clone(),
            },
            None => {
                holders.insert(
                    session.to_string(),
                    Holder {
                        participant_id,
                        username: username.to_string(),
                    },
                );
                tracing::info!(session, participant = %participant_id, "Presenter lock granted");
                PresenterDecision::Granted
            }
        }
    }

    /// Release the lock if `participant_id` holds it; returns whether it did
    pub async fn stop(&self, session: &str, participant_id: Uuid) -> bool {
        let mut holders = self.holders.lock().await;
        match holders.get(session) {
            Some(holder) if holder.participant_id == participant_id => {
                holders.remove(session);
                tracing::info!(session, participant = %participant_id, "Presenter lock released");
                true
            }
            _ => false,
        }
    }

    /// Release on disconnect; same rule as [`PresenterArbiter::stop`]
    pub async fn force_release(&self, session: &str, participant_id: Uuid) -> bool {
        let released = self.stop(session, participant_id).await;
        if released {
            tracing::debug!(session, participant = %participant_id, "Presenter disconnected");
        }
        released
    }

    /// Current presenter; `None` while the session is idle
    pub async fn holder(&self, session: &str) -> Option<Uuid> {
        self.holders
            .lock()
            .await
            .get(session)
            .map(|holder| holder.participant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_grant_deny_stop_grant() {
        let arbiter = PresenterArbiter::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert_eq!(arbiter.request("S", alice, "alice").await, PresenterDecision::Granted);
        assert_eq!(
            arbiter.request("S", bob, "bob").await,
            PresenterDecision::Denied {
                holder_id: alice,
                holder_username: "alice".into()
            }
        );
        assert_eq!(arbiter.holder("S").await, Some(alice));

        assert!(arbiter.stop("S", alice).await);
        assert_eq!(arbiter.holder("S").await, None);
        assert_eq!(arbiter.request("S", bob, "bob").await, PresenterDecision::Granted);
    }

    #[tokio::test]
    async fn test_only_holder_releases() {
        let arbiter = PresenterArbiter::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        arbiter.request("S", alice, "alice").await;
        assert!(!arbiter.stop("S", bob).await);
        assert!(!arbiter.force_release("S", bob).await);
        assert_eq!(arbiter.holder("S").await, Some(alice));

        assert!(arbiter.force_release("S", alice).await);
        assert!(!arbiter.force_release("S", alice).await);
        assert_eq!(arbiter.holder("S").await, None);
    }

    #[tokio::test]
    async fn test_repeat_request_keeps_lock() {
        let arbiter = PresenterArbiter::new();
        let alice = Uuid::new_v4();
        arbiter.request("S", alice, "alice").await;
        assert_eq!(
            arbiter.request("S", alice, "alice").await,
            PresenterDecision::AlreadyPresenting
        );
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let arbiter = PresenterArbiter::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        assert_eq!(arbiter.request("S", alice, "alice").await, PresenterDecision::Granted);
        assert_eq!(arbiter.request("T", bob, "bob").await, PresenterDecision::Granted);

        assert!(arbiter.stop("S", alice).await);
        assert_eq!(arbiter.holder("S").await, None);
        assert_eq!(arbiter.holder("T").await, Some(bob));
    }

    #[tokio::test]
    async fn test_concurrent_requests_grant_exactly_one() {
        let arbiter = Arc::new(PresenterArbiter::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let arbiter = arbiter.clone();
            tasks.push(tokio::spawn(async move {
                arbiter.request("S", Uuid::new_v4(), &format!("user{}", i)).await
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() == PresenterDecision::Granted {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
