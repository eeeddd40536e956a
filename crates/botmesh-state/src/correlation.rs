//! Outstanding actions awaiting a response, keyed by echo token.
//!
//! Each token resolves at most once. Entries whose peer never answers are
//! reclaimed by [`PendingCorrelations::sweep_expired`]; dropping the sender
//! wakes the waiting caller with a closed channel.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use botmesh_protocol::ActionResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Finished tokens remembered for status queries.
const RECENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Created,
    AwaitingResponse,
    Resolved,
    TimedOut,
}

struct Pending {
    tx: oneshot::Sender<ActionResponse>,
    created_at: Instant,
    state: ActionState,
}

#[derive(Default)]
struct Inner {
    live: HashMap<String, Pending>,
    recent: VecDeque<(String, ActionState)>,
}

impl Inner {
    fn finish(&mut self, echo: String, state: ActionState) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back((echo, state));
    }
}

#[derive(Default)]
pub struct PendingCorrelations {
    inner: Mutex<Inner>,
}

impl PendingCorrelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh echo token and the channel its response arrives on.
    pub async fn register(&self) -> (String, oneshot::Receiver<ActionResponse>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        let mut echo = uuid::Uuid::new_v4().to_string();
        while inner.live.contains_key(&echo) {
            echo = uuid::Uuid::new_v4().to_string();
        }
        inner.live.insert(
            echo.clone(),
            Pending {
                tx,
                created_at: Instant::now(),
                state: ActionState::Created,
            },
        );
        (echo, rx)
    }

    /// The frame carrying `echo` has been handed to the peer.
    pub async fn mark_sent(&self, echo: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.live.get_mut(echo) {
            Some(p) => {
                p.state = ActionState::AwaitingResponse;
                true
            }
            None => false,
        }
    }

    /// Drop a token whose frame could not be sent.
    pub async fn cancel(&self, echo: &str) -> bool {
        self.inner.lock().await.live.remove(echo).is_some()
    }

    /// Deliver a response. Returns false if the token is unknown, already
    /// resolved or expired.
    pub async fn resolve(&self, echo: &str, response: ActionResponse) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.live.remove(echo) else {
            return false;
        };
        inner.finish(echo.to_string(), ActionState::Resolved);
        drop(inner);

        if pending.tx.send(response).is_err() {
            tracing::debug!(echo, "Response arrived after the caller stopped waiting");
        }
        true
    }

    /// Remove every entry older than `ttl`. Returns the number reclaimed.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .live
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) > ttl)
            .map(|(echo, _)| echo.clone())
            .collect();
        for echo in &expired {
            inner.live.remove(echo);
            inner.finish(echo.clone(), ActionState::TimedOut);
        }
        expired.len()
    }

    pub async fn state(&self, echo: &str) -> Option<ActionState> {
        let inner = self.inner.lock().await;
        if let Some(p) = inner.live.get(echo) {
            return Some(p.state);
        }
        inner
            .recent
            .iter()
            .rev()
            .find(|(e, _)| e == echo)
            .map(|(_, s)| *s)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn tokens_are_unique() {
        let pending = PendingCorrelations::new();
        let (a, _ra) = pending.register().await;
        let (b, _rb) = pending.register().await;
        assert_ne!(a, b);
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test]
    async fn state_follows_lifecycle() {
        let pending = PendingCorrelations::new();
        let (echo, rx) = pending.register().await;
        assert_eq!(pending.state(&echo).await, Some(ActionState::Created));
        pending.mark_sent(&echo).await;
        assert_eq!(pending.state(&echo).await, Some(ActionState::AwaitingResponse));

        assert!(pending.resolve(&echo, ActionResponse::ok(Value::Null, None)).await);
        assert_eq!(pending.state(&echo).await, Some(ActionState::Resolved));
        assert_eq!(rx.await.unwrap().status, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_old_entries() {
        let pending = PendingCorrelations::new();
        let (old, rx) = pending.register().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let (fresh, _keep) = pending.register().await;

        assert_eq!(pending.sweep_expired(Duration::from_secs(60)).await, 1);
        assert_eq!(pending.state(&old).await, Some(ActionState::TimedOut));
        assert_eq!(pending.state(&fresh).await, Some(ActionState::Created));
        assert!(rx.await.is_err());
    }
}
