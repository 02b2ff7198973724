//! Pending call registry
//!
//! Turns a fire-and-forget `toolCall` into an awaitable reply. Each entry is
//! settled exactly once: whichever of resolve, reject, timeout, owner
//! disconnect or shutdown removes it from the map first delivers the outcome.

use crate::error::CallError;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type Outcome = Result<Value, CallError>;

struct PendingEntry {
    sender: oneshot::Sender<Outcome>,
    timer: Option<JoinHandle<()>>,
    owner: String,
}

/// Awaitable side of a registered call.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the call to be settled.
    pub async fn wait(self) -> Outcome {
        // The sender only disappears without sending if the registry itself
        // was dropped, which only happens at shutdown.
        self.rx.await.unwrap_or(Err(CallError::Shutdown))
    }
}

/// Registry of calls awaiting an extension reply.
#[derive(Clone, Default)]
pub struct PendingCalls {
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call owned by `owner_id` that times out after `timeout`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, owner_id: &str, timeout: Duration) -> (PendingReply, String) {
        let id = format!("call-{}", uuid::Uuid::new_v4().simple());
        let (sender, rx) = oneshot::channel();

        self.entries.insert(
            id.clone(),
            PendingEntry {
                sender,
                timer: None,
                owner: owner_id.to_string(),
            },
        );

        let entries = Arc::clone(&self.entries);
        let timer_id = id.clone();
        let timeout_ms = timeout.as_millis() as u64;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = entries.remove(&timer_id) {
                log::warn!("Tool call {} timed out after {} ms", timer_id, timeout_ms);
                let _ = entry.sender.send(Err(CallError::Timeout(timeout_ms)));
            }
        });

        // The entry may already be settled if the timer fired immediately.
        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        (
            PendingReply {
                id: id.clone(),
                rx,
            },
            id,
        )
    }

    /// Fulfil a call with a payload. Unknown or settled ids are ignored.
    pub fn resolve(&self, id: &str, payload: Value) {
        self.settle(id, Ok(payload));
    }

    /// Fail a call. Unknown or settled ids are ignored.
    pub fn reject(&self, id: &str, error: CallError) {
        self.settle(id, Err(error));
    }

    fn settle(&self, id: &str, outcome: Outcome) {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                if entry.sender.send(outcome).is_err() {
                    log::debug!("Caller for call {} stopped waiting", id);
                }
            }
            None => {
                log::debug!("Ignoring reply for unknown or settled call {}", id);
            }
        }
    }

    /// Reject every call owned by `owner_id`. Returns how many were rejected.
    pub fn cleanup_for_owner(&self, owner_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().owner == owner_id)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &ids {
            self.reject(id, CallError::Disconnected);
        }

        if !ids.is_empty() {
            log::info!(
                "Rejected {} pending call(s) owned by disconnected extension {}",
                ids.len(),
                owner_id
            );
        }
        ids.len()
    }

    /// Reject every outstanding call. Returns how many were rejected.
    pub fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.reject(id, CallError::Shutdown);
        }
        ids.len()
    }

    /// Owner of a live call.
    pub fn owner_of(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|entry| entry.value().owner.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_resolve_delivers_payload() {
        let pending = PendingCalls::new();
        let (reply, id) = pending.register("ext-1", LONG);
        assert_eq!(reply.id(), id);
        assert!(pending.contains(&id));

        pending.resolve(&id, json!({ "name": "Frame 1" }));

        assert_eq!(reply.wait().await, Ok(json!({ "name": "Frame 1" })));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_settlement_is_noop() {
        let pending = PendingCalls::new();
        let (reply, id) = pending.register("ext-1", LONG);

        pending.resolve(&id, json!(1));
        pending.resolve(&id, json!(2));
        pending.reject(&id, CallError::Disconnected);

        assert_eq!(reply.wait().await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let pending = PendingCalls::new();
        pending.resolve("call-missing", json!(null));
        pending.reject("call-missing", CallError::Shutdown);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_removes() {
        let pending = PendingCalls::new();
        let (reply, id) = pending.register("ext-1", Duration::from_millis(50));

        let outcome = reply.wait().await;

        assert_eq!(outcome, Err(CallError::Timeout(50)));
        assert!(!pending.contains(&id));
    }

    #[tokio::test]
    async fn test_resolve_cancels_timer() {
        let pending = PendingCalls::new();
        let (reply, id) = pending.register("ext-1", Duration::from_millis(30));
        pending.resolve(&id, json!("done"));

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(reply.wait().await, Ok(json!("done")));
    }

    #[tokio::test]
    async fn test_cleanup_for_owner_only_touches_owner() {
        let pending = PendingCalls::new();
        let (a1, _) = pending.register("ext-a", LONG);
        let (a2, _) = pending.register("ext-a", LONG);
        let (b1, b1_id) = pending.register("ext-b", LONG);

        assert_eq!(pending.cleanup_for_owner("ext-a"), 2);

        assert_eq!(a1.wait().await, Err(CallError::Disconnected));
        assert_eq!(a2.wait().await, Err(CallError::Disconnected));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.owner_of(&b1_id).as_deref(), Some("ext-b"));

        pending.resolve(&b1_id, json!(true));
        assert_eq!(b1.wait().await, Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let pending = PendingCalls::new();
        let (a, _) = pending.register("ext-a", LONG);
        let (b, _) = pending.register("ext-b", LONG);

        assert_eq!(pending.cleanup_all(), 2);
        assert!(pending.is_empty());
        assert_eq!(a.wait().await, Err(CallError::Shutdown));
        assert_eq!(b.wait().await, Err(CallError::Shutdown));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let pending = PendingCalls::new();
        let (_, id1) = pending.register("ext-a", LONG);
        let (_, id2) = pending.register("ext-a", LONG);
        assert_ne!(id1, id2);
        assert!(id1.starts_with("call-"));
    }
}
