//! Extension Registry
//!
//! Owns the connected extension peers, the election deciding which one is
//! active, the auto-activation timer, and the tool consumer count reported in
//! `state` broadcasts. Every mutation runs under one lock and performs its
//! effects before releasing it, so a broadcast always reflects the mutation
//! that caused it.

use super::election::{Effect, Election, ElectionEvent};
use crate::error::CallError;
use crate::pending::PendingCalls;
use crate::protocol::{ExtensionMessage, HubMessage, ToolOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue of one extension connection
pub type PeerSender = mpsc::UnboundedSender<HubMessage>;

struct RegistryInner {
    election: Election,
    senders: HashMap<String, PeerSender>,
    /// Armed auto-activation timer
    timer: Option<(u64, CancellationToken)>,
    consumers: usize,
    port: u16,
    asset_server_url: String,
}

/// Registry of connected extension peers.
pub struct ExtensionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    pending: PendingCalls,
    grace: Duration,
}

impl ExtensionRegistry {
    /// Create a registry that cascades disconnects into `pending` and waits
    /// `grace` before auto-activating a sole peer.
    pub fn new(pending: PendingCalls, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                election: Election::new(),
                senders: HashMap::new(),
                timer: None,
                consumers: 0,
                port: 0,
                asset_server_url: String::new(),
            }),
            next_id: AtomicU64::new(1),
            pending,
            grace,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the bound socket port and asset server URL reported in `state`.
    pub fn set_endpoints(&self, port: u16, asset_server_url: impl Into<String>) {
        let mut inner = self.lock();
        inner.port = port;
        inner.asset_server_url = asset_server_url.into();
        Self::broadcast(&inner);
    }

    /// Register a new peer and return its id.
    pub fn connect(self: &Arc<Self>, sender: PeerSender) -> String {
        let id = format!("ext-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();
        inner.senders.insert(id.clone(), sender);
        log::info!("Extension {} connected", id);
        self.apply(&mut inner, ElectionEvent::Connected(id.clone()));
        id
    }

    /// Make `peer_id` the active extension.
    pub fn activate(self: &Arc<Self>, peer_id: &str) {
        let mut inner = self.lock();
        log::info!("Extension {} requested activation", peer_id);
        self.apply(&mut inner, ElectionEvent::Activate(peer_id.to_string()));
    }

    /// Forget `peer_id`, failing its pending calls.
    pub fn disconnect(self: &Arc<Self>, peer_id: &str) {
        let mut inner = self.lock();
        if inner.senders.remove(peer_id).is_some() {
            log::info!("Extension {} disconnected", peer_id);
        }
        self.apply(&mut inner, ElectionEvent::Disconnected(peer_id.to_string()));
    }

    /// Handle a parsed message from `peer_id`.
    pub fn on_message(self: &Arc<Self>, peer_id: &str, message: ExtensionMessage) {
        match message {
            ExtensionMessage::Activate {} => self.activate(peer_id),
            ExtensionMessage::ToolResult { id, payload, error } => {
                match self.pending.owner_of(&id) {
                    Some(owner) if owner == peer_id => {}
                    Some(owner) => {
                        log::warn!(
                            "Extension {} replied to call {} owned by {}, ignoring",
                            peer_id,
                            id,
                            owner
                        );
                        return;
                    }
                    None => {
                        log::debug!("Late or unknown tool result {} from {}", id, peer_id);
                        return;
                    }
                }

                match ExtensionMessage::into_outcome(payload, error) {
                    ToolOutcome::Payload(value) => self.pending.resolve(&id, value),
                    ToolOutcome::Error(message) => {
                        self.pending.reject(&id, CallError::Extension(message))
                    }
                }
            }
        }
    }

    /// A tool consumer attached. Returns the new consumer count.
    pub fn consumer_connected(&self) -> usize {
        let mut inner = self.lock();
        inner.consumers += 1;
        Self::broadcast(&inner);
        inner.consumers
    }

    /// A tool consumer left. Returns the remaining consumer count.
    pub fn consumer_disconnected(&self) -> usize {
        let mut inner = self.lock();
        inner.consumers = inner.consumers.saturating_sub(1);
        Self::broadcast(&inner);
        inner.consumers
    }

    /// The active peer and its outbound queue.
    pub fn active_peer(&self) -> Option<(String, PeerSender)> {
        let inner = self.lock();
        let id = inner.election.active_id()?;
        inner
            .senders
            .get(id)
            .map(|sender| (id.to_string(), sender.clone()))
    }

    pub fn active_id(&self) -> Option<String> {
        self.lock().election.active_id().map(str::to_string)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().election.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers
    }

    /// Current `state` message.
    pub fn snapshot(&self) -> HubMessage {
        Self::state_message(&self.lock())
    }

    /// Drop every peer queue and disarm the timer. Used at shutdown; peer
    /// tasks observe their closed queue and exit.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        if let Some((_, token)) = inner.timer.take() {
            token.cancel();
        }
        inner.senders.clear();
    }

    fn apply(self: &Arc<Self>, inner: &mut RegistryInner, event: ElectionEvent) {
        let effects = inner.election.apply(event);
        for effect in effects {
            match effect {
                Effect::SendRegistered(id) => {
                    if let Some(sender) = inner.senders.get(&id) {
                        let _ = sender.send(HubMessage::Registered { id: id.clone() });
                    }
                }
                Effect::Broadcast => Self::broadcast(inner),
                Effect::CancelPendingFor(id) => {
                    self.pending.cleanup_for_owner(&id);
                }
                Effect::ScheduleAutoActivation(token_id) => {
                    let token = CancellationToken::new();
                    self.spawn_grace_timer(token_id, token.clone());
                    inner.timer = Some((token_id, token));
                }
                Effect::CancelAutoActivation(token_id) => {
                    if let Some((armed, token)) = inner.timer.take() {
                        if armed == token_id {
                            token.cancel();
                        } else {
                            inner.timer = Some((armed, token));
                        }
                    }
                }
            }
        }
    }

    fn spawn_grace_timer(self: &Arc<Self>, token_id: u64, token: CancellationToken) {
        let registry = Arc::clone(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let mut inner = registry.lock();
                    if matches!(inner.timer, Some((armed, _)) if armed == token_id) {
                        inner.timer = None;
                    }
                    registry.apply(&mut inner, ElectionEvent::GraceElapsed(token_id));
                }
            }
        });
    }

    fn state_message(inner: &RegistryInner) -> HubMessage {
        HubMessage::State {
            active_id: inner.election.active_id().map(str::to_string),
            count: inner.consumers,
            extensions: inner.election.len(),
            port: inner.port,
            asset_server_url: inner.asset_server_url.clone(),
        }
    }

    fn broadcast(inner: &RegistryInner) {
        let state = Self::state_message(inner);
        for (id, sender) in &inner.senders {
            if sender.send(state.clone()).is_err() {
                log::debug!("State broadcast to {} failed, peer is closing", id);
            }
        }
    }
}
