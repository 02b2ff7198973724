//! Active extension election
//!
//! Pure state machine deciding which extension connection is authoritative.
//! [`Election::apply`] mutates the state for one event and returns the side
//! effects the caller must perform, so the rules can be exercised without a
//! network or timers.

/// One connected extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSlot {
    pub id: String,
    pub active: bool,
}

/// Inputs to the election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    Connected(String),
    Activate(String),
    Disconnected(String),
    /// The auto-activation timer with this token fired
    GraceElapsed(u64),
}

/// Work the caller performs after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send `registered{id}` to this peer only
    SendRegistered(String),
    /// Send `state` to every peer
    Broadcast,
    /// Reject every pending call owned by this peer
    CancelPendingFor(String),
    /// Start the grace timer identified by the token
    ScheduleAutoActivation(u64),
    /// Stop the grace timer identified by the token
    CancelAutoActivation(u64),
}

/// Election state.
#[derive(Debug, Default)]
pub struct Election {
    peers: Vec<PeerSlot>,
    timer: Option<u64>,
    next_timer: u64,
}

impl Election {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[PeerSlot] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.peers.iter().find(|p| p.active).map(|p| p.id.as_str())
    }

    /// Token of the armed grace timer, if any.
    pub fn pending_timer(&self) -> Option<u64> {
        self.timer
    }

    /// Apply one event.
    pub fn apply(&mut self, event: ElectionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            ElectionEvent::Connected(id) => {
                if self.contains(&id) {
                    log::warn!("Extension {} is already registered", id);
                    return effects;
                }
                self.cancel_timer(&mut effects);
                self.peers.push(PeerSlot {
                    id: id.clone(),
                    active: false,
                });
                effects.push(Effect::SendRegistered(id));
                effects.push(Effect::Broadcast);
                self.evaluate_auto_activation(&mut effects);
            }

            ElectionEvent::Activate(id) => {
                if !self.contains(&id) {
                    log::warn!("Ignoring activation from unknown extension {}", id);
                    return effects;
                }
                for peer in &mut self.peers {
                    peer.active = peer.id == id;
                }
                self.cancel_timer(&mut effects);
                effects.push(Effect::Broadcast);
                self.evaluate_auto_activation(&mut effects);
            }

            ElectionEvent::Disconnected(id) => {
                let Some(index) = self.peers.iter().position(|p| p.id == id) else {
                    return effects;
                };
                self.cancel_timer(&mut effects);
                let removed = self.peers.remove(index);
                effects.push(Effect::CancelPendingFor(removed.id));
                effects.push(Effect::Broadcast);
                self.evaluate_auto_activation(&mut effects);
            }

            ElectionEvent::GraceElapsed(token) => {
                if self.timer != Some(token) {
                    // Stale timer
                    return effects;
                }
                self.timer = None;
                if self.peers.len() == 1 && self.active_id().is_none() {
                    self.peers[0].active = true;
                    log::info!("Auto-activated sole extension {}", self.peers[0].id);
                    effects.push(Effect::Broadcast);
                }
            }
        }

        effects
    }

    fn cancel_timer(&mut self, effects: &mut Vec<Effect>) {
        if let Some(token) = self.timer.take() {
            effects.push(Effect::CancelAutoActivation(token));
        }
    }

    /// Arm the grace timer when exactly one peer is connected and none is active.
    fn evaluate_auto_activation(&mut self, effects: &mut Vec<Effect>) {
        if self.timer.is_none() && self.peers.len() == 1 && self.active_id().is_none() {
            self.next_timer += 1;
            self.timer = Some(self.next_timer);
            effects.push(Effect::ScheduleAutoActivation(self.next_timer));
        }
    }
}
