use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::identity::Identity;
use super::protocol::{ClientMessage, ServerMessage};
use super::roster::{Delta, Roster};
use super::state::{ChannelState, CloseReason, StateChange};

/// Default bound on deltas buffered while waiting for the initial snapshot.
pub const DEFAULT_PENDING_LIMIT: usize = 64;

/// Something the driver must do in response to an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write a message to the server.
    Send(ClientMessage),
    /// Report a state transition to observers.
    Transition(StateChange),
    /// Publish a new roster to subscribers.
    Publish(Roster),
    /// Tear down the current connection for the given reason.
    Drop(CloseReason),
}

/// Connection-agnostic roster synchronization state machine.
///
/// Owns the mutable roster and translates connection events and server frames
/// into [`Effect`]s. Performs no I/O itself, so every ordering rule can be
/// exercised without a socket.
pub struct RosterSync {
    identity: Identity,
    state: ChannelState,
    roster: HashSet<String>,
    /// Deltas received in `Open`, replayed in arrival order once the snapshot lands.
    pending: Vec<Delta>,
    pending_limit: usize,
}

impl RosterSync {
    pub fn new(identity: Identity, pending_limit: usize) -> Self {
        Self {
            identity,
            state: ChannelState::Connecting,
            roster: HashSet::new(),
            pending: Vec::new(),
            pending_limit,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn roster(&self) -> Roster {
        Roster::from_set(self.roster.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// A new connection attempt is starting. Returns `None` if already `Connecting`.
    pub fn begin_connect(&mut self) -> Option<StateChange> {
        self.pending.clear();
        self.set_state(ChannelState::Connecting)
    }

    /// The transport is up: identify, then wait for the snapshot.
    pub fn connected(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::Send(ClientMessage::identify(&self.identity))];
        effects.extend(self.set_state(ChannelState::Open).map(Effect::Transition));
        effects
    }

    /// Feed one raw text frame. Unreadable frames are logged and ignored.
    pub fn handle_text(&mut self, text: &str) -> Vec<Effect> {
        match ServerMessage::parse(text) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "ignoring unreadable roster message");
                Vec::new()
            }
        }
    }

    pub fn handle_message(&mut self, msg: ServerMessage) -> Vec<Effect> {
        match msg {
            ServerMessage::Snapshot { online_ids } => self.apply_snapshot(online_ids),
            ServerMessage::EntryAdded { id } => self.apply_delta(Delta::Added(id)),
            ServerMessage::EntryRemoved { id } => self.apply_delta(Delta::Removed(id)),
            ServerMessage::Rejected { reason } => {
                warn!(identity = %self.identity, %reason, "server rejected identity");
                vec![Effect::Drop(CloseReason::ServerRejected)]
            }
        }
    }

    /// The connection ended. The roster is kept so consumers don't flicker to
    /// "nobody online" before the next snapshot.
    pub fn connection_lost(&mut self, reason: CloseReason) -> StateChange {
        self.pending.clear();
        self.state = ChannelState::Closed;
        StateChange::closed(reason)
    }

    /// The backoff timer is about to be armed.
    pub fn schedule_reconnect(&mut self) -> Option<StateChange> {
        self.set_state(ChannelState::Reconnecting)
    }

    fn set_state(&mut self, state: ChannelState) -> Option<StateChange> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(StateChange::new(state))
    }

    fn apply_snapshot(&mut self, online_ids: Vec<String>) -> Vec<Effect> {
        if !matches!(self.state, ChannelState::Open | ChannelState::Identified) {
            warn!(identity = %self.identity, state = %self.state, "snapshot outside an open connection, ignoring");
            return Vec::new();
        }

        self.roster = online_ids.into_iter().collect();
        let buffered = std::mem::take(&mut self.pending);
        let replayed = buffered.len();
        for delta in &buffered {
            delta.apply(&mut self.roster);
        }
        info!(
            identity = %self.identity,
            online = self.roster.len(),
            replayed,
            "roster snapshot applied"
        );

        let mut effects = Vec::with_capacity(2);
        effects.extend(self.set_state(ChannelState::Identified).map(Effect::Transition));
        effects.push(Effect::Publish(self.roster()));
        effects
    }

    fn apply_delta(&mut self, delta: Delta) -> Vec<Effect> {
        match self.state {
            ChannelState::Identified => {
                if delta.apply(&mut self.roster) {
                    debug!(identity = %self.identity, ?delta, "roster delta applied");
                    vec![Effect::Publish(self.roster())]
                } else {
                    debug!(identity = %self.identity, ?delta, "roster delta was a no-op");
                    Vec::new()
                }
            }
            ChannelState::Open => {
                if self.pending.len() >= self.pending_limit {
                    warn!(
                        identity = %self.identity,
                        limit = self.pending_limit,
                        "too many deltas before snapshot, dropping connection"
                    );
                    self.pending.clear();
                    return vec![Effect::Drop(CloseReason::ProtocolError)];
                }
                debug!(identity = %self.identity, ?delta, "buffering delta until snapshot");
                self.pending.push(delta);
                Vec::new()
            }
            state => {
                warn!(identity = %self.identity, %state, id = delta.id(), "delta outside an open connection, discarding");
                Vec::new()
            }
        }
    }
}
