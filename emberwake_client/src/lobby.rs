// Lobby-side message application: the two-phase protocol for
// session-control traffic.
//
// Phase one, `apply_immediate`, runs on the network thread before a message
// is queued. It handles the reactions that must not wait behind the queue —
// binding the connection ID the moment our own acceptance arrives — and
// decides whether the message still goes to the consumer.
//
// Phase two, `apply_to_lobby`, runs on the consumer thread as the controller
// drains the inbound queue. It mutates the lobby replica and notifies the
// embedder's `LobbyObserver`. Host changes swap the `is_host` derivation and
// report the new mode in the same step, so there is never a window in which
// two peers both act as host.

use std::sync::Mutex;

use log::warn;
use uuid::Uuid;

use emberwake_protocol::message::{ServerMessage, StartRefusal};
use emberwake_protocol::state::SessionState;
use emberwake_protocol::types::{ConnectionId, PlayerColor};

use crate::lock_or_recover;
use crate::queue::InboundQueue;

/// Callbacks into the lobby/session UI. Default bodies are empty so
/// embedders implement only what they present.
pub trait LobbyObserver: Send {
    /// Our own connection was accepted and bound.
    fn connected(&mut self, _connection_id: ConnectionId, _is_host: bool) {}
    fn peer_joined(&mut self, _names: &[String]) {}
    fn chat_received(&mut self, _name: &str, _text: &str) {}
    fn state_updated(&mut self, _state: &SessionState) {}
    /// Host authority moved; `is_host` is this peer's new mode.
    fn host_changed(&mut self, _is_host: bool) {}
    fn start_refused(&mut self, _reason: &StartRefusal) {}
    fn game_started(&mut self, _state: &SessionState) {}
    fn peer_disconnected(&mut self, _name: &str) {}
    /// Established connection dropped unexpectedly. Terminal.
    fn connection_lost(&mut self) {}
    /// The authority shut down or refused us mid-session. Terminal.
    fn session_closed(&mut self) {}
}

/// The consumer-side lobby view: the state replica plus the observer that
/// presents it.
pub struct LobbyContext {
    pub state: SessionState,
    pub observer: Box<dyn LobbyObserver>,
}

impl LobbyContext {
    pub fn new(observer: Box<dyn LobbyObserver>) -> Self {
        Self {
            state: SessionState::default(),
            observer,
        }
    }

    /// Discard the replica for a fresh lobby (new session, same process).
    pub fn reset(&mut self) {
        self.state = SessionState::default();
    }
}

/// Process-local identity. `connection_id` is assigned by the authority and
/// unstable across sessions; `is_host` is derived, never stored.
#[derive(Debug, Default)]
pub struct Identity {
    pub connection_id: Option<ConnectionId>,
    pub host_id: Option<ConnectionId>,
}

impl Identity {
    pub fn is_host(&self) -> bool {
        self.connection_id.is_some() && self.connection_id == self.host_id
    }
}

/// Whether a message continues to the consumer queue after its immediate
/// hook ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueDecision {
    Queue,
    Drop,
}

/// Immediate-decision hook, network thread. Must not block on UI work.
pub fn apply_immediate(
    msg: &ServerMessage,
    identity: &Mutex<Identity>,
    own_uuid: Uuid,
) -> QueueDecision {
    match msg {
        ServerMessage::Accepted {
            connection_id,
            client_uuid,
            host_id,
            ..
        } => {
            // We are the subject of this acceptance: bind the connection ID
            // right away rather than after a queue delay.
            if *client_uuid == own_uuid {
                let mut identity = lock_or_recover(identity);
                identity.connection_id = Some(*connection_id);
                identity.host_id = Some(*host_id);
            }
            QueueDecision::Queue
        }
        ServerMessage::PeerDisconnected { connection_id, .. } => {
            let identity = lock_or_recover(identity);
            if Some(*connection_id) == identity.connection_id {
                // Our own removal; the transport failure that follows is the
                // terminal notification.
                QueueDecision::Drop
            } else {
                QueueDecision::Queue
            }
        }
        _ => QueueDecision::Queue,
    }
}

/// Consumer-thread application of one queued session-control message.
pub fn apply_to_lobby(
    msg: ServerMessage,
    ctx: &mut LobbyContext,
    identity: &Mutex<Identity>,
    own_uuid: Uuid,
    queue: &InboundQueue,
) {
    match msg {
        ServerMessage::Accepted {
            connection_id,
            client_uuid,
            names,
            ..
        } => {
            if client_uuid == own_uuid {
                let is_host = lock_or_recover(identity).is_host();
                ctx.observer.connected(connection_id, is_host);
            } else {
                ctx.observer.peer_joined(&names);
            }
        }
        ServerMessage::Refused { reason } => {
            warn!("authority refused us mid-session: {reason}");
            ctx.observer.session_closed();
        }
        ServerMessage::Chat { name, text, .. } => {
            ctx.observer.chat_received(&name, &text);
        }
        ServerMessage::StateSync { state } => {
            ctx.state = state;
            ctx.observer.state_updated(&ctx.state);
        }
        ServerMessage::HostChanged { new_host } => {
            // Swap the derivation and report the new mode in one step.
            let is_host = {
                let mut identity = lock_or_recover(identity);
                identity.host_id = Some(new_host);
                identity.is_host()
            };
            ctx.observer.host_changed(is_host);
        }
        ServerMessage::PeerDisconnected { name, .. } => {
            ctx.observer.peer_disconnected(&name);
        }
        ServerMessage::StartRefused { reason } => {
            ctx.observer.start_refused(&reason);
        }
        ServerMessage::GameStarted { state } => {
            // Freeze the drain: whatever lobby traffic is still queued stays
            // queued until the game view is installed.
            queue.pause();
            ctx.state = state;
            ctx.observer.game_started(&ctx.state);
        }
        ServerMessage::Shutdown => {
            ctx.observer.session_closed();
        }
        ServerMessage::Effect(effect) => {
            warn!(
                "state effect {:?} reached the lobby queue, dropping",
                effect.kind()
            );
        }
    }
}

/// Colors driven by this peer, per the lobby replica.
pub fn my_colors(state: &SessionState, identity: &Mutex<Identity>) -> Vec<PlayerColor> {
    match lock_or_recover(identity).connection_id {
        Some(connection) => state.colors_of(connection),
        None => Vec::new(),
    }
}
