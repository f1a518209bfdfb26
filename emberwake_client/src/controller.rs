// The session controller: owns the channel, the process identity, and the
// wiring between network thread, inbound queue, and dispatch registry.
//
// One controller lives for the whole process (its session UUID is generated
// once at construction); sessions are opened and closed through it. Opening
// either spawns a local authority and dials it, or dials a remote address —
// both paths send the `Connecting` handshake and hand the read half of the
// connection to a dedicated network thread.
//
// The network thread blocks on `recv` and classifies every message:
// state effects go straight to the dispatch registry against the installed
// game context; session-control messages run their immediate-decision hook
// and are queued for the consumer thread unless the hook consumed them.
//
// Teardown sends `Disconnecting` (tagged with whether the local authority
// should exit too), closes the channel, and then drain-joins: the inbound
// queue is drained repeatedly while waiting for the network thread, because
// that thread may still be pushing final messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use uuid::Uuid;

use emberwake_protocol::message::{
    ClientMessage, PROTOCOL_VERSION, ServerMessage, SessionMode, StartRefusal, StateEffect,
};
use emberwake_protocol::state::{RandomMapOptions, ScenarioInfo, SessionState};
use emberwake_protocol::types::{ConnectionId, PlayerColor};

use crate::channel::{CancelToken, MessageReader, ServerChannel};
use crate::dispatch::EffectRegistry;
use crate::error::SessionError;
use crate::game::GameContext;
use crate::launcher::AuthorityProcess;
use crate::lobby::{self, Identity, LobbyContext, QueueDecision, apply_immediate, apply_to_lobby};
use crate::lock_or_recover;
use crate::queue::{Inbound, InboundQueue};

/// Poll interval for the drain-join loop during teardown.
const JOIN_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

pub struct SessionController {
    uuid: Uuid,
    player_names: Vec<String>,
    identity: Arc<Mutex<Identity>>,
    queue: Arc<InboundQueue>,
    registry: Arc<EffectRegistry>,
    game: Arc<Mutex<Option<GameContext>>>,
    channel: Option<Arc<ServerChannel>>,
    network_thread: Option<JoinHandle<()>>,
    cancel: CancelToken,
    disconnecting: Arc<AtomicBool>,
    authority: Option<AuthorityProcess>,
}

impl SessionController {
    /// One controller per process. The session UUID is generated here, once.
    pub fn new(player_names: Vec<String>) -> Self {
        let player_names = if player_names.is_empty() {
            vec!["Player".to_string()]
        } else {
            player_names
        };
        Self {
            uuid: Uuid::new_v4(),
            player_names,
            identity: Arc::new(Mutex::new(Identity::default())),
            queue: Arc::new(InboundQueue::new()),
            registry: Arc::new(EffectRegistry::with_defaults()),
            game: Arc::new(Mutex::new(None)),
            channel: None,
            network_thread: None,
            cancel: CancelToken::new(),
            disconnecting: Arc::new(AtomicBool::new(false)),
            authority: None,
        }
    }

    /// Replace or extend effect handlers. Only possible before a session is
    /// opened — once the network thread holds the registry, it is frozen.
    pub fn registry_mut(&mut self) -> Option<&mut EffectRegistry> {
        Arc::get_mut(&mut self.registry)
    }

    /// Spawn a local authority, wait for its readiness signal, and connect.
    /// A spawn failure is fatal and not retried.
    pub fn open_local(&mut self, mode: SessionMode) -> Result<(), SessionError> {
        if self.network_thread.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        let authority = AuthorityProcess::spawn(self.uuid)?;
        let addr = format!("127.0.0.1:{}", authority.port());
        self.authority = Some(authority);
        match self.open(&addr, mode) {
            Ok(()) => Ok(()),
            Err(e) => {
                // No shutdown request ever reached the child, so joining it
                // could block forever; detach its watcher instead.
                warn!("handshake with the spawned authority failed, detaching it");
                self.authority = None;
                Err(e)
            }
        }
    }

    /// Connect to a remote authority, retrying until it answers.
    pub fn open_remote(&mut self, addr: &str, mode: SessionMode) -> Result<(), SessionError> {
        if self.network_thread.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        self.open(addr, mode)
    }

    fn open(&mut self, addr: &str, mode: SessionMode) -> Result<(), SessionError> {
        self.disconnecting.store(false, Ordering::SeqCst);
        self.cancel.reset();
        *lock_or_recover(&self.identity) = Identity::default();
        *lock_or_recover(&self.game) = None;
        self.queue = Arc::new(InboundQueue::new());

        let (channel, mut reader) = ServerChannel::connect(addr, &self.cancel)?;
        channel.send(&ClientMessage::Connecting {
            protocol_version: PROTOCOL_VERSION,
            client_uuid: self.uuid,
            player_names: self.player_names.clone(),
            mode,
        })?;

        // The handshake answer arrives before the network thread exists.
        let first = reader.recv()?;
        match &first {
            ServerMessage::Accepted { .. } => {}
            ServerMessage::Refused { reason } => {
                channel.close();
                return Err(SessionError::Refused(reason.clone()));
            }
            other => {
                channel.close();
                return Err(SessionError::ProtocolMismatch(format!(
                    "expected acceptance, got {other:?}"
                )));
            }
        }
        if apply_immediate(&first, &self.identity, self.uuid) == QueueDecision::Queue {
            self.queue.push(Inbound::Server(first));
        }
        let (connection_id, is_host) = {
            let identity = lock_or_recover(&self.identity);
            (identity.connection_id, identity.is_host())
        };
        info!("session open as connection {connection_id:?} (host: {is_host})");

        let thread = {
            let channel = channel.clone();
            let queue = self.queue.clone();
            let identity = self.identity.clone();
            let game = self.game.clone();
            let registry = self.registry.clone();
            let disconnecting = self.disconnecting.clone();
            let uuid = self.uuid;
            thread::spawn(move || {
                network_loop(
                    &mut reader,
                    &channel,
                    &queue,
                    &identity,
                    uuid,
                    &game,
                    &registry,
                    &disconnecting,
                );
            })
        };
        self.channel = Some(channel);
        self.network_thread = Some(thread);
        Ok(())
    }

    // --- request senders (the lobby server API) ---------------------------

    fn send(&self, msg: &ClientMessage) -> Result<(), SessionError> {
        let channel = self.channel.as_ref().ok_or(SessionError::NotConnected)?;
        channel.send(msg)?;
        Ok(())
    }

    /// Send a chat line. The `!passhost <id>` command becomes a host
    /// transfer request instead of a message.
    pub fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let mut parts = text.split_whitespace();
        if parts.next() == Some("!passhost")
            && let Some(id) = parts.next().and_then(|s| s.parse::<u32>().ok())
        {
            return self.send(&ClientMessage::TransferHost {
                new_host: ConnectionId(id),
            });
        }
        self.send(&ClientMessage::Chat {
            text: text.to_string(),
        })
    }

    pub fn set_scenario(
        &self,
        scenario: ScenarioInfo,
        random_map: Option<RandomMapOptions>,
    ) -> Result<(), SessionError> {
        self.send(&ClientMessage::SetScenario {
            scenario,
            random_map,
        })
    }

    pub fn set_player_slot(&self, color: PlayerColor) -> Result<(), SessionError> {
        self.send(&ClientMessage::SetPlayerSlot { color })
    }

    pub fn set_slot_controller(
        &self,
        color: PlayerColor,
        computer: bool,
    ) -> Result<(), SessionError> {
        self.send(&ClientMessage::SetSlotController { color, computer })
    }

    pub fn set_difficulty(&self, level: u8) -> Result<(), SessionError> {
        self.send(&ClientMessage::SetDifficulty { level })
    }

    pub fn set_turn_timer(&self, seconds: Option<u32>) -> Result<(), SessionError> {
        self.send(&ClientMessage::SetTurnTimer { seconds })
    }

    pub fn transfer_host(&self, new_host: ConnectionId) -> Result<(), SessionError> {
        self.send(&ClientMessage::TransferHost { new_host })
    }

    /// Request game start. Preconditions the authority would refuse anyway
    /// are checked against the given replica first; on failure nothing is
    /// sent and the refusal comes back as `StartPrecondition`. The authority
    /// revalidates regardless.
    pub fn request_start(
        &self,
        state: &SessionState,
        allow_ai_only: bool,
    ) -> Result<(), SessionError> {
        if !self.is_host() {
            return Err(SessionError::StartPrecondition(StartRefusal::NotHost));
        }
        if state.scenario.is_none() {
            return Err(SessionError::StartPrecondition(StartRefusal::NoScenario));
        }
        if let Some(options) = &state.random_map
            && let Err(reason) = options.validate()
        {
            return Err(SessionError::StartPrecondition(
                StartRefusal::InvalidRandomMapOptions(reason),
            ));
        }
        if !state.has_human_player() && !allow_ai_only {
            return Err(SessionError::StartPrecondition(StartRefusal::NoHumanPlayer));
        }
        self.send(&ClientMessage::RequestStart { allow_ai_only })
    }

    /// Submit an authoritative effect for replication (hosting peer's
    /// simulation only).
    pub fn push_effect(&self, effect: StateEffect) -> Result<(), SessionError> {
        self.send(&ClientMessage::PushEffect(effect))
    }

    // --- queries ----------------------------------------------------------

    pub fn session_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock_or_recover(&self.identity).connection_id
    }

    pub fn host_id(&self) -> Option<ConnectionId> {
        lock_or_recover(&self.identity).host_id
    }

    pub fn is_host(&self) -> bool {
        lock_or_recover(&self.identity).is_host()
    }

    pub fn is_guest(&self) -> bool {
        !self.is_host()
    }

    /// True when this peer spawned the authority it is connected to.
    pub fn is_server_local(&self) -> bool {
        self.authority.is_some()
    }

    pub fn my_colors(&self, state: &SessionState) -> Vec<PlayerColor> {
        lobby::my_colors(state, &self.identity)
    }

    pub fn my_first_color(&self, state: &SessionState) -> Option<PlayerColor> {
        self.my_colors(state).first().copied()
    }

    pub fn is_my_color(&self, color: PlayerColor, state: &SessionState) -> bool {
        self.my_colors(state).contains(&color)
    }

    // --- consumer-thread operations ---------------------------------------

    /// Drain the inbound queue, applying each session-control message to the
    /// lobby in arrival order. Stops when the queue is empty or paused.
    /// Call from the UI/game-loop thread.
    pub fn process_inbound(&self, ctx: &mut LobbyContext) {
        while let Some(entry) = self.queue.pop() {
            match entry {
                Inbound::Server(msg) => {
                    apply_to_lobby(msg, ctx, &self.identity, self.uuid, &self.queue);
                }
                Inbound::ConnectionLost => ctx.observer.connection_lost(),
            }
        }
    }

    /// Install the in-game dispatch target and resume the (paused) queue for
    /// post-start session-control traffic.
    pub fn begin_game(&self, ctx: GameContext) {
        *lock_or_recover(&self.game) = Some(ctx);
        self.queue.resume();
    }

    /// Remove the game context at game end, returning it to the embedder.
    pub fn end_game(&self) -> Option<GameContext> {
        lock_or_recover(&self.game).take()
    }

    /// Run `f` against the installed game context, if any. The network
    /// thread dispatches under the same lock, so keep `f` short.
    pub fn with_game<R>(&self, f: impl FnOnce(&mut GameContext) -> R) -> Option<R> {
        lock_or_recover(&self.game).as_mut().map(f)
    }

    /// Orderly teardown: announce the disconnect, close the channel, and
    /// drain-join the network thread. Safe to call when already closed.
    pub fn close(&mut self, ctx: &mut LobbyContext) {
        self.cancel.cancel();
        self.disconnecting.store(true, Ordering::SeqCst);

        if let Some(channel) = &self.channel {
            if channel.is_alive() {
                let shutdown_server = self.is_server_local();
                let _ = channel.send(&ClientMessage::Disconnecting { shutdown_server });
            }
            channel.close();
        }

        // Final messages may still be in flight; keep draining while the
        // network thread winds down.
        self.queue.resume();
        if let Some(handle) = self.network_thread.take() {
            while !handle.is_finished() {
                self.process_inbound(ctx);
                thread::sleep(JOIN_DRAIN_INTERVAL);
            }
            if handle.join().is_err() {
                warn!("network thread panicked during teardown");
            }
            self.process_inbound(ctx);
        }

        self.channel = None;
        *lock_or_recover(&self.game) = None;
        *lock_or_recover(&self.identity) = Identity::default();

        if let Some(authority) = self.authority.take() {
            authority.join();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Unblock and detach; an orderly close() should have happened first.
        self.cancel.cancel();
        self.disconnecting.store(true, Ordering::SeqCst);
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }
}

/// Blocking receive loop, one per live connection.
#[expect(clippy::too_many_arguments)]
fn network_loop(
    reader: &mut MessageReader,
    channel: &Arc<ServerChannel>,
    queue: &Arc<InboundQueue>,
    identity: &Arc<Mutex<Identity>>,
    uuid: Uuid,
    game: &Arc<Mutex<Option<GameContext>>>,
    registry: &Arc<EffectRegistry>,
    disconnecting: &Arc<AtomicBool>,
) {
    loop {
        match reader.recv() {
            Ok(ServerMessage::Effect(effect)) => {
                let mut game_guard = lock_or_recover(game);
                match game_guard.as_mut() {
                    Some(ctx) => {
                        if registry.dispatch(ctx, effect).is_err() {
                            // Protocol mismatch: fatal for this connection.
                            drop(game_guard);
                            channel.close();
                            queue.push(Inbound::ConnectionLost);
                            break;
                        }
                    }
                    None => warn!("state effect received with no game in progress, dropping"),
                }
            }
            Ok(msg) => {
                if apply_immediate(&msg, identity, uuid) == QueueDecision::Queue {
                    queue.push(Inbound::Server(msg));
                }
            }
            Err(_) if disconnecting.load(Ordering::SeqCst) => {
                info!("connection to authority closed, ending network thread");
                break;
            }
            Err(e) => {
                error!("lost connection to authority: {e}");
                queue.push(Inbound::ConnectionLost);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_controller_is_unbound_guest() {
        let controller = SessionController::new(vec!["Aila".into()]);
        assert_eq!(controller.connection_id(), None);
        assert!(!controller.is_host());
        assert!(controller.is_guest());
        assert!(!controller.is_server_local());
    }

    #[test]
    fn senders_require_an_open_session() {
        let controller = SessionController::new(vec!["Aila".into()]);
        assert!(matches!(
            controller.send_chat("hello"),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn start_request_checks_preconditions_locally() {
        let controller = SessionController::new(vec!["Aila".into()]);
        // Not connected, so not host: refused before anything is sent.
        let result = controller.request_start(&SessionState::default(), false);
        assert!(matches!(
            result,
            Err(SessionError::StartPrecondition(StartRefusal::NotHost))
        ));
    }

    #[test]
    fn registry_is_frozen_once_shared() {
        let mut controller = SessionController::new(vec!["Aila".into()]);
        assert!(controller.registry_mut().is_some());
        let clone = controller.registry.clone();
        assert!(controller.registry_mut().is_none());
        drop(clone);
    }
}
