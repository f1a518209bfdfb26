// Test-only peer harness for session integration tests.
//
// Wraps a real `SessionController` (from `emberwake_client`) connected to a
// real in-process authority (from `emberwake_server`) and provides
// synchronous, test-friendly polling around the asynchronous pieces: the
// lobby observer records events into a shared log, and `pump_until` drains
// the inbound queue until a predicate holds or a timeout expires.
//
// The only test-specific code here is the recording observers and the
// polling wrappers. All networking, queueing, and dispatch uses the same
// code paths as a live client.
//
// See also: `tests/full_session.rs` for the scenarios.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use emberwake_client::controller::SessionController;
use emberwake_client::lobby::{LobbyContext, LobbyObserver};
use emberwake_client::observers::{GameObserver, ObserverHandle};
use emberwake_protocol::message::{GarrisonSide, SessionMode, StartRefusal};
use emberwake_protocol::state::SessionState;
use emberwake_protocol::types::{ConnectionId, PlayerColor, Position, ResourceKind};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lobby observer recording every callback as a line of text.
#[derive(Clone, Default)]
pub struct LobbyLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl LobbyLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.contains(needle))
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl LobbyObserver for LobbyLog {
    fn connected(&mut self, connection_id: ConnectionId, is_host: bool) {
        self.push(format!("connected id={} host={is_host}", connection_id.0));
    }
    fn peer_joined(&mut self, names: &[String]) {
        self.push(format!("peer_joined {}", names.join(",")));
    }
    fn chat_received(&mut self, name: &str, text: &str) {
        self.push(format!("chat {name}: {text}"));
    }
    fn state_updated(&mut self, _state: &SessionState) {
        self.push("state_sync".into());
    }
    fn host_changed(&mut self, is_host: bool) {
        self.push(format!("host_changed {is_host}"));
    }
    fn start_refused(&mut self, reason: &StartRefusal) {
        self.push(format!("start_refused {reason}"));
    }
    fn game_started(&mut self, _state: &SessionState) {
        self.push("game_started".into());
    }
    fn peer_disconnected(&mut self, name: &str) {
        self.push(format!("peer_disconnected {name}"));
    }
    fn connection_lost(&mut self) {
        self.push("connection_lost".into());
    }
    fn session_closed(&mut self) {
        self.push("session_closed".into());
    }
}

/// Game observer recording every event as a line of text.
#[derive(Clone, Default)]
pub struct GameLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl GameLog {
    /// A registry handle sharing this log's event buffer.
    pub fn handle(&self) -> ObserverHandle {
        Arc::new(Mutex::new(self.clone()))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl GameObserver for GameLog {
    fn resources_changed(&mut self, player: PlayerColor, resource: ResourceKind, amount: i64) {
        self.push(format!("resources {player:?} {resource:?} {amount}"));
    }
    fn hero_moved(&mut self, hero: &emberwake_client::game::Hero, _from: Position, to: Position) {
        self.push(format!("hero_moved {:?} to {},{}", hero.id, to.x, to.y));
    }
    fn hero_recruited(&mut self, hero: &emberwake_client::game::Hero) {
        self.push(format!("hero_recruited {:?} for {:?}", hero.id, hero.owner));
    }
    fn object_removed(&mut self, object: &emberwake_client::game::MapObject) {
        self.push(format!("object_removed {:?}", object.id));
    }
    fn garrison_swapped(&mut self, left: GarrisonSide, right: GarrisonSide) {
        self.push(format!(
            "garrison_swapped {:?}<->{:?}",
            left.owner, right.owner
        ));
    }
    fn battle_started(&mut self, attacker: PlayerColor, defender: PlayerColor, _at: Position) {
        self.push(format!("battle_started {attacker:?} vs {defender:?}"));
    }
    fn battle_ended(&mut self, winner: Option<PlayerColor>) {
        self.push(format!("battle_ended winner={winner:?}"));
    }
    fn dialog_shown(&mut self, text: &str) {
        self.push(format!("dialog {text}"));
    }
    fn turn_advanced(&mut self, day: u32) {
        self.push(format!("turn {day}"));
    }
    fn player_eliminated(&mut self, player: PlayerColor, victorious: bool) {
        self.push(format!("eliminated {player:?} victorious={victorious}"));
    }
}

/// A test peer: real controller, real connection, recording lobby observer.
pub struct TestPeer {
    pub controller: SessionController,
    pub ctx: LobbyContext,
    pub log: LobbyLog,
}

impl TestPeer {
    /// Connect to an authority and complete the handshake.
    pub fn connect(addr: std::net::SocketAddr, name: &str) -> Self {
        let mut controller = SessionController::new(vec![name.to_string()]);
        controller
            .open_remote(&addr.to_string(), SessionMode::NewGame)
            .expect("TestPeer::connect failed");
        let log = LobbyLog::default();
        let ctx = LobbyContext::new(Box::new(log.clone()));
        Self {
            controller,
            ctx,
            log,
        }
    }

    /// Drain the inbound queue once.
    pub fn pump(&mut self) {
        self.controller.process_inbound(&mut self.ctx);
    }

    /// Pump until the predicate holds, panicking after `POLL_TIMEOUT`.
    pub fn pump_until(&mut self, what: &str, mut pred: impl FnMut(&TestPeer) -> bool) {
        let start = Instant::now();
        loop {
            self.pump();
            if pred(self) {
                return;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}; lobby log: {:?}",
                self.log.events()
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Pump until the lobby log contains `needle`.
    pub fn pump_until_event(&mut self, needle: &str) {
        self.pump_until(needle, |peer| peer.log.contains(needle));
    }

    /// Current lobby replica.
    pub fn state(&self) -> SessionState {
        self.ctx.state.clone()
    }

    /// Orderly disconnect.
    pub fn close(&mut self) {
        self.controller.close(&mut self.ctx);
    }
}

/// Wait until a game log contains `needle`, panicking after `POLL_TIMEOUT`.
/// Game effects bypass the lobby queue, so no pumping is involved.
pub fn wait_for_game_event(log: &GameLog, needle: &str) {
    let start = Instant::now();
    while !log.contains(needle) {
        assert!(
            start.elapsed() < POLL_TIMEOUT,
            "timed out waiting for game event {needle}; game log: {:?}",
            log.events()
        );
        thread::sleep(POLL_INTERVAL);
    }
}
