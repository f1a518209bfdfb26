// Authoritative session state for the Emberwake server.
//
// `LobbySession` is the central data structure that `server.rs` drives. It
// owns the canonical `SessionState`, the peer roster, and host tracking. All
// mutation happens through methods called from the server's single-threaded
// main loop — no internal locking.
//
// Key responsibilities:
// - Peer management: handshake validation (protocol version, expected client
//   UUID, capacity, mode), connection ID assignment, host promotion.
// - Lobby mutations: scenario/difficulty/turn-timer/slot changes, with
//   host-only guards. Every accepted mutation is followed by a `StateSync`
//   broadcast so replicas converge by applying messages only.
// - Start validation: structured `StartRefusal` sent to the requester;
//   success freezes the state and broadcasts `GameStarted`.
// - Effect relay: once started, the host's `PushEffect` submissions are
//   re-broadcast to every peer (including the host, the authoritative echo).
//
// Writing to peer streams: the session holds cloned `TcpStream` write halves
// wrapped in `BufWriter`. Write errors on a single peer are logged but do not
// crash the server — the reader thread for that peer will notice the broken
// pipe and report a disconnect.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::TcpStream;

use log::{info, warn};
use uuid::Uuid;

use emberwake_protocol::framing::write_message;
use emberwake_protocol::message::{
    ClientMessage, PROTOCOL_VERSION, ServerMessage, SessionMode, StartRefusal, StateEffect,
};
use emberwake_protocol::state::{RandomMapOptions, ScenarioInfo, SessionState};
use emberwake_protocol::types::{ConnectionId, PlayerColor};

/// Highest selectable difficulty level.
const MAX_DIFFICULTY: u8 = 4;

struct PeerState {
    names: Vec<String>,
    writer: BufWriter<TcpStream>,
}

impl PeerState {
    fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("?")
    }
}

/// Authoritative session managing one lobby and the game that follows it.
pub struct LobbySession {
    /// When spawned by a client, only this UUID may join first.
    expected_client: Option<Uuid>,
    peers: BTreeMap<ConnectionId, PeerState>,
    next_connection_id: u32,
    max_peers: u32,
    host_id: Option<ConnectionId>,
    state: SessionState,
    mode: Option<SessionMode>,
    started: bool,
}

impl LobbySession {
    pub fn new(expected_client: Option<Uuid>, max_peers: u32) -> Self {
        Self {
            expected_client,
            peers: BTreeMap::new(),
            next_connection_id: 0,
            max_peers,
            host_id: None,
            state: SessionState::default(),
            mode: None,
            started: false,
        }
    }

    /// Attempt to admit a peer. Returns the assigned connection ID on
    /// success, or a refusal reason. The returned ID tags the reader thread
    /// for this connection.
    pub fn add_peer(
        &mut self,
        protocol_version: u32,
        client_uuid: Uuid,
        player_names: Vec<String>,
        mode: SessionMode,
        stream: TcpStream,
    ) -> Result<ConnectionId, String> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version mismatch: server {PROTOCOL_VERSION}, client {protocol_version}"
            ));
        }
        if self.started {
            return Err("session already started".into());
        }
        if self.peers.len() as u32 >= self.max_peers {
            return Err("session is full".into());
        }
        if self.peers.is_empty()
            && let Some(expected) = self.expected_client
            && expected != client_uuid
        {
            return Err("session is reserved for the client that spawned it".into());
        }
        match self.mode {
            None => self.mode = Some(mode),
            Some(existing) if existing != mode => {
                return Err("session mode mismatch".into());
            }
            Some(_) => {}
        }

        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        // First peer becomes the host.
        if self.peers.is_empty() {
            self.host_id = Some(id);
        }
        let host_id = self.host_id.unwrap_or(id);

        let accepted = ServerMessage::Accepted {
            connection_id: id,
            client_uuid,
            host_id,
            names: player_names.clone(),
        };
        // Existing peers learn of the newcomer before it is added; the
        // newcomer then receives the same message as its acknowledgement.
        self.broadcast(&accepted);

        let display_name = player_names
            .first()
            .cloned()
            .unwrap_or_else(|| "?".to_string());
        self.peers.insert(
            id,
            PeerState {
                names: player_names,
                writer: BufWriter::new(stream),
            },
        );
        self.send_to(id, &accepted);

        // Seat the newcomer on the first open slot, if the scenario is known.
        if let Some(color) = self.state.first_open_color() {
            self.state.claim_slot(color, id, &display_name);
        }
        self.sync_state();

        info!("peer {} connected as {:?}", display_name, id);
        Ok(id)
    }

    /// Remove a peer: reopen its color slots, announce the departure, and
    /// promote a new host if the host left. Returns the pruned colors.
    pub fn remove_peer(&mut self, id: ConnectionId) -> Vec<PlayerColor> {
        let Some(peer) = self.peers.remove(&id) else {
            return Vec::new();
        };
        let name = peer.display_name().to_string();
        let released = self.state.release_peer(id);
        info!("peer {name} ({id:?}) left, released slots {released:?}");

        self.broadcast(&ServerMessage::PeerDisconnected {
            connection_id: id,
            name,
        });

        if self.host_id == Some(id) {
            self.host_id = self.peers.keys().next().copied();
            if let Some(new_host) = self.host_id {
                info!("host left, promoting {new_host:?}");
                self.broadcast(&ServerMessage::HostChanged { new_host });
            }
        }
        self.sync_state();
        released
    }

    /// Dispatch one already-admitted peer's message. Returns `false` when the
    /// peer committed a protocol violation and must be dropped.
    pub fn handle_message(&mut self, from: ConnectionId, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Chat { text } => self.chat(from, text),
            ClientMessage::SetScenario {
                scenario,
                random_map,
            } => self.set_scenario(from, scenario, random_map),
            ClientMessage::SetPlayerSlot { color } => self.set_player_slot(from, color),
            ClientMessage::SetSlotController { color, computer } => {
                self.set_slot_controller(from, color, computer)
            }
            ClientMessage::SetDifficulty { level } => self.set_difficulty(from, level),
            ClientMessage::SetTurnTimer { seconds } => self.set_turn_timer(from, seconds),
            ClientMessage::TransferHost { new_host } => self.transfer_host(from, new_host),
            ClientMessage::RequestStart { allow_ai_only } => self.try_start(from, allow_ai_only),
            ClientMessage::PushEffect(effect) => return self.relay_effect(from, effect),
            ClientMessage::Connecting { .. } | ClientMessage::Disconnecting { .. } => {
                // Handled during connection setup and in the reader loop.
            }
        }
        true
    }

    fn chat(&mut self, from: ConnectionId, text: String) {
        let name = self
            .peers
            .get(&from)
            .map(|p| p.display_name().to_string())
            .unwrap_or_default();
        self.broadcast(&ServerMessage::Chat { from, name, text });
    }

    fn set_scenario(
        &mut self,
        from: ConnectionId,
        scenario: ScenarioInfo,
        random_map: Option<RandomMapOptions>,
    ) {
        if !self.require_host(from, "SetScenario") || !self.lobby_mutable("SetScenario") {
            return;
        }
        self.state.set_scenario(scenario, random_map);
        // Rebuilding the slot table dropped all assignments; reseat peers in
        // connection order.
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(color) = self.state.first_open_color() {
                let name = self.peers[&id].display_name().to_string();
                self.state.claim_slot(color, id, &name);
            }
        }
        self.sync_state();
    }

    fn set_player_slot(&mut self, from: ConnectionId, color: PlayerColor) {
        if !self.lobby_mutable("SetPlayerSlot") {
            return;
        }
        let name = self
            .peers
            .get(&from)
            .map(|p| p.display_name().to_string())
            .unwrap_or_default();
        if self.state.claim_slot(color, from, &name) {
            self.sync_state();
        } else {
            warn!("{from:?} asked for taken slot {color:?}, ignoring");
        }
    }

    fn set_slot_controller(&mut self, from: ConnectionId, color: PlayerColor, computer: bool) {
        if !self.require_host(from, "SetSlotController") || !self.lobby_mutable("SetSlotController")
        {
            return;
        }
        self.state.set_computer(color, computer);
        self.sync_state();
    }

    fn set_difficulty(&mut self, from: ConnectionId, level: u8) {
        if !self.require_host(from, "SetDifficulty") || !self.lobby_mutable("SetDifficulty") {
            return;
        }
        self.state.difficulty = level.min(MAX_DIFFICULTY);
        self.sync_state();
    }

    fn set_turn_timer(&mut self, from: ConnectionId, seconds: Option<u32>) {
        if !self.require_host(from, "SetTurnTimer") || !self.lobby_mutable("SetTurnTimer") {
            return;
        }
        self.state.turn_timer_seconds = seconds;
        self.sync_state();
    }

    fn transfer_host(&mut self, from: ConnectionId, new_host: ConnectionId) {
        if !self.require_host(from, "TransferHost") {
            return;
        }
        if !self.peers.contains_key(&new_host) {
            warn!("host transfer to unknown peer {new_host:?}, ignoring");
            return;
        }
        self.host_id = Some(new_host);
        self.broadcast(&ServerMessage::HostChanged { new_host });
    }

    fn try_start(&mut self, from: ConnectionId, allow_ai_only: bool) {
        if !self.lobby_mutable("RequestStart") {
            return;
        }
        if let Err(reason) = self.check_start(from, allow_ai_only) {
            info!("start refused for {from:?}: {reason}");
            self.send_to(from, &ServerMessage::StartRefused { reason });
            return;
        }
        self.started = true;
        info!("session starting with {} peer(s)", self.peers.len());
        let state = self.state.clone();
        self.broadcast(&ServerMessage::GameStarted { state });
    }

    fn check_start(&self, from: ConnectionId, allow_ai_only: bool) -> Result<(), StartRefusal> {
        if self.host_id != Some(from) {
            return Err(StartRefusal::NotHost);
        }
        if self.state.scenario.is_none() {
            return Err(StartRefusal::NoScenario);
        }
        if let Some(options) = &self.state.random_map
            && let Err(reason) = options.validate()
        {
            return Err(StartRefusal::InvalidRandomMapOptions(reason));
        }
        if !self.state.has_human_player() && !allow_ai_only {
            return Err(StartRefusal::NoHumanPlayer);
        }
        Ok(())
    }

    /// Re-broadcast an authoritative effect from the hosting peer. A guest
    /// pushing effects is a protocol violation; the caller drops the peer.
    fn relay_effect(&mut self, from: ConnectionId, effect: StateEffect) -> bool {
        if self.host_id != Some(from) {
            warn!("guest {from:?} pushed effect {:?}, dropping peer", effect.kind());
            return false;
        }
        if !self.started {
            warn!("effect {:?} before game start, ignoring", effect.kind());
            return true;
        }
        self.broadcast(&ServerMessage::Effect(effect));
        true
    }

    fn require_host(&self, from: ConnectionId, what: &str) -> bool {
        if self.host_id == Some(from) {
            true
        } else {
            warn!("{what} from non-host {from:?}, ignoring");
            false
        }
    }

    fn lobby_mutable(&self, what: &str) -> bool {
        if self.started {
            warn!("{what} after game start, ignoring");
            false
        } else {
            true
        }
    }

    fn sync_state(&mut self) {
        let state = self.state.clone();
        self.broadcast(&ServerMessage::StateSync { state });
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn host_id(&self) -> Option<ConnectionId> {
        self.host_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Tell every peer the authority is going away.
    pub fn announce_shutdown(&mut self) {
        self.broadcast(&ServerMessage::Shutdown);
    }

    /// Send a message to a specific peer. Write errors are logged; the reader
    /// thread will notice the broken pipe.
    fn send_to(&mut self, id: ConnectionId, msg: &ServerMessage) {
        if let Some(peer) = self.peers.get_mut(&id)
            && let Err(e) = write_message(&mut peer.writer, msg)
        {
            warn!("write to {id:?} failed: {e}");
        }
    }

    fn broadcast(&mut self, msg: &ServerMessage) {
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_to(id, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use emberwake_protocol::framing::read_message;
    use emberwake_protocol::message::MoveMode;
    use emberwake_protocol::state::{MapSize, ScenarioOrigin, SlotController};
    use emberwake_protocol::types::{HeroId, Position, ResourceKind};

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        read_message(reader).unwrap()
    }

    fn join(session: &mut LobbySession, name: &str, stream: TcpStream) -> ConnectionId {
        session
            .add_peer(
                PROTOCOL_VERSION,
                Uuid::new_v4(),
                vec![name.into()],
                SessionMode::NewGame,
                stream,
            )
            .unwrap()
    }

    fn scenario(slots: u8) -> ScenarioInfo {
        ScenarioInfo {
            name: "Emberfall".into(),
            origin: ScenarioOrigin::BuiltInMap,
            player_slots: slots,
        }
    }

    #[test]
    fn first_peer_becomes_host_and_gets_accepted() {
        let (client, server) = tcp_pair();
        let mut session = LobbySession::new(None, 8);

        let id = join(&mut session, "Aila", server);
        assert_eq!(id, ConnectionId(0));
        assert_eq!(session.host_id(), Some(id));

        let mut reader = BufReader::new(client);
        match recv(&mut reader) {
            ServerMessage::Accepted {
                connection_id,
                host_id,
                names,
                ..
            } => {
                assert_eq!(connection_id, ConnectionId(0));
                assert_eq!(host_id, ConnectionId(0));
                assert_eq!(names, vec!["Aila".to_string()]);
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
        assert!(matches!(recv(&mut reader), ServerMessage::StateSync { .. }));
    }

    #[test]
    fn version_mismatch_refused() {
        let (_client, server) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let result = session.add_peer(
            PROTOCOL_VERSION + 1,
            Uuid::new_v4(),
            vec!["Aila".into()],
            SessionMode::NewGame,
            server,
        );
        assert!(result.unwrap_err().contains("protocol version mismatch"));
    }

    #[test]
    fn reserved_session_refuses_other_uuid() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let owner = Uuid::new_v4();
        let mut session = LobbySession::new(Some(owner), 8);

        let stranger = session.add_peer(
            PROTOCOL_VERSION,
            Uuid::new_v4(),
            vec!["Mallory".into()],
            SessionMode::NewGame,
            s1,
        );
        assert!(stranger.is_err());

        let rightful = session.add_peer(
            PROTOCOL_VERSION,
            owner,
            vec!["Aila".into()],
            SessionMode::NewGame,
            s2,
        );
        assert!(rightful.is_ok());
    }

    #[test]
    fn full_session_refused() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 1);
        join(&mut session, "Aila", s1);
        let result = session.add_peer(
            PROTOCOL_VERSION,
            Uuid::new_v4(),
            vec!["Bren".into()],
            SessionMode::NewGame,
            s2,
        );
        assert_eq!(result.unwrap_err(), "session is full");
    }

    #[test]
    fn joining_peer_is_seated_on_open_slot() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", s1);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: scenario(2),
                random_map: None,
            },
        );
        let guest = join(&mut session, "Bren", s2);

        assert_eq!(session.state().colors_of(host), vec![PlayerColor::Red]);
        assert_eq!(session.state().colors_of(guest), vec![PlayerColor::Blue]);
    }

    #[test]
    fn guest_cannot_change_options() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", s1);
        let guest = join(&mut session, "Bren", s2);

        session.handle_message(host, ClientMessage::SetDifficulty { level: 3 });
        assert_eq!(session.state().difficulty, 3);

        session.handle_message(guest, ClientMessage::SetDifficulty { level: 0 });
        assert_eq!(session.state().difficulty, 3);
    }

    #[test]
    fn start_refused_without_human_player() {
        let (client, server) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", server);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: scenario(2),
                random_map: None,
            },
        );
        // Host forces every slot to computer control, ejecting itself.
        session.handle_message(
            host,
            ClientMessage::SetSlotController {
                color: PlayerColor::Red,
                computer: true,
            },
        );
        session.handle_message(
            host,
            ClientMessage::SetSlotController {
                color: PlayerColor::Blue,
                computer: true,
            },
        );
        assert!(!session.state().has_human_player());

        session.handle_message(host, ClientMessage::RequestStart { allow_ai_only: false });
        assert!(!session.is_started());

        let mut reader = BufReader::new(client);
        let refusal = loop {
            match recv(&mut reader) {
                ServerMessage::StartRefused { reason } => break reason,
                _ => continue,
            }
        };
        assert_eq!(refusal, StartRefusal::NoHumanPlayer);

        // With the AI-only override the same request succeeds.
        session.handle_message(host, ClientMessage::RequestStart { allow_ai_only: true });
        assert!(session.is_started());
    }

    #[test]
    fn start_refused_with_invalid_random_map() {
        let (client, server) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", server);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: ScenarioInfo {
                    name: "random".into(),
                    origin: ScenarioOrigin::RandomMap,
                    player_slots: 4,
                },
                random_map: Some(RandomMapOptions {
                    size: MapSize::Small,
                    player_count: 6,
                    islands: false,
                }),
            },
        );
        session.handle_message(host, ClientMessage::RequestStart { allow_ai_only: false });
        assert!(!session.is_started());

        let mut reader = BufReader::new(client);
        let refusal = loop {
            match recv(&mut reader) {
                ServerMessage::StartRefused { reason } => break reason,
                _ => continue,
            }
        };
        assert!(matches!(
            refusal,
            StartRefusal::InvalidRandomMapOptions(_)
        ));
    }

    #[test]
    fn host_transfer_and_departure_promotion() {
        let (_c1, s1) = tcp_pair();
        let (c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", s1);
        let guest = join(&mut session, "Bren", s2);

        session.handle_message(host, ClientMessage::TransferHost { new_host: guest });
        assert_eq!(session.host_id(), Some(guest));

        // Guest (now host) should see a HostChanged broadcast.
        let mut reader = BufReader::new(c2);
        let changed = loop {
            match recv(&mut reader) {
                ServerMessage::HostChanged { new_host } => break new_host,
                _ => continue,
            }
        };
        assert_eq!(changed, guest);

        // New host leaves; the remaining peer is promoted.
        session.remove_peer(guest);
        assert_eq!(session.host_id(), Some(host));
    }

    #[test]
    fn remove_peer_prunes_slots() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", s1);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: scenario(3),
                random_map: None,
            },
        );
        let guest = join(&mut session, "Bren", s2);
        let guest_colors = session.state().colors_of(guest);
        assert_eq!(guest_colors, vec![PlayerColor::Blue]);

        let released = session.remove_peer(guest);
        assert_eq!(released, guest_colors);
        assert_eq!(
            session.state().slots[&PlayerColor::Blue].controller,
            SlotController::Open
        );
    }

    #[test]
    fn guest_pushed_effect_is_violation() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", s1);
        let guest = join(&mut session, "Bren", s2);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: scenario(2),
                random_map: None,
            },
        );
        session.handle_message(host, ClientMessage::RequestStart { allow_ai_only: false });
        assert!(session.is_started());

        let effect = StateEffect::ResourcesChanged {
            player: PlayerColor::Red,
            resource: ResourceKind::Gold,
            amount: 1000,
        };
        assert!(session.handle_message(host, ClientMessage::PushEffect(effect.clone())));
        assert!(!session.handle_message(guest, ClientMessage::PushEffect(effect)));
    }

    #[test]
    fn host_effect_is_echoed_to_host() {
        let (client, server) = tcp_pair();
        let mut session = LobbySession::new(None, 8);
        let host = join(&mut session, "Aila", server);
        session.handle_message(
            host,
            ClientMessage::SetScenario {
                scenario: scenario(2),
                random_map: None,
            },
        );
        session.handle_message(host, ClientMessage::RequestStart { allow_ai_only: false });

        let effect = StateEffect::HeroMoved {
            hero: HeroId(1),
            from: Position::new(0, 0),
            to: Position::new(1, 0),
            mode: MoveMode::Normal,
        };
        session.handle_message(host, ClientMessage::PushEffect(effect.clone()));

        let mut reader = BufReader::new(client);
        let echoed = loop {
            match recv(&mut reader) {
                ServerMessage::Effect(e) => break e,
                _ => continue,
            }
        };
        assert_eq!(echoed, effect);
    }
}
