// End-to-end integration tests for the session pipeline.
//
// Each test starts a real in-process authority, connects real
// `SessionController` instances (via `TestPeer`), and verifies the full
// path: handshake → lobby replication → start validation → effect dispatch
// with observer fan-out → teardown.
//
// These exercise the same code paths as a live client; the only
// test-specific code is the recording observers and polling wrappers in the
// harness, plus a scripted authority for the failure-path tests.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use emberwake_client::controller::SessionController;
use emberwake_client::dispatch::EffectRegistry;
use emberwake_client::game::GameContext;
use emberwake_client::lobby::LobbyContext;
use emberwake_protocol::framing::{read_message, write_message};
use emberwake_protocol::message::{
    ClientMessage, MoveMode, ServerMessage, SessionMode, StateEffect,
};
use emberwake_protocol::state::{ScenarioInfo, ScenarioOrigin, SlotController};
use emberwake_protocol::types::{ConnectionId, HeroId, PlayerColor, Position, ResourceKind};
use emberwake_server::server::{ServerConfig, ServerHandle, start_server};

use session_tests::{GameLog, LobbyLog, TestPeer, wait_for_game_event};

fn start_authority() -> (ServerHandle, SocketAddr) {
    let config = ServerConfig {
        port: 0,
        expected_client: None,
        max_peers: 8,
    };
    start_server(config).expect("start_server failed")
}

fn scenario(slots: u8) -> ScenarioInfo {
    ScenarioInfo {
        name: "Crossing the Ashes".into(),
        origin: ScenarioOrigin::BuiltInMap,
        player_slots: slots,
    }
}

/// Host and guest in a two-slot lobby, both seated, replicas synced.
fn two_peer_lobby(addr: SocketAddr) -> (TestPeer, TestPeer) {
    let mut host = TestPeer::connect(addr, "Aila");
    host.pump_until_event("connected id=0 host=true");

    let mut guest = TestPeer::connect(addr, "Bren");
    guest.pump_until_event("connected id=1 host=false");
    host.pump_until_event("peer_joined Bren");

    host.controller
        .set_scenario(scenario(2), None)
        .expect("set_scenario");
    host.pump_until("both slots human", |peer| {
        peer.state().human_colors().len() == 2
    });
    guest.pump_until("both slots human", |peer| {
        peer.state().human_colors().len() == 2
    });
    (host, guest)
}

#[test]
fn two_peer_lobby_lifecycle() {
    let (handle, addr) = start_authority();
    let (mut host, mut guest) = two_peer_lobby(addr);

    assert!(host.controller.is_host());
    assert!(guest.controller.is_guest());
    assert_eq!(
        host.controller.my_colors(&host.state()),
        vec![PlayerColor::Red]
    );
    assert_eq!(
        guest.controller.my_colors(&guest.state()),
        vec![PlayerColor::Blue]
    );

    // A host-side option edit replicates to the guest.
    host.controller.set_difficulty(3).expect("set_difficulty");
    guest.pump_until("difficulty sync", |peer| peer.state().difficulty == 3);

    // The edit only took effect through the authority's echo.
    host.pump_until("difficulty sync", |peer| peer.state().difficulty == 3);

    guest.close();
    host.close();
    handle.stop();
}

#[test]
fn chat_and_host_transfer() {
    let (handle, addr) = start_authority();
    let (mut host, mut guest) = two_peer_lobby(addr);

    guest
        .controller
        .send_chat("hello from the guest")
        .expect("chat");
    host.pump_until_event("chat Bren: hello from the guest");
    guest.pump_until_event("chat Bren: hello from the guest");

    // The !passhost chat command becomes a host transfer.
    host.controller.send_chat("!passhost 1").expect("passhost");
    guest.pump_until_event("host_changed true");
    host.pump_until_event("host_changed false");
    assert!(guest.controller.is_host());
    assert!(host.controller.is_guest());

    guest.close();
    host.close();
    handle.stop();
}

#[test]
fn start_refused_without_human_then_allowed_for_ai_only() {
    let (handle, addr) = start_authority();
    let (mut host, mut guest) = two_peer_lobby(addr);

    // Snapshot the replica while it still shows two human slots.
    let stale_state = host.state();

    // Host forces both slots to computer control; nobody pumps, so the
    // local replica stays stale and the precondition check passes —
    // exercising the authority's structured refusal.
    host.controller
        .set_slot_controller(PlayerColor::Red, true)
        .expect("slot to computer");
    host.controller
        .set_slot_controller(PlayerColor::Blue, true)
        .expect("slot to computer");

    host.controller
        .request_start(&stale_state, false)
        .expect("request sent");
    host.pump_until_event("start_refused no human player");

    // The same request with the AI-only override starts the game.
    host.controller
        .request_start(&stale_state, true)
        .expect("request sent");
    host.pump_until_event("game_started");
    guest.pump_until_event("game_started");

    guest.close();
    host.close();
    handle.stop();
}

#[test]
fn effects_fan_out_with_visibility_and_privilege() {
    let (handle, addr) = start_authority();
    let (mut host, mut guest) = two_peer_lobby(addr);

    host.controller
        .request_start(&host.state(), false)
        .expect("start");
    host.pump_until_event("game_started");
    guest.pump_until_event("game_started");

    // Host observes Red; guest observes Blue plus a privileged spectator.
    let host_log = GameLog::default();
    let mut host_game = GameContext::new(host.state());
    host_game
        .observers
        .register(PlayerColor::Red, host_log.handle());
    host.controller.begin_game(host_game);

    let guest_log = GameLog::default();
    let spectator_log = GameLog::default();
    let mut guest_game = GameContext::new(guest.state());
    guest_game
        .observers
        .register(PlayerColor::Blue, guest_log.handle());
    guest_game
        .observers
        .register_privileged(spectator_log.handle());
    guest.controller.begin_game(guest_game);

    // The hosting peer's simulation produces effects; the authority echoes
    // them to everyone.
    host.controller
        .push_effect(StateEffect::HeroRecruited {
            hero: HeroId(1),
            owner: PlayerColor::Red,
            position: Position::new(3, 3),
        })
        .expect("push");
    host.controller
        .push_effect(StateEffect::ResourcesChanged {
            player: PlayerColor::Red,
            resource: ResourceKind::Gold,
            amount: -2500,
        })
        .expect("push");

    // Host's own interface sees its hero; the guest's spectator sees it via
    // privilege; the guest's Blue interface is an enemy of Red and is
    // filtered out.
    wait_for_game_event(&host_log, "hero_recruited HeroId(1) for Red");
    wait_for_game_event(&spectator_log, "resources Red Gold -2500");
    assert!(!guest_log.contains("hero_recruited"));
    assert!(!guest_log.contains("resources"));

    // A stale reference is logged and skipped; the stream keeps flowing.
    host.controller
        .push_effect(StateEffect::HeroMoved {
            hero: HeroId(99),
            from: Position::new(0, 0),
            to: Position::new(1, 0),
            mode: MoveMode::Normal,
        })
        .expect("push");
    host.controller
        .push_effect(StateEffect::TurnAdvanced { day: 2 })
        .expect("push");

    wait_for_game_event(&host_log, "turn 2");
    wait_for_game_event(&guest_log, "turn 2");
    wait_for_game_event(&spectator_log, "turn 2");
    assert!(!host_log.contains("hero_moved"));
    assert!(!guest_log.contains("hero_moved"));

    // Replicas applied the effects they were shown.
    let day = host.controller.with_game(|ctx| ctx.state.day);
    assert_eq!(day, Some(2));
    let gold = host
        .controller
        .with_game(|ctx| ctx.state.resource(PlayerColor::Red, ResourceKind::Gold));
    assert_eq!(gold, Some(-2500));

    guest.close();
    host.close();
    handle.stop();
}

#[test]
fn guest_disconnect_prunes_colors_and_silences_them() {
    let (handle, addr) = start_authority();
    let (mut host, mut guest) = two_peer_lobby(addr);

    host.controller
        .request_start(&host.state(), false)
        .expect("start");
    host.pump_until_event("game_started");
    guest.pump_until_event("game_started");

    let host_log = GameLog::default();
    let mut host_game = GameContext::new(host.state());
    host_game
        .observers
        .register(PlayerColor::Red, host_log.handle());
    host.controller.begin_game(host_game);
    guest.controller.begin_game(GameContext::new(guest.state()));

    // Guest leaves mid-session.
    guest.close();
    host.pump_until_event("peer_disconnected Bren");

    // The authority pruned the guest's slot.
    host.pump_until("slot pruned", |peer| {
        peer.state().slots[&PlayerColor::Blue].controller == SlotController::Open
    });

    // Effects addressed to the departed color notify nobody — and are not
    // errors: the stream continues.
    host.controller
        .push_effect(StateEffect::DialogShown {
            player: PlayerColor::Blue,
            text: "anyone there?".into(),
        })
        .expect("push");
    host.controller
        .push_effect(StateEffect::TurnAdvanced { day: 5 })
        .expect("push");

    wait_for_game_event(&host_log, "turn 5");
    assert!(!host_log.contains("dialog"));

    host.close();
    handle.stop();
}

// --- failure paths against a scripted authority ---------------------------

/// Minimal authority: accept one peer, complete the handshake, then hand the
/// stream to the script.
fn scripted_authority(
    script: impl FnOnce(TcpStream) + Send + 'static,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let hello: ClientMessage = read_message(&mut reader).unwrap();
        let ClientMessage::Connecting { client_uuid, .. } = hello else {
            panic!("expected Connecting, got {hello:?}");
        };
        let mut writer = BufWriter::new(stream.try_clone().unwrap());
        write_message(
            &mut writer,
            &ServerMessage::Accepted {
                connection_id: ConnectionId(0),
                client_uuid,
                host_id: ConnectionId(0),
                names: vec!["Aila".into()],
            },
        )
        .unwrap();
        script(stream);
    });
    (addr, thread)
}

#[test]
fn dropped_connection_surfaces_as_connection_lost() {
    let (addr, authority) = scripted_authority(|stream| {
        // Close the connection right after the handshake.
        drop(stream);
    });

    let mut peer = TestPeer::connect(addr, "Aila");
    peer.pump_until_event("connection_lost");

    authority.join().unwrap();
    peer.close();
}

#[test]
fn effect_with_no_handler_tears_down_the_connection() {
    let (addr, authority) = scripted_authority(|stream| {
        // Wait for the client's ready signal (a chat line) so the effect
        // arrives only after its game context is installed.
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let ready: ClientMessage = read_message(&mut reader).unwrap();
        assert!(matches!(ready, ClientMessage::Chat { .. }));

        let mut writer = BufWriter::new(stream);
        write_message(
            &mut writer,
            &ServerMessage::Effect(StateEffect::TurnAdvanced { day: 1 }),
        )
        .unwrap();
        // Hold the stream until the client gives up on us.
        while read_message::<_, ClientMessage>(&mut reader).is_ok() {}
    });

    let log = LobbyLog::default();
    let mut ctx = LobbyContext::new(Box::new(log.clone()));
    let mut controller = SessionController::new(vec!["Aila".into()]);
    // An empty registry: every received effect is an unknown kind, the
    // protocol-mismatch condition.
    *controller.registry_mut().unwrap() = EffectRegistry::new();
    controller
        .open_remote(&addr.to_string(), SessionMode::NewGame)
        .expect("connect");
    controller.begin_game(GameContext::new(Default::default()));
    controller.send_chat("ready").expect("signal readiness");

    let start = std::time::Instant::now();
    loop {
        controller.process_inbound(&mut ctx);
        if log.contains("connection_lost") {
            break;
        }
        assert!(
            start.elapsed() < session_tests::POLL_TIMEOUT,
            "timed out waiting for teardown; log: {:?}",
            log.events()
        );
        thread::sleep(session_tests::POLL_INTERVAL);
    }

    controller.close(&mut ctx);
    authority.join().unwrap();
}
