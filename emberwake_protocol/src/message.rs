// Wire messages for client-authority communication.
//
// Two enums define the protocol vocabulary:
// - `ClientMessage`: sent by a peer to the authority (handshake, lobby
//   requests, effect submission from the hosting peer's simulation).
// - `ServerMessage`: sent by the authority to peers. Its variants fall into
//   the two catalog families: session-control (lobby lifecycle) and the
//   single `Effect` variant carrying every in-game state mutation.
//
// `StateEffect` is the closed in-game catalog. Each effect exposes a `kind()`
// tag that the client's dispatch registry uses to recover the right handler
// for a message whose concrete variant is only known to the sender. Which
// colors an effect concerns (its fan-out scope) is decided by the handlers,
// partly from wire fields, partly from the receiver's replica.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{RandomMapOptions, ScenarioInfo, SessionState};
use crate::types::{ConnectionId, HeroId, ObjectId, PlayerColor, Position, ResourceKind};

/// Version both ends must agree on; bumped on any catalog change.
pub const PROTOCOL_VERSION: u32 = 1;

/// What kind of session the connecting peer expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    NewGame,
    LoadGame,
}

/// Messages sent by a peer to the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join handshake. `client_uuid` identifies the peer process; when the
    /// authority was spawned by a client it refuses a first peer whose UUID
    /// does not match the one it was started with.
    Connecting {
        protocol_version: u32,
        client_uuid: Uuid,
        player_names: Vec<String>,
        mode: SessionMode,
    },
    /// Graceful leave. `shutdown_server` is set by the peer that spawned the
    /// authority locally, telling it to exit with the session.
    Disconnecting { shutdown_server: bool },
    Chat { text: String },
    /// Host selects the scenario (and random-map options when generating).
    SetScenario {
        scenario: ScenarioInfo,
        random_map: Option<RandomMapOptions>,
    },
    /// Claim (or move to) a color slot.
    SetPlayerSlot { color: PlayerColor },
    /// Host toggles a slot computer-controlled / open.
    SetSlotController { color: PlayerColor, computer: bool },
    SetDifficulty { level: u8 },
    SetTurnTimer { seconds: Option<u32> },
    /// Host hands authority to another connection.
    TransferHost { new_host: ConnectionId },
    RequestStart { allow_ai_only: bool },
    /// Hosting peer's simulation pushes an authoritative effect to replicate.
    PushEffect(StateEffect),
}

/// Structured reasons a start-game request can be refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartRefusal {
    NotHost,
    NoScenario,
    NoHumanPlayer,
    InvalidRandomMapOptions(String),
}

impl std::fmt::Display for StartRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartRefusal::NotHost => write!(f, "only the host may start the game"),
            StartRefusal::NoScenario => write!(f, "no scenario selected"),
            StartRefusal::NoHumanPlayer => write!(f, "no human player"),
            StartRefusal::InvalidRandomMapOptions(reason) => {
                write!(f, "invalid random map options: {reason}")
            }
        }
    }
}

/// Messages sent by the authority to peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// A peer was accepted. Broadcast to everyone; the peer whose UUID
    /// matches binds `connection_id` immediately on its network thread.
    Accepted {
        connection_id: ConnectionId,
        client_uuid: Uuid,
        host_id: ConnectionId,
        names: Vec<String>,
    },
    /// Handshake rejected; the connection is closed afterwards.
    Refused { reason: String },
    Chat {
        from: ConnectionId,
        name: String,
        text: String,
    },
    /// Full session state replica after any accepted lobby mutation.
    StateSync { state: SessionState },
    HostChanged { new_host: ConnectionId },
    PeerDisconnected {
        connection_id: ConnectionId,
        name: String,
    },
    /// Sent only to the requester of a refused start.
    StartRefused { reason: StartRefusal },
    /// Lobby freezes and gameplay begins with this state.
    GameStarted { state: SessionState },
    /// Authority is exiting.
    Shutdown,
    /// In-game authoritative state mutation.
    Effect(StateEffect),
}

/// How a hero moved; teleport-like modes hide the hero before the move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveMode {
    Normal,
    Teleport,
    Embark,
    Disembark,
}

/// One side of a garrison swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarrisonSide {
    pub owner: PlayerColor,
    pub object: ObjectId,
}

/// The closed catalog of in-game state mutations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateEffect {
    ResourcesChanged {
        player: PlayerColor,
        resource: ResourceKind,
        amount: i64,
    },
    HeroMoved {
        hero: HeroId,
        from: Position,
        to: Position,
        mode: MoveMode,
    },
    HeroRecruited {
        hero: HeroId,
        owner: PlayerColor,
        position: Position,
    },
    ObjectRemoved { object: ObjectId },
    GarrisonSwapped { left: GarrisonSide, right: GarrisonSide },
    BattleStarted {
        attacker: PlayerColor,
        defender: PlayerColor,
        position: Position,
    },
    BattleEnded {
        attacker: PlayerColor,
        defender: PlayerColor,
        winner: Option<PlayerColor>,
    },
    DialogShown { player: PlayerColor, text: String },
    TurnAdvanced { day: u32 },
    PlayerEliminated {
        player: PlayerColor,
        victorious: bool,
    },
}

/// Registry tag for a `StateEffect`, one per variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EffectKind {
    ResourcesChanged,
    HeroMoved,
    HeroRecruited,
    ObjectRemoved,
    GarrisonSwapped,
    BattleStarted,
    BattleEnded,
    DialogShown,
    TurnAdvanced,
    PlayerEliminated,
}

impl EffectKind {
    pub const ALL: [EffectKind; 10] = [
        EffectKind::ResourcesChanged,
        EffectKind::HeroMoved,
        EffectKind::HeroRecruited,
        EffectKind::ObjectRemoved,
        EffectKind::GarrisonSwapped,
        EffectKind::BattleStarted,
        EffectKind::BattleEnded,
        EffectKind::DialogShown,
        EffectKind::TurnAdvanced,
        EffectKind::PlayerEliminated,
    ];
}

impl StateEffect {
    pub fn kind(&self) -> EffectKind {
        match self {
            StateEffect::ResourcesChanged { .. } => EffectKind::ResourcesChanged,
            StateEffect::HeroMoved { .. } => EffectKind::HeroMoved,
            StateEffect::HeroRecruited { .. } => EffectKind::HeroRecruited,
            StateEffect::ObjectRemoved { .. } => EffectKind::ObjectRemoved,
            StateEffect::GarrisonSwapped { .. } => EffectKind::GarrisonSwapped,
            StateEffect::BattleStarted { .. } => EffectKind::BattleStarted,
            StateEffect::BattleEnded { .. } => EffectKind::BattleEnded,
            StateEffect::DialogShown { .. } => EffectKind::DialogShown,
            StateEffect::TurnAdvanced { .. } => EffectKind::TurnAdvanced,
            StateEffect::PlayerEliminated { .. } => EffectKind::PlayerEliminated,
        }
    }
}
