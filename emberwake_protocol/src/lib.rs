// emberwake_protocol — wire protocol for Emberwake multiplayer sessions.
//
// This crate defines the message catalog, shared session state, and framing
// used by the authority process (`emberwake_server`) and game clients
// (`emberwake_client`) to communicate over TCP. It is shared between both
// sides and has no dependency on either.
//
// Module overview:
// - `types.rs`:   Core ID types — `ConnectionId`, `PlayerColor`, `HeroId`,
//                 `ObjectId`, plus positions and resources.
// - `state.rs`:   The replicated `SessionState` (scenario, difficulty, turn
//                 timer, color-slot assignments, random-map options) and the
//                 relation/slot queries derived from it.
// - `message.rs`: Peer-to-authority and authority-to-peer message enums,
//                 including the closed `StateEffect` catalog with its
//                 `EffectKind` registry tags.
// - `framing.rs`: Length-delimited framing over any `Read`/`Write` stream:
//                 4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Human-inspectable on the wire; binary framing can
//   be swapped in later if bandwidth matters.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with blocking TCP streams and buffered wrappers.
// - **Closed effect catalog.** A peer built against a different catalog fails
//   to decode, which both sides treat as a fatal protocol mismatch.

pub mod framing;
pub mod message;
pub mod state;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{
    ClientMessage, EffectKind, GarrisonSide, MoveMode, PROTOCOL_VERSION, ServerMessage,
    SessionMode, StartRefusal, StateEffect,
};
pub use state::{
    MapSize, PlayerRelation, PlayerSlot, RandomMapOptions, ScenarioInfo, ScenarioOrigin,
    SessionState, SlotController,
};
pub use types::{ConnectionId, HeroId, ObjectId, PlayerColor, Position, ResourceKind, TeamId};
