// Core ID types for the session protocol.
//
// These are lightweight newtypes shared by `message.rs` (wire messages),
// `state.rs` (session state), and both ends of the connection. Connection IDs
// are authority-scoped: the authority assigns compact integers on accept, and
// they are not stable across reconnects. Entity IDs (`HeroId`, `ObjectId`)
// identify replicated map entities in state-effect messages.

use serde::{Deserialize, Serialize};

/// Authority-assigned connection ID (compact u32, not the client UUID).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

/// One of the playable colors on a scenario map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlayerColor {
    Red,
    Blue,
    Tan,
    Green,
    Orange,
    Purple,
    Teal,
    Pink,
}

impl PlayerColor {
    pub const ALL: [PlayerColor; 8] = [
        PlayerColor::Red,
        PlayerColor::Blue,
        PlayerColor::Tan,
        PlayerColor::Green,
        PlayerColor::Orange,
        PlayerColor::Purple,
        PlayerColor::Teal,
        PlayerColor::Pink,
    ];
}

/// Team membership used to derive ally/enemy relations between colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamId(pub u8);

/// Identifier of a hero on the shared map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeroId(pub u32);

/// Identifier of a non-hero map object (mine, garrison, pickup, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// A map tile position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Tradeable resource kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Gold,
    Wood,
    Ore,
    Crystal,
}
