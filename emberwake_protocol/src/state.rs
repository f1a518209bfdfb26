// Shared session state replicated between the authority and every peer.
//
// The authority owns the canonical `SessionState`; clients hold a replica that
// only changes by applying a received `StateSync`/`GameStarted` message. Local
// UI edits are sent to the authority as requests and take effect when the
// echoed sync arrives.
//
// Slot assignment: each scenario color has a `PlayerSlot` whose controller is
// `Open`, `Human(connection)`, or `Computer`. Team membership on the slot
// drives the ally/enemy relation used for dispatch visibility filtering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, PlayerColor, TeamId};

/// Who drives a color slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotController {
    Open,
    Human(ConnectionId),
    Computer,
}

/// One color slot in the lobby.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub controller: SlotController,
    pub display_name: String,
    pub team: TeamId,
}

/// Where the selected scenario comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioOrigin {
    BuiltInMap,
    SavedGame,
    RandomMap,
}

/// Metadata of the selected scenario, enough to seed the slot table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    pub origin: ScenarioOrigin,
    /// Number of playable colors, counted from the front of `PlayerColor::ALL`.
    pub player_slots: u8,
}

/// Map dimensions selectable for random generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapSize {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl MapSize {
    /// Most players a generated map of this size can hold.
    pub fn max_players(self) -> u8 {
        match self {
            MapSize::Small => 4,
            MapSize::Medium => 6,
            MapSize::Large | MapSize::ExtraLarge => 8,
        }
    }
}

/// Options for random-map generation, validated before a game may start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomMapOptions {
    pub size: MapSize,
    pub player_count: u8,
    pub islands: bool,
}

impl RandomMapOptions {
    /// Check the options describe a generatable map.
    pub fn validate(&self) -> Result<(), String> {
        if self.player_count < 2 {
            return Err(format!(
                "random map needs at least 2 players, got {}",
                self.player_count
            ));
        }
        if self.player_count as usize > PlayerColor::ALL.len() {
            return Err(format!(
                "random map supports at most {} players, got {}",
                PlayerColor::ALL.len(),
                self.player_count
            ));
        }
        if self.player_count > self.size.max_players() {
            return Err(format!(
                "{:?} maps hold at most {} players, got {}",
                self.size,
                self.size.max_players(),
                self.player_count
            ));
        }
        Ok(())
    }
}

/// Relation between two colors, derived from slot teams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerRelation {
    Own,
    Ally,
    Enemy,
}

/// The replicated lobby/session snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub scenario: Option<ScenarioInfo>,
    pub difficulty: u8,
    /// `None` means unlimited turn time.
    pub turn_timer_seconds: Option<u32>,
    pub slots: BTreeMap<PlayerColor, PlayerSlot>,
    pub random_map: Option<RandomMapOptions>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            scenario: None,
            difficulty: 1,
            turn_timer_seconds: None,
            slots: BTreeMap::new(),
            random_map: None,
        }
    }
}

impl SessionState {
    /// Replace the scenario and rebuild the slot table for its color count.
    /// Every slot starts `Open` on its own team.
    pub fn set_scenario(&mut self, scenario: ScenarioInfo, random_map: Option<RandomMapOptions>) {
        let count = (scenario.player_slots as usize).min(PlayerColor::ALL.len());
        self.slots = PlayerColor::ALL[..count]
            .iter()
            .enumerate()
            .map(|(i, color)| {
                (
                    *color,
                    PlayerSlot {
                        controller: SlotController::Open,
                        display_name: String::new(),
                        team: TeamId(i as u8),
                    },
                )
            })
            .collect();
        self.scenario = Some(scenario);
        self.random_map = random_map;
    }

    /// Relation between two colors. Unknown colors are enemies.
    pub fn relation(&self, a: PlayerColor, b: PlayerColor) -> PlayerRelation {
        if a == b {
            return PlayerRelation::Own;
        }
        match (self.slots.get(&a), self.slots.get(&b)) {
            (Some(sa), Some(sb)) if sa.team == sb.team => PlayerRelation::Ally,
            _ => PlayerRelation::Enemy,
        }
    }

    /// Colors currently driven by any human.
    pub fn human_colors(&self) -> Vec<PlayerColor> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot.controller, SlotController::Human(_)))
            .map(|(color, _)| *color)
            .collect()
    }

    /// Colors driven by one specific connection.
    pub fn colors_of(&self, connection: ConnectionId) -> Vec<PlayerColor> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.controller == SlotController::Human(connection))
            .map(|(color, _)| *color)
            .collect()
    }

    pub fn has_human_player(&self) -> bool {
        self.slots
            .values()
            .any(|slot| matches!(slot.controller, SlotController::Human(_)))
    }

    /// First slot nobody has claimed yet.
    pub fn first_open_color(&self) -> Option<PlayerColor> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.controller == SlotController::Open)
            .map(|(color, _)| *color)
    }

    /// Assign a color to a connection, releasing any slot that connection
    /// held before. Returns false if the slot is taken by someone else.
    pub fn claim_slot(
        &mut self,
        color: PlayerColor,
        connection: ConnectionId,
        display_name: &str,
    ) -> bool {
        match self.slots.get(&color).map(|s| &s.controller) {
            Some(SlotController::Open) | Some(SlotController::Computer) => {}
            Some(SlotController::Human(holder)) if *holder == connection => return true,
            _ => return false,
        }
        for slot in self.slots.values_mut() {
            if slot.controller == SlotController::Human(connection) {
                slot.controller = SlotController::Open;
                slot.display_name.clear();
            }
        }
        if let Some(slot) = self.slots.get_mut(&color) {
            slot.controller = SlotController::Human(connection);
            slot.display_name = display_name.to_string();
        }
        true
    }

    /// Reopen every slot a departing connection held. Returns the pruned
    /// colors so the caller can log/broadcast them.
    pub fn release_peer(&mut self, connection: ConnectionId) -> Vec<PlayerColor> {
        let mut released = Vec::new();
        for (color, slot) in &mut self.slots {
            if slot.controller == SlotController::Human(connection) {
                slot.controller = SlotController::Open;
                slot.display_name.clear();
                released.push(*color);
            }
        }
        released
    }

    /// Host forces a slot to computer control (ejecting any human holding
    /// it) or reopens a computer slot.
    pub fn set_computer(&mut self, color: PlayerColor, computer: bool) {
        if let Some(slot) = self.slots.get_mut(&color) {
            if computer {
                slot.controller = SlotController::Computer;
                slot.display_name.clear();
            } else if slot.controller == SlotController::Computer {
                slot.controller = SlotController::Open;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(slots: u8) -> ScenarioInfo {
        ScenarioInfo {
            name: "Crossing the Ashes".into(),
            origin: ScenarioOrigin::BuiltInMap,
            player_slots: slots,
        }
    }

    #[test]
    fn set_scenario_builds_open_slots() {
        let mut state = SessionState::default();
        state.set_scenario(scenario(3), None);
        assert_eq!(state.slots.len(), 3);
        assert!(state.slots.values().all(|s| s.controller == SlotController::Open));
        assert!(!state.has_human_player());
    }

    #[test]
    fn claim_slot_releases_previous_color() {
        let mut state = SessionState::default();
        state.set_scenario(scenario(3), None);
        let conn = ConnectionId(1);

        assert!(state.claim_slot(PlayerColor::Red, conn, "Aila"));
        assert!(state.claim_slot(PlayerColor::Blue, conn, "Aila"));

        assert_eq!(state.colors_of(conn), vec![PlayerColor::Blue]);
        assert_eq!(
            state.slots[&PlayerColor::Red].controller,
            SlotController::Open
        );
    }

    #[test]
    fn claim_slot_refuses_taken_color() {
        let mut state = SessionState::default();
        state.set_scenario(scenario(2), None);
        assert!(state.claim_slot(PlayerColor::Red, ConnectionId(1), "Aila"));
        assert!(!state.claim_slot(PlayerColor::Red, ConnectionId(2), "Bren"));
    }

    #[test]
    fn release_peer_prunes_all_colors() {
        let mut state = SessionState::default();
        state.set_scenario(scenario(3), None);
        state.claim_slot(PlayerColor::Red, ConnectionId(1), "Aila");
        state.claim_slot(PlayerColor::Blue, ConnectionId(2), "Bren");

        let released = state.release_peer(ConnectionId(2));
        assert_eq!(released, vec![PlayerColor::Blue]);
        assert_eq!(state.human_colors(), vec![PlayerColor::Red]);
    }

    #[test]
    fn relations_follow_teams() {
        let mut state = SessionState::default();
        state.set_scenario(scenario(3), None);
        state.slots.get_mut(&PlayerColor::Red).unwrap().team = TeamId(0);
        state.slots.get_mut(&PlayerColor::Blue).unwrap().team = TeamId(0);
        state.slots.get_mut(&PlayerColor::Tan).unwrap().team = TeamId(1);

        assert_eq!(
            state.relation(PlayerColor::Red, PlayerColor::Red),
            PlayerRelation::Own
        );
        assert_eq!(
            state.relation(PlayerColor::Red, PlayerColor::Blue),
            PlayerRelation::Ally
        );
        assert_eq!(
            state.relation(PlayerColor::Red, PlayerColor::Tan),
            PlayerRelation::Enemy
        );
    }

    #[test]
    fn random_map_options_validation() {
        let good = RandomMapOptions {
            size: MapSize::Small,
            player_count: 4,
            islands: false,
        };
        assert!(good.validate().is_ok());

        let too_many = RandomMapOptions {
            size: MapSize::Small,
            player_count: 6,
            islands: false,
        };
        assert!(too_many.validate().is_err());

        let solo = RandomMapOptions {
            size: MapSize::Large,
            player_count: 1,
            islands: true,
        };
        assert!(solo.validate().is_err());
    }
}
