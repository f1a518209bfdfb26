// In-game replica state and the context state effects are applied against.
//
// `GameState` is the client's replica of the authoritative simulation as far
// as this core tracks it: heroes, map objects, per-player resources, the day
// counter, and the battle in progress. It is mutated only by
// `GameState::apply`, the generic step between an effect's pre- and
// post-mutation hooks. Relations come from the session state frozen at game
// start.
//
// Stale references are tolerated here: applying an effect whose entity is
// unknown mutates nothing. The dispatch hooks are responsible for logging
// the dangling reference and skipping observer updates.

use std::collections::{BTreeMap, HashMap};

use emberwake_protocol::message::StateEffect;
use emberwake_protocol::state::{PlayerRelation, SessionState};
use emberwake_protocol::types::{HeroId, ObjectId, PlayerColor, Position, ResourceKind};

use crate::observers::ObserverRegistry;

/// A hero on the shared map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hero {
    pub id: HeroId,
    pub owner: PlayerColor,
    pub position: Position,
    /// Cleared by pre-mutation hooks while an entity is mid-transition
    /// (teleporting, embarking) or about to disappear.
    pub visible: bool,
}

/// A non-hero map object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapObject {
    pub id: ObjectId,
    pub owner: Option<PlayerColor>,
    pub position: Position,
    pub visible: bool,
}

/// The client-side replica of shared simulation state.
pub struct GameState {
    /// Session state frozen at game start; source of relations and slots.
    pub session: SessionState,
    pub heroes: HashMap<HeroId, Hero>,
    pub objects: HashMap<ObjectId, MapObject>,
    pub resources: BTreeMap<PlayerColor, BTreeMap<ResourceKind, i64>>,
    pub day: u32,
    pub battle: Option<(PlayerColor, PlayerColor)>,
    pub eliminated: Vec<PlayerColor>,
}

impl GameState {
    pub fn new(session: SessionState) -> Self {
        Self {
            session,
            heroes: HashMap::new(),
            objects: HashMap::new(),
            resources: BTreeMap::new(),
            day: 1,
            battle: None,
            eliminated: Vec::new(),
        }
    }

    pub fn relation(&self, a: PlayerColor, b: PlayerColor) -> PlayerRelation {
        self.session.relation(a, b)
    }

    pub fn resource(&self, player: PlayerColor, resource: ResourceKind) -> i64 {
        self.resources
            .get(&player)
            .and_then(|r| r.get(&resource))
            .copied()
            .unwrap_or(0)
    }

    /// The generic authoritative mutation, applied between the pre- and
    /// post-mutation hooks. Unknown entity references mutate nothing.
    pub fn apply(&mut self, effect: &StateEffect) {
        match effect {
            StateEffect::ResourcesChanged {
                player,
                resource,
                amount,
            } => {
                *self
                    .resources
                    .entry(*player)
                    .or_default()
                    .entry(*resource)
                    .or_insert(0) += amount;
            }
            StateEffect::HeroMoved { hero, to, .. } => {
                if let Some(hero) = self.heroes.get_mut(hero) {
                    hero.position = *to;
                }
            }
            StateEffect::HeroRecruited {
                hero,
                owner,
                position,
            } => {
                self.heroes.insert(
                    *hero,
                    Hero {
                        id: *hero,
                        owner: *owner,
                        position: *position,
                        visible: true,
                    },
                );
            }
            StateEffect::ObjectRemoved { object } => {
                self.objects.remove(object);
            }
            StateEffect::GarrisonSwapped { left, right } => {
                // Control of the two garrisons trades sides.
                if let Some(obj) = self.objects.get_mut(&left.object) {
                    obj.owner = Some(right.owner);
                }
                if let Some(obj) = self.objects.get_mut(&right.object) {
                    obj.owner = Some(left.owner);
                }
            }
            StateEffect::BattleStarted {
                attacker, defender, ..
            } => {
                self.battle = Some((*attacker, *defender));
            }
            StateEffect::BattleEnded { .. } => {
                self.battle = None;
            }
            StateEffect::DialogShown { .. } => {}
            StateEffect::TurnAdvanced { day } => {
                self.day = *day;
            }
            StateEffect::PlayerEliminated { player, .. } => {
                if !self.eliminated.contains(player) {
                    self.eliminated.push(*player);
                }
            }
        }
    }
}

/// Everything the dispatch layer needs to apply one effect: the replica and
/// the registered observers.
pub struct GameContext {
    pub state: GameState,
    pub observers: ObserverRegistry,
}

impl GameContext {
    pub fn new(session: SessionState) -> Self {
        Self {
            state: GameState::new(session),
            observers: ObserverRegistry::new(),
        }
    }
}
