// Observer registration and fan-out for in-game events.
//
// The presentation layer registers observer handles per color (a player's
// interface) or as privileged (spectators and system-wide reactions, which
// receive every event regardless of color). Handles are shared
// `Arc<Mutex<dyn GameObserver>>` so one observer can appear under several
// registrations; fan-out dedups by handle identity so it is still notified
// exactly once per message.
//
// Fan-out is a single parameterized function: scope (one color, a color
// pair, or global) plus the session relations drive who gets notified.
// Per-color interfaces in an enemy relation to every subject are skipped
// unless the event is global; privileged observers bypass the filter.
// An unobserved color is not an error — nobody to notify.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use emberwake_protocol::message::GarrisonSide;
use emberwake_protocol::state::{PlayerRelation, SessionState};
use emberwake_protocol::types::{PlayerColor, Position, ResourceKind};

use crate::game::{Hero, MapObject};
use crate::lock_or_recover;

/// Events a registered interface can receive. Default bodies are empty so
/// observers implement only what they watch.
pub trait GameObserver: Send {
    fn resources_changed(&mut self, _player: PlayerColor, _resource: ResourceKind, _amount: i64) {}
    fn hero_moved(&mut self, _hero: &Hero, _from: Position, _to: Position) {}
    fn hero_recruited(&mut self, _hero: &Hero) {}
    fn object_removed(&mut self, _object: &MapObject) {}
    fn garrison_swapped(&mut self, _left: GarrisonSide, _right: GarrisonSide) {}
    fn battle_started(&mut self, _attacker: PlayerColor, _defender: PlayerColor, _at: Position) {}
    fn battle_ended(&mut self, _winner: Option<PlayerColor>) {}
    fn dialog_shown(&mut self, _text: &str) {}
    fn turn_advanced(&mut self, _day: u32) {}
    fn player_eliminated(&mut self, _player: PlayerColor, _victorious: bool) {}
}

/// Shared observer handle; identity (the allocation) is what fan-out dedups on.
pub type ObserverHandle = Arc<Mutex<dyn GameObserver>>;

/// Which colors an event concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectScope {
    Single(PlayerColor),
    Dual(PlayerColor, PlayerColor),
    Global,
}

/// Per-color and privileged observer registrations for one running game.
#[derive(Default)]
pub struct ObserverRegistry {
    by_color: BTreeMap<PlayerColor, Vec<ObserverHandle>>,
    privileged: Vec<ObserverHandle>,
}

fn handle_identity(handle: &ObserverHandle) -> *const () {
    Arc::as_ptr(handle).cast()
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, color: PlayerColor, handle: ObserverHandle) {
        self.by_color.entry(color).or_default().push(handle);
    }

    pub fn register_privileged(&mut self, handle: ObserverHandle) {
        self.privileged.push(handle);
    }

    /// Remove a handle from every registration it appears in.
    pub fn unregister(&mut self, handle: &ObserverHandle) {
        let id = handle_identity(handle);
        for handles in self.by_color.values_mut() {
            handles.retain(|h| handle_identity(h) != id);
        }
        self.privileged.retain(|h| handle_identity(h) != id);
        self.by_color.retain(|_, handles| !handles.is_empty());
    }

    /// Drop every interface registered for a color (a departed player).
    pub fn unregister_color(&mut self, color: PlayerColor) {
        self.by_color.remove(&color);
    }

    pub fn observed_colors(&self) -> Vec<PlayerColor> {
        self.by_color.keys().copied().collect()
    }

    /// Notify every interface the scope concerns, exactly once each.
    ///
    /// Candidates are the per-color interfaces whose color is not in an
    /// enemy relation to (one of) the subject color(s) — the subjects
    /// themselves and their allies — plus every privileged observer. A
    /// handle reachable through several registrations is notified once.
    pub fn fan_out(
        &self,
        scope: EffectScope,
        state: &SessionState,
        mut notify: impl FnMut(&mut dyn GameObserver),
    ) {
        let mut notified: Vec<*const ()> = Vec::new();
        let mut deliver = |handle: &ObserverHandle| {
            let id = handle_identity(handle);
            if notified.contains(&id) {
                return;
            }
            notified.push(id);
            notify(&mut *lock_or_recover(handle));
        };

        for (color, handles) in &self.by_color {
            let visible = match scope {
                EffectScope::Global => true,
                EffectScope::Single(subject) => {
                    state.relation(*color, subject) != PlayerRelation::Enemy
                }
                EffectScope::Dual(a, b) => {
                    state.relation(*color, a) != PlayerRelation::Enemy
                        || state.relation(*color, b) != PlayerRelation::Enemy
                }
            };
            if visible {
                for handle in handles {
                    deliver(handle);
                }
            }
        }
        for handle in &self.privileged {
            deliver(handle);
        }
    }

    /// Notify only the interfaces registered for exactly this color (no
    /// allies, no privileged). Returns how many were notified; the caller
    /// logs when a message addressed a color nobody observes.
    pub fn notify_exact(
        &self,
        color: PlayerColor,
        mut notify: impl FnMut(&mut dyn GameObserver),
    ) -> usize {
        let Some(handles) = self.by_color.get(&color) else {
            return 0;
        };
        for handle in handles {
            notify(&mut *lock_or_recover(handle));
        }
        handles.len()
    }
}
