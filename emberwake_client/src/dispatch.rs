// Effect dispatch: tag → handler registry and the two-phase apply sequence.
//
// Effects cross the wire as one serde enum; what varies per kind is the
// behavior around the generic state mutation. Each kind registers an
// `EffectApplier` whose hooks run in a fixed order:
//
//   1. `pre_apply`  — before the replica mutates; observers that need the
//                     old state once more (an object about to disappear, a
//                     hero about to teleport) are served here.
//   2. `GameState::apply` — the generic authoritative mutation.
//   3. `post_apply` — observer fan-out against the new state.
//
// The registry is populated once at client construction, before any message
// can be received. Looking up an unregistered kind is a fatal protocol
// mismatch: logged, surfaced as an error, connection torn down by the
// caller. A stale entity reference inside a hook is NOT fatal — the hook
// logs and returns without side effects, and the stream continues.

use std::collections::HashMap;

use log::{error, warn};
use thiserror::Error;

use emberwake_protocol::message::{EffectKind, MoveMode, StateEffect};

use crate::game::GameContext;
use crate::observers::EffectScope;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for message kind {0:?} (protocol mismatch)")]
    Unregistered(EffectKind),
}

/// Per-kind behavior around the generic state mutation.
pub trait EffectApplier: Send + Sync {
    /// Runs before the replica mutates. Optional.
    fn pre_apply(&self, _ctx: &mut GameContext, _effect: &StateEffect) {}

    /// Runs after the replica reflects the change; observer fan-out happens
    /// here.
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect);
}

/// Runtime tag-to-handler lookup for received effects.
pub struct EffectRegistry {
    handlers: HashMap<EffectKind, Box<dyn EffectApplier>>,
}

impl EffectRegistry {
    /// An empty registry. Dispatching anything through it is a protocol
    /// mismatch; use `with_defaults` for a working client.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard catalog registration, run once at client start.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EffectKind::ResourcesChanged, Box::new(ResourcesApplier));
        registry.register(EffectKind::HeroMoved, Box::new(HeroMovedApplier));
        registry.register(EffectKind::HeroRecruited, Box::new(HeroRecruitedApplier));
        registry.register(EffectKind::ObjectRemoved, Box::new(ObjectRemovedApplier));
        registry.register(EffectKind::GarrisonSwapped, Box::new(GarrisonSwappedApplier));
        registry.register(EffectKind::BattleStarted, Box::new(BattleStartedApplier));
        registry.register(EffectKind::BattleEnded, Box::new(BattleEndedApplier));
        registry.register(EffectKind::DialogShown, Box::new(DialogApplier));
        registry.register(EffectKind::TurnAdvanced, Box::new(TurnAdvancedApplier));
        registry.register(EffectKind::PlayerEliminated, Box::new(PlayerEliminatedApplier));
        registry
    }

    /// Install (or replace) the handler for one kind.
    pub fn register(&mut self, kind: EffectKind, handler: Box<dyn EffectApplier>) {
        self.handlers.insert(kind, handler);
    }

    pub fn is_registered(&self, kind: EffectKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run one effect through its hooks. Consumes the effect; it is dropped
    /// once the hooks finish.
    pub fn dispatch(&self, ctx: &mut GameContext, effect: StateEffect) -> Result<(), DispatchError> {
        let kind = effect.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            error!("received effect {kind:?} with no registered handler; protocol mismatch");
            return Err(DispatchError::Unregistered(kind));
        };
        handler.pre_apply(ctx, &effect);
        ctx.state.apply(&effect);
        handler.post_apply(ctx, &effect);
        Ok(())
    }
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// --- default appliers -----------------------------------------------------

struct ResourcesApplier;

impl EffectApplier for ResourcesApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::ResourcesChanged {
            player,
            resource,
            amount,
        } = effect
        else {
            return;
        };
        ctx.observers
            .fan_out(EffectScope::Single(*player), &ctx.state.session, |obs| {
                obs.resources_changed(*player, *resource, *amount);
            });
    }
}

struct HeroMovedApplier;

impl EffectApplier for HeroMovedApplier {
    fn pre_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::HeroMoved { hero, mode, .. } = effect else {
            return;
        };
        let Some(hero) = ctx.state.heroes.get_mut(hero) else {
            error!("cannot find hero {hero:?} for move");
            return;
        };
        // Teleport-like transitions hide the hero while the position is
        // still the old one.
        if matches!(mode, MoveMode::Teleport | MoveMode::Embark | MoveMode::Disembark) {
            hero.visible = false;
        }
    }

    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::HeroMoved { hero, from, to, .. } = effect else {
            return;
        };
        let snapshot = match ctx.state.heroes.get_mut(hero) {
            Some(hero) => {
                hero.visible = true;
                hero.clone()
            }
            None => {
                error!("cannot find hero {hero:?} after move");
                return;
            }
        };
        ctx.observers.fan_out(
            EffectScope::Single(snapshot.owner),
            &ctx.state.session,
            |obs| obs.hero_moved(&snapshot, *from, *to),
        );
    }
}

struct HeroRecruitedApplier;

impl EffectApplier for HeroRecruitedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::HeroRecruited { hero, .. } = effect else {
            return;
        };
        let Some(snapshot) = ctx.state.heroes.get(hero).cloned() else {
            error!("hero {hero:?} missing right after recruitment");
            return;
        };
        ctx.observers.fan_out(
            EffectScope::Single(snapshot.owner),
            &ctx.state.session,
            |obs| obs.hero_recruited(&snapshot),
        );
    }
}

struct ObjectRemovedApplier;

impl EffectApplier for ObjectRemovedApplier {
    /// Observers see the object once more while it still exists, then it is
    /// hidden ahead of the removal.
    fn pre_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::ObjectRemoved { object } = effect else {
            return;
        };
        let snapshot = match ctx.state.objects.get_mut(object) {
            Some(obj) => {
                let snapshot = obj.clone();
                obj.visible = false;
                snapshot
            }
            None => {
                error!("cannot find object {object:?} for removal");
                return;
            }
        };
        let scope = match snapshot.owner {
            Some(owner) => EffectScope::Single(owner),
            None => EffectScope::Global,
        };
        ctx.observers.fan_out(scope, &ctx.state.session, |obs| {
            obs.object_removed(&snapshot);
        });
    }

    fn post_apply(&self, _ctx: &mut GameContext, _effect: &StateEffect) {
        // Notification happened pre-removal; nothing remains to report.
    }
}

struct GarrisonSwappedApplier;

impl EffectApplier for GarrisonSwappedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::GarrisonSwapped { left, right } = effect else {
            return;
        };
        if !ctx.state.objects.contains_key(&left.object)
            || !ctx.state.objects.contains_key(&right.object)
        {
            error!(
                "garrison swap references unknown object ({:?}, {:?})",
                left.object, right.object
            );
            return;
        }
        let scope = if left.owner == right.owner {
            EffectScope::Single(left.owner)
        } else {
            EffectScope::Dual(left.owner, right.owner)
        };
        ctx.observers.fan_out(scope, &ctx.state.session, |obs| {
            obs.garrison_swapped(*left, *right);
        });
    }
}

struct BattleStartedApplier;

impl EffectApplier for BattleStartedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::BattleStarted {
            attacker,
            defender,
            position,
        } = effect
        else {
            return;
        };
        ctx.observers.fan_out(
            EffectScope::Dual(*attacker, *defender),
            &ctx.state.session,
            |obs| obs.battle_started(*attacker, *defender, *position),
        );
    }
}

struct BattleEndedApplier;

impl EffectApplier for BattleEndedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::BattleEnded {
            attacker,
            defender,
            winner,
        } = effect
        else {
            return;
        };
        ctx.observers.fan_out(
            EffectScope::Dual(*attacker, *defender),
            &ctx.state.session,
            |obs| obs.battle_ended(*winner),
        );
    }
}

struct DialogApplier;

impl EffectApplier for DialogApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::DialogShown { player, text } = effect else {
            return;
        };
        // Dialogs are strictly for the addressed player; allies and
        // spectators never see them.
        let notified = ctx
            .observers
            .notify_exact(*player, |obs| obs.dialog_shown(text));
        if notified == 0 {
            warn!("received dialog for unobserved player {player:?}");
        }
    }
}

struct TurnAdvancedApplier;

impl EffectApplier for TurnAdvancedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::TurnAdvanced { day } = effect else {
            return;
        };
        ctx.observers
            .fan_out(EffectScope::Global, &ctx.state.session, |obs| {
                obs.turn_advanced(*day);
            });
    }
}

struct PlayerEliminatedApplier;

impl EffectApplier for PlayerEliminatedApplier {
    fn post_apply(&self, ctx: &mut GameContext, effect: &StateEffect) {
        let StateEffect::PlayerEliminated {
            player,
            victorious,
        } = effect
        else {
            return;
        };
        ctx.observers
            .fan_out(EffectScope::Global, &ctx.state.session, |obs| {
                obs.player_eliminated(*player, *victorious);
            });
    }
}
