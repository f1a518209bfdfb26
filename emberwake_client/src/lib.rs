// emberwake_client — client-side session controller and dispatch core.
//
// This crate is the peer side of Emberwake multiplayer: it obtains a live
// connection to the authority (spawning one locally when hosting), keeps the
// lobby replica in sync by applying received messages, and fans in-game
// state effects out to the presentation layer's observers.
//
// Module overview:
// - `controller.rs`: `SessionController` — identity, connection lifecycle,
//                    request senders, the network thread, and teardown.
// - `channel.rs`:    Transport channel with infinite fixed-backoff retry and
//                    cancellable waits.
// - `launcher.rs`:   Local authority process spawn + readiness wait + exit
//                    watcher.
// - `queue.rs`:      Pausable FIFO between the network thread and the
//                    consumer thread.
// - `lobby.rs`:      Two-phase application of session-control messages
//                    (immediate hook on the network thread, lobby hook on
//                    the consumer thread) and the `LobbyObserver` contract.
// - `dispatch.rs`:   `EffectRegistry` — tag → handler lookup and the
//                    pre-apply / generic-apply / post-apply sequence.
// - `game.rs`:       The in-game replica (`GameState`) and `GameContext`.
// - `observers.rs`:  Per-color + privileged observer registry with deduped,
//                    visibility-filtered fan-out.
// - `error.rs`:      `SessionError`, the crate's failure taxonomy.
//
// Threading: one network thread per live connection (blocking reads,
// immediate hooks, effect dispatch) and one consumer thread (queue drain,
// lobby hooks) — the embedder's UI/game loop. The inbound queue's mutex is
// the only synchronization point between the two for session-control
// traffic; the game context has its own lock shared by dispatch and the
// embedder's accessors.

use std::sync::{Mutex, MutexGuard};

pub mod channel;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod launcher;
pub mod lobby;
pub mod observers;
pub mod queue;

pub use channel::{CancelToken, ServerChannel};
pub use controller::SessionController;
pub use dispatch::{DispatchError, EffectApplier, EffectRegistry};
pub use error::SessionError;
pub use game::{GameContext, GameState, Hero, MapObject};
pub use lobby::{Identity, LobbyContext, LobbyObserver};
pub use observers::{EffectScope, GameObserver, ObserverHandle, ObserverRegistry};
pub use queue::{Inbound, InboundQueue};

/// Lock a mutex, recovering the guard if a holder panicked. The protected
/// structures stay coherent under every partial update we perform.
pub(crate) fn lock_or_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
