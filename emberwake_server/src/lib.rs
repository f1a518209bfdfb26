// emberwake_server — authoritative session server for Emberwake.
//
// The authority is the single owner of the canonical session state: it admits
// peers, applies lobby mutations, validates start-game requests, and relays
// the hosting peer's in-game state effects to every client. Clients hold
// replicas that change only by applying messages from here.
//
// Module overview:
// - `session.rs`: Session semantics — peer roster, slot assignment, host
//                 tracking and transfer, start validation, effect relay.
//                 The core data structure that `server.rs` drives.
// - `server.rs`:  TCP listener, reader threads (one per peer), and the main
//                 event loop. Uses `std::net` with a thread-per-reader
//                 architecture and an `mpsc` channel to funnel events into
//                 the single-threaded `LobbySession`.
//
// Dependencies: `emberwake_protocol` (shared message types and framing).
// No dependency on game-rule simulation — the authority replicates effects,
// it never computes them.
//
// The authority can run as a standalone binary (`main.rs`) or be embedded in
// a test process via the library API (`start_server`).

pub mod server;
pub mod session;

pub use server::{ServerConfig, ServerHandle, start_server};
pub use session::LobbySession;
