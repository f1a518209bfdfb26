// Error taxonomy for the client-side session core.
//
// Connection-establishment failures never surface here — the channel retries
// those forever. What does surface is fatal: spawn failures, handshake
// refusals, protocol mismatches, and transport errors on an established
// connection.

use thiserror::Error;

use emberwake_protocol::message::StartRefusal;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The local authority process could not be started. Fatal, not retried.
    #[error("failed to spawn local authority: {0}")]
    Spawn(#[source] std::io::Error),

    /// The local authority exited or closed stdout before signalling
    /// readiness.
    #[error("local authority exited before signalling readiness")]
    AuthorityNotReady,

    /// I/O failure on an established connection.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// Connection establishment was cancelled by teardown.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The authority refused the handshake.
    #[error("handshake refused: {0}")]
    Refused(String),

    /// The peers do not speak the same protocol.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A start request failed its local precondition check; nothing was sent.
    #[error("start request refused locally: {0}")]
    StartPrecondition(StartRefusal),

    /// Operation requires an open session.
    #[error("no active session")]
    NotConnected,

    /// `open_*` was called while a session is still open.
    #[error("a session is already open")]
    AlreadyOpen,
}
