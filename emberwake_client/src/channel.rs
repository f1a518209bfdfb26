// Transport channel to the authority.
//
// One TCP stream, split the way the rest of the workspace splits streams:
// the write half lives behind a mutex inside `ServerChannel` (any thread may
// send), the read half is handed to the network thread as a `MessageReader`
// that blocks on `recv()`.
//
// Connection establishment retries forever with a fixed 2-second backoff.
// The wait is a condvar timeout on a `CancelToken`, so teardown interrupts
// a pending retry immediately instead of sleeping it out.
//
// Closing the channel shuts the socket down; the blocked `recv()` then fails
// and the network loop interprets that as graceful or lost depending on
// whether teardown was requested.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{error, info};

use emberwake_protocol::framing::{read_message, write_message};
use emberwake_protocol::message::{ClientMessage, ServerMessage};

use crate::error::SessionError;
use crate::lock_or_recover;

/// Fixed interval between connection attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Cancellation flag with a condvar so waits can be interrupted.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *lock_or_recover(flag) = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *lock_or_recover(flag)
    }

    /// Reset for a new session. Only call with no wait in flight.
    pub fn reset(&self) {
        let (flag, _) = &*self.inner;
        *lock_or_recover(flag) = false;
    }

    /// Wait up to `duration`; returns true if cancelled meanwhile.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let mut cancelled = lock_or_recover(flag);
        let deadline = std::time::Instant::now() + duration;
        while !*cancelled {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _timeout) = match condvar.wait_timeout(cancelled, deadline - now) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            cancelled = guard;
        }
        *cancelled
    }
}

/// Write half of the connection plus liveness tracking.
pub struct ServerChannel {
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
    alive: AtomicBool,
}

/// Read half, owned exclusively by the network thread.
pub struct MessageReader {
    reader: BufReader<TcpStream>,
}

impl MessageReader {
    /// Block until the next message arrives or the transport fails.
    pub fn recv(&mut self) -> io::Result<ServerMessage> {
        read_message(&mut self.reader)
    }
}

impl ServerChannel {
    /// Establish a connection, retrying with the fixed backoff until it
    /// succeeds or `cancel` fires. Connection failure is never fatal here;
    /// the caller provides cancellation via teardown.
    pub fn connect(
        addr: &str,
        cancel: &CancelToken,
    ) -> Result<(Arc<Self>, MessageReader), SessionError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            info!("establishing connection to {addr}...");
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let read_stream = stream.try_clone()?;
                    let channel = Arc::new(Self {
                        writer: Mutex::new(BufWriter::new(stream.try_clone()?)),
                        stream,
                        alive: AtomicBool::new(true),
                    });
                    let reader = MessageReader {
                        reader: BufReader::new(read_stream),
                    };
                    return Ok((channel, reader));
                }
                Err(e) => {
                    error!(
                        "cannot establish connection to {addr}: {e}; retrying in {} seconds",
                        RETRY_BACKOFF.as_secs()
                    );
                    if cancel.wait_timeout(RETRY_BACKOFF) {
                        return Err(SessionError::Cancelled);
                    }
                }
            }
        }
    }

    /// Typed, length-framed send. A write failure drops the liveness flag.
    pub fn send(&self, msg: &ClientMessage) -> io::Result<()> {
        let mut writer = lock_or_recover(&self.writer);
        let result = write_message(&mut *writer, msg);
        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Shut the socket down. The blocked reader fails out, ending the
    /// network loop.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
