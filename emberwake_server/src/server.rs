// TCP server and main event loop for the Emberwake authority.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per peer): call `framing::read_message()` in a
//   loop and send `InternalEvent::MessageFrom` to the main thread. On
//   error/EOF or a `Disconnecting` message, send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `LobbySession`, receives events from the
//   channel, and dispatches them. `recv_timeout` with a short tick lets it
//   notice the stop flag without a separate timer thread.
//
// The main thread is the only writer to peer TCP streams (via the session's
// `send_to`/`broadcast`). Reader threads only read. This avoids concurrent
// read/write on the same `TcpStream`.
//
// Shutdown: a peer that spawned the authority sends `Disconnecting` with
// `shutdown_server` set; the event loop broadcasts `Shutdown` and exits.
// Embedders can also stop the loop via `ServerHandle::stop`.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use uuid::Uuid;

use emberwake_protocol::framing::{read_message, write_message};
use emberwake_protocol::message::{ClientMessage, ServerMessage};
use emberwake_protocol::types::ConnectionId;

use crate::session::LobbySession;

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        connection_id: ConnectionId,
        shutdown_server: bool,
    },
}

/// Handle returned by `start_server` to control the running authority.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the authority to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }

    /// Block until the authority exits on its own (a spawning client asked
    /// for shutdown). Used by the standalone binary.
    pub fn wait(self) {
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting an authority.
pub struct ServerConfig {
    pub port: u16,
    /// When spawned by a client, the UUID that must join first.
    pub expected_client: Option<Uuid>,
    pub max_peers: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3725,
            expected_client: None,
            max_peers: 8,
        }
    }
}

/// Tick for the main loop's `recv_timeout`, bounding stop-flag latency.
const EVENT_TICK: Duration = Duration::from_millis(100);

/// Start the authority on a background thread. Returns a handle for stopping
/// it and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_server(config: ServerConfig) -> std::io::Result<(ServerHandle, std::net::SocketAddr)> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_server(listener, config, keep_running_clone);
    });

    Ok((
        ServerHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main authority loop. Runs until `keep_running` clears or a spawning
/// client requests shutdown.
fn run_server(listener: TcpListener, config: ServerConfig, keep_running: Arc<AtomicBool>) {
    let mut session = LobbySession::new(config.expected_client, config.max_peers);

    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking listener so the accept thread can check keep_running.
    listener.set_nonblocking(true).ok();

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(EVENT_TICK) {
            Ok(event) => {
                if !handle_event(&mut session, event, &tx, &keep_running) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    keep_running.store(false, Ordering::SeqCst);
    info!("authority event loop exiting");
}

/// Dispatch a single event. Returns false when the loop should exit.
fn handle_event(
    session: &mut LobbySession,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) -> bool {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(session, stream, tx, keep_running);
            true
        }
        InternalEvent::MessageFrom {
            connection_id,
            message,
        } => {
            if !session.handle_message(connection_id, message) {
                // Protocol violation: drop the offending peer.
                session.remove_peer(connection_id);
            }
            true
        }
        InternalEvent::Disconnected {
            connection_id,
            shutdown_server,
        } => {
            session.remove_peer(connection_id);
            if shutdown_server {
                info!("spawning client requested shutdown");
                session.announce_shutdown();
                return false;
            }
            true
        }
    }
}

/// Handle a new TCP connection: read the `Connecting` handshake, admit the
/// peer, and spawn a reader thread. Refused peers get a `Refused` reply.
fn handle_new_connection(
    session: &mut LobbySession,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    // Bound the handshake so a silent connection cannot hold a slot.
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });

    let hello: ClientMessage = match read_message(&mut reader) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("handshake read failed: {e}");
            return;
        }
    };

    let ClientMessage::Connecting {
        protocol_version,
        client_uuid,
        player_names,
        mode,
    } = hello
    else {
        warn!("first message was not Connecting, dropping connection");
        return;
    };

    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };

    match session.add_peer(protocol_version, client_uuid, player_names, mode, write_stream) {
        Ok(connection_id) => {
            // Clear the handshake timeout for the long-lived reader loop.
            stream.set_read_timeout(None).ok();

            let tx_reader = tx.clone();
            let keep_running_reader = keep_running.clone();
            thread::spawn(move || {
                reader_loop(reader, connection_id, tx_reader, keep_running_reader);
            });
        }
        Err(reason) => {
            info!("refusing peer: {reason}");
            let refused = ServerMessage::Refused { reason };
            let mut writer = std::io::BufWriter::new(stream);
            let _ = write_message(&mut writer, &refused);
        }
    }
}

/// Reader loop for a single peer. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    connection_id: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_message::<_, ClientMessage>(&mut reader) {
            Ok(ClientMessage::Disconnecting { shutdown_server }) => {
                let _ = tx.send(InternalEvent::Disconnected {
                    connection_id,
                    shutdown_server,
                });
                break;
            }
            Ok(message) => {
                let _ = tx.send(InternalEvent::MessageFrom {
                    connection_id,
                    message,
                });
            }
            Err(_) => {
                // Read error, EOF, or an undecodable (mismatched) message.
                let _ = tx.send(InternalEvent::Disconnected {
                    connection_id,
                    shutdown_server: false,
                });
                break;
            }
        }
    }
}
