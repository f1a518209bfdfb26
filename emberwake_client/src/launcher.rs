// Local authority process management.
//
// When a peer hosts locally, the controller spawns `emberwake-server` as a
// child process and waits for its readiness signal before dialing in. The
// signal is a `READY port=<port>` line on the child's stdout — an
// out-of-band channel that also carries the OS-assigned port, since the
// child is started with `--port 0`.
//
// A watcher thread drains the rest of the child's stdout into the log and
// waits on the process, reporting its exit status. A non-zero exit is
// logged as an error; the running session is NOT recovered automatically —
// the transport notices the loss on its own schedule.
//
// Spawn failure (binary missing, no permissions) is a fatal session error,
// never retried.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use uuid::Uuid;

use crate::error::SessionError;

/// Environment override for the authority binary path.
const SERVER_PATH_ENV: &str = "EMBERWAKE_SERVER";

/// Binary name searched next to the current executable, then on PATH.
const SERVER_BINARY: &str = "emberwake-server";

/// A spawned local authority: its port and the thread watching its exit.
pub struct AuthorityProcess {
    port: u16,
    watcher: Option<JoinHandle<()>>,
}

impl AuthorityProcess {
    /// Spawn the authority and block until it signals readiness. Returns
    /// once the child's listener is bound and dialable.
    pub fn spawn(client_uuid: Uuid) -> Result<Self, SessionError> {
        let program = server_binary_path();
        info!("spawning local authority: {}", program.display());

        let mut child = Command::new(&program)
            .arg("--port")
            .arg("0")
            .arg("--run-by-client")
            .arg("--uuid")
            .arg(client_uuid.to_string())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(SessionError::Spawn)?;

        let Some(stdout) = child.stdout.take() else {
            return Err(SessionError::AuthorityNotReady);
        };
        let mut lines = BufReader::new(stdout).lines();

        let port = loop {
            match lines.next() {
                Some(Ok(line)) => {
                    if let Some(rest) = line.strip_prefix("READY port=") {
                        match rest.trim().parse::<u16>() {
                            Ok(port) => break port,
                            Err(_) => {
                                error!("malformed readiness line from authority: {line}");
                                return Err(SessionError::AuthorityNotReady);
                            }
                        }
                    }
                    debug!("authority: {line}");
                }
                Some(Err(e)) => {
                    error!("reading authority stdout failed: {e}");
                    return Err(SessionError::AuthorityNotReady);
                }
                None => {
                    // Child closed stdout without signalling; reap it so it
                    // does not linger as a zombie.
                    reap(&mut child);
                    return Err(SessionError::AuthorityNotReady);
                }
            }
        };
        info!("local authority ready on port {port}");

        let watcher = thread::spawn(move || {
            for line in lines {
                match line {
                    Ok(line) => debug!("authority: {line}"),
                    Err(_) => break,
                }
            }
            match child.wait() {
                Ok(status) if status.success() => info!("local authority exited cleanly"),
                Ok(status) => error!("local authority crashed: {status}"),
                Err(e) => error!("failed to reap local authority: {e}"),
            }
        });

        Ok(Self {
            port,
            watcher: Some(watcher),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the child to exit and the watcher to log its status. Called
    /// during teardown, after the authority was told to shut down.
    pub fn join(mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

fn reap(child: &mut Child) {
    match child.wait() {
        Ok(status) => error!("local authority exited before readiness: {status}"),
        Err(e) => error!("failed to reap local authority: {e}"),
    }
}

/// Resolve the authority binary: env override, sibling of the current
/// executable, then PATH lookup.
fn server_binary_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SERVER_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join(SERVER_BINARY);
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from(SERVER_BINARY)
}
