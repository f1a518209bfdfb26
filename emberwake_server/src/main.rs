// CLI entry point for the Emberwake authority.
//
// Starts the authoritative session server that game clients connect to. The
// authority owns the canonical lobby state and, once the game starts, relays
// the hosting peer's state effects to every client. See `server.rs` for the
// networking architecture and `session.rs` for the session semantics.
//
// Usage:
//   emberwake-server [OPTIONS]
//     --port <PORT>        Listen port (default: 3725, 0 = OS-assigned)
//     --uuid <UUID>        Client UUID allowed to join first
//     --run-by-client      Spawned by a game client: print the READY line
//                          and exit when that client disconnects
//     --max-peers <N>      Max connected peers (default: 8)
//
// Readiness: with --run-by-client the process prints `READY port=<port>` on
// stdout once the listener is bound. The spawning client blocks on that line
// before dialing in.

use std::io::Write;

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use uuid::Uuid;

use emberwake_server::server::{ServerConfig, start_server};

struct Options {
    config: ServerConfig,
    run_by_client: bool,
}

fn main() {
    // Log to stderr: stdout carries the READY line when run by a client.
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Never,
    )
    .expect("logger init");

    let options = parse_args();

    let (handle, addr) = match start_server(options.config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start authority: {e}");
            std::process::exit(1);
        }
    };

    if options.run_by_client {
        // Readiness signal for the spawning client; must reach the pipe
        // before it dials in.
        println!("READY port={}", addr.port());
        let _ = std::io::stdout().flush();
    } else {
        println!("Authority listening on {addr}");
        println!("Press Ctrl+C to stop.");
    }

    // Blocks until a spawning client requests shutdown; a standalone
    // authority runs until the process is killed.
    handle.wait();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching —
/// no clap dependency.
fn parse_args() -> Options {
    let mut options = Options {
        config: ServerConfig::default(),
        run_by_client: false,
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                options.config.port =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--port requires a valid port number");
                        std::process::exit(1);
                    });
            }
            "--uuid" => {
                i += 1;
                let parsed = args.get(i).and_then(|s| Uuid::parse_str(s).ok());
                options.config.expected_client = Some(parsed.unwrap_or_else(|| {
                    eprintln!("--uuid requires a valid UUID");
                    std::process::exit(1);
                }));
            }
            "--run-by-client" => {
                options.run_by_client = true;
            }
            "--max-peers" => {
                i += 1;
                options.config.max_peers =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--max-peers requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn print_usage() {
    println!("Usage: emberwake-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>        Listen port (default: 3725, 0 = OS-assigned)");
    println!("  --uuid <UUID>        Client UUID allowed to join first");
    println!("  --run-by-client      Spawned by a game client; print READY and");
    println!("                       exit when that client disconnects");
    println!("  --max-peers <N>      Max connected peers (default: 8)");
    println!("  --help, -h           Show this help");
}
