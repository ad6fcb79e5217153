//! mysqlmux - MySQL Proxy Network Core
//!
//! This is the main entry point for the mysqlmux server.
//! It parses flags, starts the server and waits for Ctrl+C.

use anyhow::Context;
use mysqlmux::config::SystemConfig;
use mysqlmux::net::{FrontendConnection, SessionHandler};
use mysqlmux::protocol::security::verify_native_password;
use mysqlmux::protocol::types::error_code;
use mysqlmux::protocol::{AuthPacket, ErrorPacket};
use mysqlmux::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options
struct Options {
    system: SystemConfig,
    /// Login accepted by the built-in session
    user: String,
    password: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            user: "root".to_string(),
            password: String::new(),
        }
    }
}

impl Options {
    /// Parse options from command-line arguments
    fn from_args() -> Self {
        let mut options = Options::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("mysqlmux version {}", mysqlmux::VERSION);
                    std::process::exit(0);
                }
                "--host" | "-h" | "--port" | "-p" | "--processors" | "--handlers"
                | "--executors" | "--idle-timeout" | "--user" | "-u" | "--password" => {
                    let value = match args.get(i + 1) {
                        Some(value) => value.as_str(),
                        None => fail(&format!("{} requires a value", flag)),
                    };
                    options.apply(flag, value);
                    i += 2;
                }
                _ => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        options
    }

    fn apply(&mut self, flag: &str, value: &str) {
        let system = &mut self.system;
        match flag {
            "--host" | "-h" => system.server_host = value.to_string(),
            "--port" | "-p" => system.server_port = parse(flag, value),
            "--processors" => system.processors = parse::<usize>(flag, value).max(1),
            "--handlers" => system.processor_handler = parse(flag, value),
            "--executors" => system.processor_executor = parse(flag, value),
            "--idle-timeout" => system.idle_timeout = Duration::from_secs(parse(flag, value)),
            "--user" | "-u" => self.user = value.to_string(),
            "--password" => self.password = value.to_string(),
            _ => {}
        }
    }
}

fn parse<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    value
        .parse()
        .unwrap_or_else(|_| fail(&format!("invalid value for {}: {}", flag, value)))
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"
mysqlmux - MySQL Proxy Network Core

USAGE:
    mysqlmux [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>            Port to listen on (default: 8066)
        --processors <N>         Number of processors (default: CPU count)
        --handlers <N>           Handler threads per processor, 0 = inline
        --executors <N>          Executor threads per processor, 0 = inline
        --idle-timeout <SECS>    Close connections idle this long (default: 28800)
    -u, --user <USER>            User accepted by the built-in session (default: root)
        --password <PASSWORD>    Password for that user (default: empty)
    -v, --version                Print version information
        --help                   Print this help message

LOGGING:
    Set RUST_LOG to change the filter, e.g. RUST_LOG=mysqlmux=debug

CONNECTING:
    $ mysql -h 127.0.0.1 -P 8066 -u root
"#
    );
}

/// Accepts one configured login. Routing lives elsewhere, so every query
/// is answered with an error.
struct StandaloneSession {
    user: String,
    password: String,
}

impl SessionHandler for StandaloneSession {
    fn authenticate(&self, auth: &AuthPacket, seed: &[u8]) -> Result<(), ErrorPacket> {
        if auth.user == self.user
            && verify_native_password(self.password.as_bytes(), seed, &auth.password)
        {
            return Ok(());
        }
        Err(ErrorPacket::new(
            error_code::ER_ACCESS_DENIED_ERROR,
            format!("Access denied for user '{}'", auth.user),
        ))
    }

    fn query(&self, conn: &FrontendConnection, sql: &str) -> anyhow::Result<()> {
        let _ = sql;
        conn.write_err_message(
            1,
            error_code::ER_NOT_SUPPORTED_YET,
            "No data node is configured for this query",
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let options = Options::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(version = mysqlmux::VERSION, "mysqlmux starting");

    let server = Server::new(options.system)?;
    server.startup(Arc::new(StandaloneSession {
        user: options.user,
        password: options.password,
    }))?;

    if let Some(addr) = server.local_addr() {
        info!("Ready to accept connections on {}", addr);
    }

    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown signal received, stopping server...");
    server.offline();

    info!("Server shutdown complete");
    Ok(())
}
