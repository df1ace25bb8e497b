//! Relay chat server - Entry Point
//!
//! Builds the config from an optional JSON file plus command line flags,
//! installs logging and runs the server until `KILL` or Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! relay_chat --host 0.0.0.0 --port 9999 --max-users 20
//! relay_chat --config relay.json --no-log
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_chat::{ChatServer, Config, Encoding, ErrorPolicy};

/// Multi-client TCP relay chat server
#[derive(Parser, Debug)]
#[command(name = "relay_chat")]
#[command(version, about)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPv4 address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent clients (1-100)
    #[arg(long)]
    max_users: Option<usize>,

    /// Bytes per socket read (1024-1048576)
    #[arg(long)]
    buff_size: Option<usize>,

    /// Default text encoding (utf-8, ascii, latin-1)
    #[arg(long)]
    encoding: Option<Encoding>,

    /// Decode error policy (replace, ignore, backslashreplace)
    #[arg(long)]
    encoding_errors: Option<ErrorPolicy>,

    /// Broadcasts kept for DUMP (0 disables)
    #[arg(long)]
    history_size: Option<usize>,

    /// Disable logging
    #[arg(long)]
    no_log: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, relay_chat::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_users) = self.max_users {
            config.max_users = max_users;
        }
        if let Some(buff_size) = self.buff_size {
            config.buff_size = buff_size;
        }
        if let Some(encoding) = self.encoding {
            config.encoding = encoding;
        }
        if let Some(errors) = self.encoding_errors {
            config.encoding_errors = errors;
        }
        if let Some(history_size) = self.history_size {
            config.history_size = history_size;
        }
        if self.no_log {
            config.logging = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;

    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=relay_chat=trace
    let filter = if config.logging {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_chat=info"))
    } else {
        EnvFilter::new("off")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = ChatServer::new(config)?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            handle.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
