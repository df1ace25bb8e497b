//! Multi-client TCP Relay Chat Server Library
//!
//! A line-oriented chat relay built on tokio. Clients send
//! `HEADER[:PAYLOAD]` lines; the server routes them between sessions.
//!
//! # Commands
//! - `USERNAME:<name>` - set a display name (once)
//! - `ENCODING:<name>` / `ENCODING_ERRORS:<policy>` - per-session codec
//! - `MSG:<text>` - broadcast to everyone else
//! - `DM:<id>:<text>` - message one client
//! - `USERS` - list connected clients
//! - `DUMP` - replay recent broadcasts
//! - `KICK:<id>` / `BAN:<id>` - remove a client (ban also blocks its IP)
//! - `QUIT` - disconnect
//! - `KILL` - shut the server down
//!
//! # Architecture
//! - `ChatServer` owns the listener, the accept loop and the `Registry`
//! - Each connection gets a `handler` task (read loop) plus a writer task
//! - The `Registry` is a mutex-guarded table; broadcasts iterate a snapshot
//!   so the lock is never held across a network write
//! - `Dispatcher` turns decoded frames into registry/delivery effects
//!
//! # Example
//! ```ignore
//! use relay_chat::{ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::new(Config::default()).unwrap();
//!     let handle = server.handle();
//!     tokio::spawn(server.run());
//!     // ... later
//!     handle.shutdown();
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod history;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use codec::{Codec, Encoding, ErrorPolicy};
pub use config::{AdminPolicy, Config};
pub use dispatcher::{Dispatcher, Flow};
pub use error::{ConfigError, ProtocolError, RegistryError, SendError, ServerError};
pub use handler::handle_connection;
pub use message::{ErrorCode, Frame, Header, ServerMessage};
pub use registry::Registry;
pub use server::{ChatServer, ServerHandle};
pub use session::{Connection, Session};
pub use types::{ClientId, ServerState};
