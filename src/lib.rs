//! # secure-channel
//!
//! A password-derived, mutually salted encrypted channel between two peers.
//!
//! A client logs in as an existing user, or registers a new one using a shared
//! registration password, over TCP. Both sides contribute half of the salt and
//! IV, derive a per-direction cipher from the user's password and confirm it
//! before the [`Connection`] is handed out. The [`Server`] keeps at most one
//! live connection per user, evicting older sessions with a log-out notice.
//! A unidirectional file-backed variant persists the same framing to disk.
//!
//! ```no_run
//! use secure_channel::{tcp, NetworkConfig, User};
//! use std::sync::Arc;
//!
//! # async fn demo() -> secure_channel::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! let connection = tcp::connect(&config, Arc::new(User::new("ann", "secret"))).await?;
//! connection.write_string("hello").await?;
//! let reply = connection.read_string().await?;
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::unwrap_used, clippy::panic)]

pub mod config;
pub mod core;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClientConfig, KdfParams, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig};
pub use error::{ProtocolError, Result};
pub use identity::{Accounts, User};
pub use protocol::handshake::{HandshakeOutcome, Refusal};
pub use service::connection::Connection;
pub use service::server::{handler, Handler, Server, SessionTable};
pub use transport::{file, tcp};
