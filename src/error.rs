//! # Error Types
//!
//! Error handling for the secure channel.
//!
//! This module defines every failure that can surface from the framed I/O layer,
//! the credential handshakes, the connection object and the accept loop.
//!
//! ## Error Categories
//! - **Transport**: raw socket/file failures, propagated untouched
//! - **Protocol violations**: wrong magic marker, malformed strings, bad lengths
//! - **End-of-stream**: always fatal, carries the number of missing bytes
//! - **Authentication**: unknown user, wrong password, duplicate name
//! - **Lifecycle**: timeouts, closed connections, interrupted servers
//!
//! ## Example Usage
//! ```rust
//! use secure_channel::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn check_marker(actual: i32) -> Result<i32> {
//!     if actual == 7 {
//!         Ok(actual)
//!     } else {
//!         Err(ProtocolError::Mismatch {
//!             actual: actual.into(),
//!             expected: vec![7],
//!         })
//!     }
//! }
//!
//! if let Err(e) = check_marker(3) {
//!     error!(error = %e, "Handshake failed");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_WRITE_ONLY: &str = "Connection is write-only";
    pub const ERR_READ_ONLY: &str = "Connection is read-only";
    pub const ERR_NO_TIMEOUT: &str = "Transport has no timeout capability";

    /// Authentication errors
    pub const ERR_UNKNOWN_USER: &str = "Unknown user";
    pub const ERR_BAD_CREDENTIALS: &str = "Server rejected the credentials";
    pub const ERR_REGISTRATION_DISABLED: &str = "Registration is not enabled on this server";
    pub const ERR_FILE_OWNER: &str = "File was written by a different user";

    /// Cryptographic errors
    pub const ERR_KEY_DERIVATION: &str = "Key derivation failed";
    pub const ERR_SEAL_FAILED: &str = "Encryption failed";
    pub const ERR_OPEN_FAILED: &str = "Decryption failed";
    pub const ERR_NONCE_EXHAUSTED: &str = "Nonce counter exhausted";
    pub const ERR_CHUNK_TOO_LARGE: &str = "Sealed chunk exceeds maximum size";
    pub const ERR_RANDOM: &str = "Secure random source unavailable";

    /// Synchronisation errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all channel operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected end of stream: {missing} bytes missing")]
    UnexpectedEof { missing: usize },

    #[error("Corrupted input: read {actual}, expected one of {expected:?}")]
    Mismatch { actual: i64, expected: Vec<i64> },

    #[error("Corrupted input: {0}")]
    Corrupted(String),

    #[error("Byte value out of range: {0}")]
    ByteOutOfRange(i32),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("User name already taken: {0}")]
    DuplicateName(String),

    #[error("Logged out by a newer session")]
    LoggedOut,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Closed by interrupt")]
    Interrupted,

    #[error("Cipher error: {0}")]
    CipherFailure(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the failure is a timeout on the underlying transport.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProtocolError::Timeout => true,
            ProtocolError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether the failure is user-facing (credentials), as opposed to corruption.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailed(_) | ProtocolError::DuplicateName(_)
        )
    }

    /// Rewrites an I/O level end-of-stream into [`ProtocolError::UnexpectedEof`].
    pub(crate) fn from_read(err: io::Error, missing: usize) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof { missing }
        } else {
            ProtocolError::Io(err)
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
