//! # Credential Bootstrap Protocol
//!
//! Turns a raw byte stream into an authenticated, encrypted [`Connection`].
//!
//! ## Components
//! - **Magic**: the 4-byte markers that tell protocol states apart
//! - **Handshake**: existing-user login and the responder's dispatch
//! - **Registration**: new-user registration through a temporary tunnel
//!
//! ## Security
//! - Salt and IV are assembled from one random half per peer
//! - No key is derived before both halves are known
//! - Failed handshakes close every stream they opened
//!
//! [`Connection`]: crate::service::connection::Connection

pub mod handshake;
pub mod magic;
pub mod registration;
