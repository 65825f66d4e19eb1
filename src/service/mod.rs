//! # Service Layer
//!
//! The established [`Connection`](connection::Connection) and the
//! [`Server`](server::Server) that accepts, authenticates and tracks them.

pub mod connection;
pub mod server;
