//! # Transport Layer
//!
//! Byte-stream plumbing underneath a [`Connection`](crate::service::connection::Connection).
//!
//! ## Components
//! - **Cipher**: password-derived encrypted stream pair and close-suppressing adapter
//! - **TCP**: client-side connect and register over a socket
//! - **File**: unidirectional encrypted persistence
//!
//! Each connection owns one boxed reader and one boxed writer; a half the
//! transport cannot provide is an [`Invalid`] stub that fails every operation.

pub mod cipher;
pub mod file;
pub mod tcp;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Boxed reading half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writing half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stand-in for a stream direction that does not exist.
#[derive(Debug, Clone, Copy)]
pub struct Invalid(&'static str);

impl Invalid {
    pub fn new(reason: &'static str) -> Self {
        Self(reason)
    }

    fn error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, self.0)
    }
}

impl AsyncRead for Invalid {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.error()))
    }
}

impl AsyncWrite for Invalid {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(self.error()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.error()))
    }

    // Nothing to release.
    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
