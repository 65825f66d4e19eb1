//! Framed I/O primitives.
//!
//! The alphabet every other layer is written in: fixed-width little-endian
//! integers, single bytes, length-prefixed UTF-8 strings and raw arrays.
//!
//! ## Wire Format
//! ```text
//! int    [i32 LE]
//! long   [i64 LE]
//! byte   [u8]
//! string [i32 LE byte length] [UTF-8 bytes]
//! arr    [caller-sized bytes]
//! ```
//!
//! Writes are flushed one by one so that message order is exactly call order and a
//! sealing writer underneath emits each message without batching.

use crate::config::MAX_STRING_LEN;
use crate::core::validate::MismatchHandler;
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, Zeroizing};

/// Reading half of the framed alphabet.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_string_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_string_len(inner, MAX_STRING_LEN)
    }

    /// Reader that rejects length prefixes above `max_string_len`.
    pub fn with_max_string_len(inner: R, max_string_len: usize) -> Self {
        Self {
            inner,
            max_string_len,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely, looping over short reads.
    ///
    /// # Errors
    /// [`ProtocolError::UnexpectedEof`] with the number of bytes still missing
    /// when the stream ends first.
    pub async fn read_arr(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|e| ProtocolError::from_read(e, buf.len() - filled))?;
            if n == 0 {
                return Err(ProtocolError::UnexpectedEof {
                    missing: buf.len() - filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Read a fixed-size array.
    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_arr(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_int(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_long(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_byte(&mut self) -> Result<u8> {
        let [byte] = self.read_array::<1>().await?;
        Ok(byte)
    }

    pub async fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_prefixed().await?;
        String::from_utf8(bytes)
            .map_err(|e| ProtocolError::Corrupted(format!("invalid UTF-8 string: {e}")))
    }

    /// Read a string holding secret material; every intermediate buffer is wiped.
    pub async fn read_secret(&mut self) -> Result<Zeroizing<String>> {
        let bytes = self.read_prefixed().await?;
        match String::from_utf8(bytes) {
            Ok(secret) => Ok(Zeroizing::new(secret)),
            Err(e) => {
                let mut raw = e.into_bytes();
                raw.zeroize();
                Err(ProtocolError::Corrupted("invalid UTF-8 secret".into()))
            }
        }
    }

    async fn read_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.read_int().await?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::Corrupted(format!("negative string length {len}")))?;
        if len > self.max_string_len {
            return Err(ProtocolError::Corrupted(format!(
                "string length {len} exceeds limit {}",
                self.max_string_len
            )));
        }
        let mut bytes = vec![0u8; len];
        if let Err(e) = self.read_arr(&mut bytes).await {
            bytes.zeroize();
            return Err(e);
        }
        Ok(bytes)
    }

    /// Read an int that must equal `expected`.
    pub async fn read_int_expect(
        &mut self,
        expected: i32,
        handler: &dyn MismatchHandler,
    ) -> Result<i32> {
        self.read_int_one_of(&[expected], handler).await
    }

    /// Read an int that must be `a` or `b`.
    pub async fn read_int_either(
        &mut self,
        a: i32,
        b: i32,
        handler: &dyn MismatchHandler,
    ) -> Result<i32> {
        self.read_int_one_of(&[a, b], handler).await
    }

    /// Read an int that must be one of `accepted`.
    pub async fn read_int_one_of(
        &mut self,
        accepted: &[i32],
        handler: &dyn MismatchHandler,
    ) -> Result<i32> {
        let value = match self.read_int().await {
            Err(ProtocolError::UnexpectedEof { missing }) => {
                return Err(handler.end_of_stream(missing))
            }
            other => other?,
        };
        if accepted.contains(&value) {
            return Ok(value);
        }
        let candidates: Vec<i64> = accepted.iter().map(|v| i64::from(*v)).collect();
        let resolved = reconcile(&candidates, i64::from(value), handler)?;
        i32::try_from(resolved)
            .map_err(|_| ProtocolError::Corrupted(format!("reconciled value {resolved} is not an int")))
    }

    /// Read a byte that must equal `expected`.
    pub async fn read_byte_expect(
        &mut self,
        expected: u8,
        handler: &dyn MismatchHandler,
    ) -> Result<u8> {
        self.read_byte_one_of(&[expected], handler).await
    }

    /// Read a byte that must be `a` or `b`.
    pub async fn read_byte_either(
        &mut self,
        a: u8,
        b: u8,
        handler: &dyn MismatchHandler,
    ) -> Result<u8> {
        self.read_byte_one_of(&[a, b], handler).await
    }

    /// Read a byte that must be one of `accepted`.
    pub async fn read_byte_one_of(
        &mut self,
        accepted: &[u8],
        handler: &dyn MismatchHandler,
    ) -> Result<u8> {
        let value = match self.read_byte().await {
            Err(ProtocolError::UnexpectedEof { missing }) => {
                return Err(handler.end_of_stream(missing))
            }
            other => other?,
        };
        if accepted.contains(&value) {
            return Ok(value);
        }
        let candidates: Vec<i64> = accepted.iter().map(|v| i64::from(*v)).collect();
        let resolved = reconcile(&candidates, i64::from(value), handler)?;
        u8::try_from(resolved)
            .map_err(|_| ProtocolError::Corrupted(format!("reconciled value {resolved} is not a byte")))
    }
}

fn reconcile(candidates: &[i64], actual: i64, handler: &dyn MismatchHandler) -> Result<i64> {
    match candidates {
        [single] => handler.mismatch(*single, actual),
        _ => handler.mismatch_any(candidates, actual),
    }
}

/// Writing half of the framed alphabet.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write raw bytes and flush.
    pub async fn write_arr(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_int(&mut self, value: i32) -> Result<()> {
        self.write_arr(&value.to_le_bytes()).await
    }

    pub async fn write_long(&mut self, value: i64) -> Result<()> {
        self.write_arr(&value.to_le_bytes()).await
    }

    /// Write a single byte; values outside `0..=255` are rejected before anything is sent.
    pub async fn write_byte(&mut self, value: i32) -> Result<()> {
        let byte = u8::try_from(value).map_err(|_| ProtocolError::ByteOutOfRange(value))?;
        self.write_arr(&[byte]).await
    }

    pub async fn write_string(&mut self, value: &str) -> Result<()> {
        let len = prefix_len(value)?;
        let mut frame = BytesMut::with_capacity(4 + value.len());
        frame.put_i32_le(len);
        frame.put_slice(value.as_bytes());
        self.write_arr(&frame).await
    }

    /// Write a string holding secret material; the wire buffer is wiped afterwards.
    pub async fn write_secret(&mut self, value: &str) -> Result<()> {
        let len = prefix_len(value)?;
        let mut frame = Zeroizing::new(Vec::with_capacity(4 + value.len()));
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(value.as_bytes());
        self.write_arr(&frame).await
    }

    /// Flush and shut down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn prefix_len(value: &str) -> Result<i32> {
    i32::try_from(value.len())
        .map_err(|_| ProtocolError::Corrupted(format!("string of {} bytes too long", value.len())))
}
