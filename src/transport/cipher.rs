//! # Password-Derived Cipher Streams
//!
//! Turns a raw reader/writer pair into an encrypted pair keyed from a password, a
//! combined 64-byte [`Salt`] and a combined 16-byte [`Iv`].
//!
//! ## Key Schedule
//! ```text
//! master = Argon2id(password, salt)
//! i2r    = HKDF-SHA256(ikm = master, salt = iv, info = PREFIX || "i2r")
//! r2i    = HKDF-SHA256(ikm = master, salt = iv, info = PREFIX || "r2i")
//! ```
//! The initiator seals with `i2r` and opens with `r2i`; the responder does the
//! reverse, so the two directions never share a keystream.
//!
//! ## Stream Format
//! ```text
//! [u32 LE sealed length] [ChaCha20-Poly1305 ciphertext + 16-byte tag] ...
//! ```
//! Plaintext is buffered until flush (or `MAX_CHUNK` bytes) and sealed as one chunk
//! under a per-direction counter nonce.

use crate::config::KdfParams;
use crate::error::{constants, ProtocolError, Result};
use argon2::{Algorithm, Argon2, Version};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the combined salt
pub const SALT_LEN: usize = 64;
/// Length of each peer's salt contribution
pub const SALT_HALF_LEN: usize = SALT_LEN / 2;
/// Length of the combined initialization vector
pub const IV_LEN: usize = 16;
/// Length of each peer's IV contribution
pub const IV_HALF_LEN: usize = IV_LEN / 2;

/// Largest plaintext sealed into a single chunk
pub const MAX_CHUNK: usize = 16 * 1024;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

const KDF_INFO_PREFIX: &[u8] = b"secure-channel/v1/";
const INITIATOR_TO_RESPONDER: &[u8] = b"i2r";
const RESPONDER_TO_INITIATOR: &[u8] = b"r2i";

/// Which end of the handshake a side played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection (client, or file writer)
    Initiator,
    /// Accepted the connection (server, or file reader)
    Responder,
}

/// Combined salt: responder half followed by initiator half.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn from_halves(responder: &[u8; SALT_HALF_LEN], initiator: &[u8; SALT_HALF_LEN]) -> Self {
        let mut combined = [0u8; SALT_LEN];
        combined[..SALT_HALF_LEN].copy_from_slice(responder);
        combined[SALT_HALF_LEN..].copy_from_slice(initiator);
        Self(combined)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

/// Combined IV: responder half followed by initiator half.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    pub fn from_halves(responder: &[u8; IV_HALF_LEN], initiator: &[u8; IV_HALF_LEN]) -> Self {
        let mut combined = [0u8; IV_LEN];
        combined[..IV_HALF_LEN].copy_from_slice(responder);
        combined[IV_HALF_LEN..].copy_from_slice(initiator);
        Self(combined)
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

/// Fill `buf` from the operating system's secure random source.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf)
        .map_err(|e| ProtocolError::CipherFailure(format!("{}: {e}", constants::ERR_RANDOM)))
}

/// Generate a fresh random array.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Wrap `reader` and `writer` into the cipher pair for `role`.
///
/// The derived keys are wiped before this returns; `password` is only borrowed.
pub fn open_pair<R, W>(
    password: &[u8],
    salt: &Salt,
    iv: &Iv,
    role: Role,
    kdf: &KdfParams,
    reader: R,
    writer: W,
) -> Result<(OpenReader<R>, SealWriter<W>)> {
    let master = derive_master(password, salt, kdf)?;
    let i2r = expand(&master, iv, INITIATOR_TO_RESPONDER)?;
    let r2i = expand(&master, iv, RESPONDER_TO_INITIATOR)?;
    let (seal, open) = match role {
        Role::Initiator => (i2r, r2i),
        Role::Responder => (r2i, i2r),
    };
    Ok((OpenReader::new(reader, open), SealWriter::new(writer, seal)))
}

fn derive_master(password: &[u8], salt: &Salt, kdf: &KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = argon2::Params::new(kdf.memory_kib, kdf.iterations, kdf.lanes, Some(KEY_LEN))
        .map_err(|e| key_error(&e))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut master = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(password, salt.as_bytes(), &mut master[..])
        .map_err(|e| key_error(&e))?;
    Ok(master)
}

fn expand(master: &[u8; KEY_LEN], iv: &Iv, label: &[u8]) -> Result<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(&iv.as_bytes()[..]), &master[..]);
    let mut info = Vec::with_capacity(KDF_INFO_PREFIX.len() + label.len());
    info.extend_from_slice(KDF_INFO_PREFIX);
    info.extend_from_slice(label);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut key[..]).map_err(|e| key_error(&e))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
}

fn key_error(e: &dyn std::fmt::Display) -> ProtocolError {
    ProtocolError::CipherFailure(format!("{}: {e}", constants::ERR_KEY_DERIVATION))
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Per-direction counter nonce.
#[derive(Debug, Default)]
struct NonceCounter(u64);

impl NonceCounter {
    fn next(&mut self) -> io::Result<Nonce> {
        let current = self.0;
        self.0 = current
            .checked_add(1)
            .ok_or_else(|| io::Error::other(constants::ERR_NONCE_EXHAUSTED))?;
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&current.to_le_bytes());
        Ok(Nonce::clone_from_slice(&bytes))
    }
}

/// Encrypting writer. Plaintext is sealed on flush.
pub struct SealWriter<W> {
    inner: W,
    cipher: ChaCha20Poly1305,
    nonce: NonceCounter,
    plain: Zeroizing<Vec<u8>>,
    out: Vec<u8>,
    out_pos: usize,
}

impl<W> SealWriter<W> {
    fn new(inner: W, cipher: ChaCha20Poly1305) -> Self {
        Self {
            inner,
            cipher,
            nonce: NonceCounter::default(),
            plain: Zeroizing::new(Vec::with_capacity(256)),
            out: Vec::new(),
            out_pos: 0,
        }
    }

    /// Unwrap the raw writer. Unflushed plaintext is wiped and discarded.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn seal_pending(&mut self) -> io::Result<()> {
        if self.plain.is_empty() {
            return Ok(());
        }
        let nonce = self.nonce.next()?;
        let sealed = self
            .cipher
            .encrypt(&nonce, self.plain.as_slice())
            .map_err(|_| io::Error::other(constants::ERR_SEAL_FAILED))?;
        self.plain.zeroize();

        let len = u32::try_from(sealed.len()).map_err(|_| invalid_data(constants::ERR_CHUNK_TOO_LARGE))?;
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(&sealed);
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> SealWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SealWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if this.plain.len() >= MAX_CHUNK {
            this.seal_pending()?;
            ready!(this.poll_drain(cx))?;
        }
        let n = buf.len().min(MAX_CHUNK - this.plain.len());
        this.plain.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.seal_pending()?;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Decrypting reader.
pub struct OpenReader<R> {
    inner: R,
    cipher: ChaCha20Poly1305,
    nonce: NonceCounter,
    header: [u8; 4],
    header_filled: usize,
    sealed: Vec<u8>,
    sealed_filled: usize,
    plain: Zeroizing<Vec<u8>>,
    plain_pos: usize,
}

impl<R> OpenReader<R> {
    fn new(inner: R, cipher: ChaCha20Poly1305) -> Self {
        Self {
            inner,
            cipher,
            nonce: NonceCounter::default(),
            header: [0u8; 4],
            header_filled: 0,
            sealed: Vec::new(),
            sealed_filled: 0,
            plain: Zeroizing::new(Vec::new()),
            plain_pos: 0,
        }
    }

    /// Unwrap the raw reader. Buffered plaintext is wiped and discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for OpenReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.plain_pos < this.plain.len() {
                let n = buf.remaining().min(this.plain.len() - this.plain_pos);
                buf.put_slice(&this.plain[this.plain_pos..this.plain_pos + n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            while this.header_filled < this.header.len() {
                let mut rb = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                let n = rb.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_filled += n;
            }

            let len = u32::from_le_bytes(this.header) as usize;
            if !(TAG_LEN..=MAX_CHUNK + TAG_LEN).contains(&len) {
                return Poll::Ready(Err(invalid_data(constants::ERR_CHUNK_TOO_LARGE)));
            }
            if this.sealed_filled == 0 {
                this.sealed.resize(len, 0);
            }
            while this.sealed_filled < len {
                let mut rb = ReadBuf::new(&mut this.sealed[this.sealed_filled..len]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                let n = rb.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.sealed_filled += n;
            }

            let nonce = this.nonce.next()?;
            let opened = this
                .cipher
                .decrypt(&nonce, &this.sealed[..len])
                .map_err(|_| invalid_data(constants::ERR_OPEN_FAILED))?;
            this.plain = Zeroizing::new(opened);
            this.plain_pos = 0;
            this.header_filled = 0;
            this.sealed_filled = 0;
        }
    }
}

/// Passes reads and writes through but turns shutdown into a flush, so closing a
/// layered stream leaves the stream underneath open.
#[derive(Debug)]
pub struct Unclosable<T>(T);

impl<T> Unclosable<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Unclosable<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Unclosable<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }
}
